use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// One tracked feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    /// External job id on the executor
    #[serde(rename = "job")]
    pub external_job_id: String,
    /// Strictly increasing per job, one sequence per feed
    pub request_id: u64,
    #[serde(
        default,
        serialize_with = "chrono::serde::ts_milliseconds_option::serialize",
        deserialize_with = "millis_or_float_secs"
    )]
    pub last_request_sent: Option<DateTime<Utc>>,
    /// Watermark: highest round this bridge has closed or reconciled past
    #[serde(default)]
    pub last_reported_round: u64,
}

impl Job {
    pub fn new(name: impl Into<String>, external_job_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            external_job_id: external_job_id.into(),
            request_id: 0,
            last_request_sent: None,
            last_reported_round: 0,
        }
    }

    /// Raise the watermark. Never lowers it.
    pub fn advance_round(&mut self, round: u64) -> bool {
        if round > self.last_reported_round {
            self.last_reported_round = round;
            true
        } else {
            false
        }
    }

    /// Allocate the next request id and stamp the send time
    pub fn next_request(&mut self, now: DateTime<Utc>) -> u64 {
        self.request_id += 1;
        self.last_request_sent = Some(now);
        self.request_id
    }

    pub fn seconds_since_last_request(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_request_sent
            .map(|sent| now.signed_duration_since(sent).num_seconds())
    }
}

/// Round metadata as observed on the ledger at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub round_id: u64,
    pub started_by: String,
    pub submission_made: bool,
}

/// Last observed/ingested values for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousResult {
    #[serde(rename = "id")]
    pub external_job_id: String,
    pub result: Decimal,
    /// Request id of the most recently ingested result
    #[serde(rename = "request_id", default)]
    pub last_request_id: u64,
    #[serde(default, deserialize_with = "round_or_empty", skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundSnapshot>,
}

impl PreviousResult {
    pub fn new(external_job_id: impl Into<String>) -> Self {
        Self {
            external_job_id: external_job_id.into(),
            result: Decimal::ZERO,
            last_request_id: 0,
            round: None,
        }
    }

    /// Note an ingested request. Late results for older requests are ignored.
    pub fn record_request(&mut self, request_id: u64) {
        self.last_request_id = self.last_request_id.max(request_id);
    }

    /// A zero price means nothing has been recorded yet
    pub fn has_result(&self) -> bool {
        self.result > Decimal::ZERO
    }
}

/// Older state files store an unobserved round as `{}`
fn round_or_empty<'de, D>(deserializer: D) -> Result<Option<RoundSnapshot>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Epoch values below this are seconds, at or above it milliseconds
const SECONDS_CUTOFF: f64 = 1e11;

/// Send times are written as epoch milliseconds; older state files carry
/// float seconds
fn millis_or_float_secs<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => return Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("timestamp is not a number"))?,
        Some(other) => {
            return Err(serde::de::Error::custom(format!("invalid timestamp {}", other)))
        }
    };

    let millis = if raw.abs() < SECONDS_CUTOFF { raw * 1000.0 } else { raw };
    DateTime::<Utc>::from_timestamp_millis(millis.round() as i64)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("timestamp {} out of range", raw)))
}

/// The persisted unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub previous_results: BTreeMap<String, PreviousResult>,
}

impl Snapshot {
    pub fn job(&self, name: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.name == name)
    }

    pub fn job_by_external_id(&self, external_job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.external_job_id == external_job_id)
    }

    /// Mutable access to a job together with its previous result
    pub fn entry_mut(&mut self, name: &str) -> Option<(&mut Job, &mut PreviousResult)> {
        let job = self.jobs.iter_mut().find(|j| j.name == name)?;
        let prev = self.previous_results.get_mut(name)?;
        Some((job, prev))
    }

    /// Register a job. Re-registering a name keeps its counters and swaps the
    /// external id, so names stay unique and request ids never reset.
    pub fn register_job(&mut self, name: &str, external_job_id: &str) {
        match self.job_mut(name) {
            Some(existing) => existing.external_job_id = external_job_id.to_string(),
            None => self.jobs.push(Job::new(name, external_job_id)),
        }
        self.previous_results
            .entry(name.to_string())
            .and_modify(|prev| prev.external_job_id = external_job_id.to_string())
            .or_insert_with(|| PreviousResult::new(external_job_id));
    }

    /// Remove a job by external id together with its previous result
    pub fn remove_job(&mut self, external_job_id: &str) -> Option<Job> {
        let index = self
            .jobs
            .iter()
            .position(|j| j.external_job_id == external_job_id)?;
        let job = self.jobs.remove(index);
        self.previous_results.remove(&job.name);
        Some(job)
    }

    /// Re-establish the one-previous-result-per-job invariant.
    /// Returns the number of entries created.
    pub fn ensure_previous_results(&mut self) -> usize {
        let mut created = 0;
        for job in &self.jobs {
            if !self.previous_results.contains_key(&job.name) {
                self.previous_results
                    .insert(job.name.clone(), PreviousResult::new(&job.external_job_id));
                created += 1;
            }
        }
        created
    }
}
