use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::execution::RequestReason;
use crate::ledger::codec::as_u64;

/// `data` member of the POST /adapter body. Fields stay untyped so a
/// malformed run output is still acknowledged with a definite status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterData {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub request_id: Value,
    #[serde(default)]
    pub request_type: Value,
    /// External job id
    #[serde(default)]
    pub job: Value,
    /// Feed name
    #[serde(default)]
    pub name: Value,
}

/// A job run result ready for ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct ResultReport {
    /// Integer price, `None` when the executor sent something non-numeric
    pub result: Option<i128>,
    pub request_id: Option<u64>,
    pub reason: Option<RequestReason>,
    pub external_job_id: Option<String>,
    pub job_name: Option<String>,
}

impl From<AdapterData> for ResultReport {
    fn from(data: AdapterData) -> Self {
        Self {
            result: parse_result(&data.result),
            request_id: as_u64(&data.request_id),
            reason: as_u64(&data.request_type).and_then(RequestReason::from_code),
            external_job_id: as_text(&data.job),
            job_name: as_text(&data.name),
        }
    }
}

impl ResultReport {
    /// Read a raw POST /adapter body. A body that is not JSON, or a `data`
    /// member that is not an object, gives a report with nothing in it.
    pub fn from_body(body: &[u8]) -> Self {
        let data = serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|mut request| request.get_mut("data").map(Value::take))
            .and_then(|data| serde_json::from_value::<AdapterData>(data).ok())
            .unwrap_or_default();
        Self::from(data)
    }
}

/// Identifiers arrive as strings, occasionally as bare numbers
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric result rounded half away from zero
pub fn parse_result(value: &Value) -> Option<i128> {
    let decimal = match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Decimal::from(i),
            None => Decimal::from_f64(n.as_f64()?)?,
        },
        Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).and_then(Decimal::from_f64))?
        }
        _ => return None,
    };
    decimal
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i128()
}

/// POST /jobs body
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateJobRequest {
    #[serde(rename = "jobId")]
    #[validate(length(min = 1, max = 128, message = "jobId must not be empty"))]
    pub job_id: String,
    #[validate]
    pub params: JobParams,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct JobParams {
    #[validate(length(min = 1, max = 64, message = "name must not be empty"))]
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub jobs: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Run validator rules and flatten field errors into one message
pub fn validate_body<T: Validate>(value: &T) -> AppResult<()> {
    value.validate().map_err(|e| {
        let errors = e
            .errors()
            .iter()
            .map(|(field, kind)| format!("{}: {:?}", field, kind))
            .collect::<Vec<String>>()
            .join("; ");
        AppError::InvalidInput(format!("Validation failed: {}", errors))
    })
}
