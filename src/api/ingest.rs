use std::sync::Arc;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::spawn;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::api::models::ResultReport;
use crate::error::AppResult;
use crate::execution::RequestReason;
use crate::oracle::PricePusher;
use crate::state::{PreviousResult, RoundSnapshot, StateRepository};

/// Where a result ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No job matches the report; nothing recorded
    UnknownJob,
    /// Result was not a number; request id recorded
    Invalid,
    /// Price has not moved enough to publish
    Skipped,
    /// This account opened or already closed the target round
    NotEligible { round: u64 },
    /// Push attempted; `confirmed` tells whether it landed
    Pushed { round: u64, confirmed: bool },
}

/// Round a result should be pushed to, derived from the cached round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundPlan {
    pub target: u64,
    pub is_new_round: bool,
    pub eligible: bool,
}

/// Decide whether an ingested result is worth publishing
pub fn should_update(
    prev: &PreviousResult,
    reason: Option<RequestReason>,
    result: i128,
    decimal_places: u32,
    threshold: Decimal,
) -> bool {
    if !prev.has_result() {
        return true;
    }
    match reason {
        Some(RequestReason::Heartbeat) | Some(RequestReason::NewRound) => true,
        Some(RequestReason::Deviation) => {
            let scaled = 10i128
                .checked_pow(decimal_places)
                .and_then(Decimal::from_i128)
                .and_then(|factor| prev.result.checked_mul(factor));
            let (Some(scaled), Some(observed)) = (scaled, Decimal::from_i128(result)) else {
                warn!("Cannot compare {} against cached {} at 10^{}", result, prev.result, decimal_places);
                return true;
            };
            let change = ((observed - scaled) / scaled).abs() * Decimal::ONE_HUNDRED;
            info!("Price change is {}% (result {}, cached {})", change.round_dp(4), result, scaled);
            change > threshold
        }
        None => false,
    }
}

/// Pick the round to push to and whether this account may push there.
///
/// Genesis always pushes. A new round may be pushed unless this account
/// started the cached one; the cached round may be pushed unless this
/// account already submitted to it.
pub fn plan_round(last_reported: u64, cached: Option<&RoundSnapshot>, account: &str) -> RoundPlan {
    let cached_id = cached.map(|r| r.round_id).unwrap_or(last_reported);
    let target = if last_reported < cached_id { cached_id } else { cached_id + 1 };
    let is_new_round = target != cached_id;

    let started_by_us = cached.map(|r| r.started_by == account).unwrap_or(false);
    let submitted = cached.map(|r| r.submission_made).unwrap_or(false);
    let eligible = target == 1 || (is_new_round && !started_by_us) || (!is_new_round && !submitted);

    RoundPlan {
        target,
        is_new_round,
        eligible,
    }
}

/// Processes executor results after the HTTP ack has gone out
pub struct ResultIngestor {
    state: Arc<StateRepository>,
    pusher: Arc<PricePusher>,
    account: String,
    decimal_places: u32,
    deviation_threshold: Decimal,
}

impl ResultIngestor {
    pub fn new(
        state: Arc<StateRepository>,
        pusher: Arc<PricePusher>,
        account: impl Into<String>,
        decimal_places: u32,
        deviation_threshold: Decimal,
    ) -> Self {
        Self {
            state,
            pusher,
            account: account.into(),
            decimal_places,
            deviation_threshold,
        }
    }

    /// Queue a report for background processing and return immediately
    pub fn accept(self: &Arc<Self>, report: ResultReport) -> JoinHandle<()> {
        let ingestor = self.clone();
        spawn(async move {
            if let Err(e) = ingestor.process(report).await {
                error!("Result ingestion failed: {}", e);
            }
        })
    }

    #[instrument(skip(self, report), fields(job = ?report.job_name, request_id = ?report.request_id))]
    pub async fn process(&self, report: ResultReport) -> AppResult<IngestOutcome> {
        let snapshot = self.state.snapshot().await?;
        let job = report
            .job_name
            .as_deref()
            .and_then(|name| snapshot.job(name))
            .or_else(|| {
                report
                    .external_job_id
                    .as_deref()
                    .and_then(|id| snapshot.job_by_external_id(id))
            });
        let Some(job) = job.cloned() else {
            warn!(
                "Result for unknown job {:?}/{:?} ignored",
                report.job_name, report.external_job_id
            );
            return Ok(IngestOutcome::UnknownJob);
        };
        let prev = snapshot
            .previous_results
            .get(&job.name)
            .cloned()
            .unwrap_or_else(|| PreviousResult::new(&job.external_job_id));

        info!("⚙️ Processing result {:?} for {} ({:?})", report.result, job.name, report.reason);

        let Some(result) = report.result else {
            warn!("Non-numeric result for {}, nothing to push", job.name);
            self.record_request(&job.name, report.request_id).await?;
            return Ok(IngestOutcome::Invalid);
        };

        if !should_update(&prev, report.reason, result, self.decimal_places, self.deviation_threshold) {
            info!("No update needed for {}", job.name);
            self.record_request(&job.name, report.request_id).await?;
            return Ok(IngestOutcome::Skipped);
        }

        let plan = plan_round(job.last_reported_round, prev.round.as_ref(), &self.account);
        if !plan.eligible {
            info!(
                "Already started or submitted to round {} on {}, not pushing",
                plan.target, job.name
            );
            self.record_request(&job.name, report.request_id).await?;
            return Ok(IngestOutcome::NotEligible { round: plan.target });
        }

        info!("Updating {} for round {}", job.name, plan.target);
        let confirmed = match self.pusher.push(result, &job.name, plan.target, &self.account).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                error!("❌ Push for {} round {} failed: {}", job.name, plan.target, e);
                false
            }
        };

        let request_id = report.request_id;
        let name = job.name.clone();
        let target = plan.target;
        self.state
            .update(move |snap| {
                // a job deleted mid-push stays deleted
                let Some((job, prev)) = snap.entry_mut(&name) else {
                    return;
                };
                if confirmed && job.advance_round(target) {
                    info!("✓ {} watermark now round {}", name, target);
                }
                if let Some(request_id) = request_id {
                    prev.record_request(request_id);
                }
            })
            .await?;

        Ok(IngestOutcome::Pushed {
            round: plan.target,
            confirmed,
        })
    }

    async fn record_request(&self, job_name: &str, request_id: Option<u64>) -> AppResult<()> {
        let Some(request_id) = request_id else {
            return Ok(());
        };
        self.state
            .update(|snap| {
                if let Some(prev) = snap.previous_results.get_mut(job_name) {
                    prev.record_request(request_id);
                }
            })
            .await?;
        Ok(())
    }
}
