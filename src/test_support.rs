//! In-process fakes for the ledger and the job executor

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{DispatchError, LedgerError};
use crate::execution::dispatcher::JobRunner;
use crate::execution::RequestReason;
use crate::ledger::codec::{as_i128, as_u64, decode_capdata, CapData};
use crate::ledger::{price_path, round_path, wallet_path, LedgerReader, TransactionSubmitter};

pub const ACCOUNT: &str = "agoric1bridgeoracle";

/// One `offerStatus` wallet update for a price push
pub fn offer_status(anchor: u64, round: u64, error: Option<&str>) -> Value {
    let mut status = json!({
        "id": 1_700_000_000_000u64 + round,
        "invitationSpec": {
            "source": "continuing",
            "previousOffer": anchor,
            "invitationMakerName": "PushPrice",
            "invitationArgs": [{"unitPrice": 1, "roundId": round}]
        },
        "numWantsSatisfied": 1
    });
    if let Some(error) = error {
        status["error"] = json!(error);
    }
    json!({"updated": "offerStatus", "status": status})
}

#[derive(Default)]
struct LedgerInner {
    latest: HashMap<String, Value>,
    /// newest first
    history: HashMap<String, Vec<Value>>,
    submissions: Vec<(u64, u64, i128)>,
    stall: bool,
    round_after_submit: HashMap<String, u64>,
}

/// Ledger holding decoded values in memory. Submissions land in the
/// signer's wallet history unless landing is switched off.
pub struct FakeLedger {
    inner: Mutex<LedgerInner>,
}

impl FakeLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(LedgerInner::default()),
        })
    }

    pub fn set_price(&self, feed: &str, amount_in: u64, amount_out: u64) {
        let quote = json!({
            "amountIn": {"brand": "board0223", "value": amount_in},
            "amountOut": {"brand": "board0074", "value": amount_out}
        });
        self.inner.lock().latest.insert(price_path(feed), quote);
    }

    pub fn set_round(&self, feed: &str, round_id: u64, started_by: &str) {
        let round = json!({"roundId": round_id, "startedAt": 1_700_000_000u64, "startedBy": started_by});
        self.inner.lock().latest.insert(round_path(feed), round);
    }

    pub fn push_history(&self, account: &str, update: Value) {
        self.inner
            .lock()
            .history
            .entry(wallet_path(account))
            .or_default()
            .insert(0, update);
    }

    /// `false` makes every later submission vanish without a trace
    pub fn set_landing(&self, lands: bool) {
        self.inner.lock().stall = !lands;
    }

    /// The feed's round moves to `round` once anything is submitted
    pub fn advance_round_on_submit(&self, feed: &str, round: u64) {
        self.inner
            .lock()
            .round_after_submit
            .insert(feed.to_string(), round);
    }

    /// `(anchor, round, price)` of every submitted push
    pub fn submissions(&self) -> Vec<(u64, u64, i128)> {
        self.inner.lock().submissions.clone()
    }
}

#[async_trait]
impl LedgerReader for FakeLedger {
    async fn read_latest(&self, path: &str) -> Result<Value, LedgerError> {
        self.inner
            .lock()
            .latest
            .get(path)
            .cloned()
            .ok_or_else(|| LedgerError::NoData(path.to_string()))
    }

    async fn read_history(&self, path: &str, limit: usize) -> Result<Vec<Value>, LedgerError> {
        match self.inner.lock().history.get(path) {
            Some(updates) => Ok(updates.iter().take(limit).cloned().collect()),
            None => Err(LedgerError::NoData(path.to_string())),
        }
    }
}

#[async_trait]
impl TransactionSubmitter for FakeLedger {
    async fn submit(&self, action: &CapData, signer: &str) -> Result<Option<String>, LedgerError> {
        let raw = serde_json::to_string(action).unwrap();
        let decoded = decode_capdata(&raw).map_err(LedgerError::Submit)?;
        let spec = &decoded["offer"]["invitationSpec"];
        let anchor = as_u64(&spec["previousOffer"]).unwrap();
        let round = as_u64(&spec["invitationArgs"][0]["roundId"]).unwrap();
        let price = as_i128(&spec["invitationArgs"][0]["unitPrice"]).unwrap();

        let (stall, feeds_to_move) = {
            let mut inner = self.inner.lock();
            inner.submissions.push((anchor, round, price));
            let moves: Vec<(String, u64)> = inner.round_after_submit.drain().collect();
            (inner.stall, moves)
        };
        for (feed, next_round) in feeds_to_move {
            self.set_round(&feed, next_round, "agoric1other");
        }
        if !stall {
            self.push_history(signer, offer_status(anchor, round, None));
        }
        Ok(Some(format!("TX{}", round)))
    }
}

/// Job runner that records deliveries and fails the first `failures` calls
pub struct RecordingRunner {
    failures: u32,
    attempts: AtomicU32,
    delivered: Mutex<Vec<(String, u64, RequestReason)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    pub fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            attempts: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<(String, u64, RequestReason)> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl JobRunner for RecordingRunner {
    async fn send_run(
        &self,
        external_job_id: &str,
        request_id: u64,
        reason: RequestReason,
    ) -> Result<(), DispatchError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(DispatchError::Rejected {
                job_id: external_job_id.to_string(),
                status: 503,
            });
        }
        self.delivered
            .lock()
            .push((external_job_id.to_string(), request_id, reason));
        Ok(())
    }
}
