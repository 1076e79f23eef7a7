use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::error::{AppResult, LedgerError};
use crate::ledger::codec::as_u64;
use crate::ledger::{wallet_path, LedgerReader};

pub const PUSH_PRICE_INVITATION: &str = "PushPrice";

/// A price push found in the wallet update stream
#[derive(Debug, Clone, PartialEq, Eq)]
struct PushAttempt {
    round: u64,
    failed: bool,
}

/// Answers "has this account already submitted for round N on this feed?"
/// from the account's recent wallet updates.
///
/// Only the last `lookback` updates are scanned. A successful submission
/// older than that is invisible, so a very busy wallet can make this report
/// `false` for a round it did submit to. The ledger rejects the duplicate.
pub struct ConflictChecker {
    reader: Arc<dyn LedgerReader>,
    lookback: usize,
}

impl ConflictChecker {
    pub fn new(reader: Arc<dyn LedgerReader>, lookback: usize) -> Self {
        Self { reader, lookback }
    }

    pub async fn has_submitted(&self, account: &str, anchor: u64, target_round: u64) -> AppResult<bool> {
        let history = match self.reader.read_history(&wallet_path(account), self.lookback).await {
            Ok(history) => history,
            // a wallet that never acted has published nothing
            Err(LedgerError::NoData(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let found = scan_for_round(&history, anchor, target_round);
        debug!(
            "Submission check for round {} on offer {}: {} ({} updates scanned)",
            target_round,
            anchor,
            found,
            history.len()
        );
        Ok(found)
    }
}

/// Walk updates newest first. A clean push for the target round means
/// submitted; a clean push for an older round means the account has not
/// reached the target yet.
fn scan_for_round(history: &[Value], anchor: u64, target_round: u64) -> bool {
    for update in history {
        let Some(attempt) = as_push_attempt(update, anchor) else {
            continue;
        };
        if attempt.failed {
            continue;
        }
        if attempt.round == target_round {
            return true;
        }
        if attempt.round < target_round {
            return false;
        }
    }
    false
}

fn as_push_attempt(update: &Value, anchor: u64) -> Option<PushAttempt> {
    if update.get("updated")?.as_str()? != "offerStatus" {
        return None;
    }
    let status = update.get("status")?;
    let spec = status.get("invitationSpec")?;
    if spec.get("invitationMakerName")?.as_str()? != PUSH_PRICE_INVITATION {
        return None;
    }
    if as_u64(spec.get("previousOffer")?)? != anchor {
        return None;
    }
    let round = as_u64(spec.get("invitationArgs")?.get(0)?.get("roundId")?)?;
    let failed = status.get("error").map(|e| !e.is_null()).unwrap_or(false);
    Some(PushAttempt { round, failed })
}
