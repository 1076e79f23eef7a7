use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::error::AppResult;
use crate::execution::RetryPolicy;
use crate::ledger::{AnchorBook, Passable, TransactionSubmitter};
use crate::oracle::conflict::{ConflictChecker, PUSH_PRICE_INVITATION};
use crate::oracle::observer::FeedObserver;

/// Wallet action continuing the feed's anchor offer with a price for `round`
pub fn build_push_action(offer_id: u64, anchor: u64, price: i128, round: u64) -> Passable {
    let args = Passable::record([
        ("unitPrice", Passable::BigInt(price)),
        ("roundId", Passable::Num(round)),
    ]);
    let invitation = Passable::record([
        ("source", Passable::str("continuing")),
        ("previousOffer", Passable::Num(anchor)),
        ("invitationMakerName", Passable::str(PUSH_PRICE_INVITATION)),
        ("invitationArgs", Passable::List(vec![args])),
    ]);
    let offer = Passable::record([
        ("id", Passable::Num(offer_id)),
        ("invitationSpec", invitation),
        ("proposal", Passable::record(Vec::<(String, Passable)>::new())),
    ]);
    Passable::record([("method", Passable::str("executeOffer")), ("offer", offer)])
}

/// Submits prices on chain and confirms they landed
pub struct PricePusher {
    observer: Arc<FeedObserver>,
    checker: Arc<ConflictChecker>,
    submitter: Arc<dyn TransactionSubmitter>,
    anchors: Arc<AnchorBook>,
    retry: RetryPolicy,
    settlement_delay: Duration,
    feed_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PricePusher {
    pub fn new(
        observer: Arc<FeedObserver>,
        checker: Arc<ConflictChecker>,
        submitter: Arc<dyn TransactionSubmitter>,
        anchors: Arc<AnchorBook>,
        retry: RetryPolicy,
        settlement_delay: Duration,
    ) -> Self {
        Self {
            observer,
            checker,
            submitter,
            anchors,
            retry,
            settlement_delay,
            feed_locks: Mutex::new(HashMap::new()),
        }
    }

    fn feed_lock(&self, feed: &str) -> Arc<AsyncMutex<()>> {
        self.feed_locks.lock().entry(feed.to_string()).or_default().clone()
    }

    /// Push `price` for `round` on `feed`. Returns whether a submission from
    /// `account` for that round is confirmed on the ledger.
    ///
    /// Pushes for one feed run one at a time, so two results arriving
    /// together cannot both submit to the same round.
    #[instrument(skip(self))]
    pub async fn push(&self, price: i128, feed: &str, round: u64, account: &str) -> AppResult<bool> {
        let lock = self.feed_lock(feed);
        let _guard = lock.lock().await;

        let anchor = self.anchors.anchor_for(feed).await?;
        if self.checker.has_submitted(account, anchor, round).await? {
            info!("Round {} on {} already has our submission", round, feed);
            return Ok(true);
        }

        let attempts = self.retry.attempts();
        for attempt in 1..=attempts {
            let latest = self.observer.observe_round(feed).await?;
            if latest.round_id > round {
                warn!(
                    "⏭️ Round {} on {} is stale (ledger at {}), abandoning push",
                    round, feed, latest.round_id
                );
                return Ok(false);
            }

            let offer_id = Utc::now().timestamp_millis().max(0) as u64;
            let action = build_push_action(offer_id, anchor, price, round).marshal();
            info!("📤 Submitting {} for round {} on {} (try {}/{})", price, round, feed, attempt, attempts);

            match self.submitter.submit(&action, account).await {
                Ok(Some(tx)) => info!("Broadcast {} for offer {}", tx, offer_id),
                Ok(None) => info!("Broadcast offer {}", offer_id),
                // the transaction may still land; the re-check below decides
                Err(e) => warn!("Submission for round {} on {} failed: {}", round, feed, e),
            }

            if !self.settlement_delay.is_zero() {
                tokio::time::sleep(self.settlement_delay).await;
            }

            if self.checker.has_submitted(account, anchor, round).await? {
                info!("✅ Price {} confirmed for round {} on {}", price, round, feed);
                return Ok(true);
            }
        }

        warn!("❌ Price for round {} on {} not confirmed after {} tries", round, feed, attempts);
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::codec::decode_capdata;
    use crate::test_support::{FakeLedger, ACCOUNT};
    use serde_json::json;

    const ANCHOR: u64 = 1_700_000_000_001;

    fn pusher(ledger: &Arc<FakeLedger>, attempts: u32) -> PricePusher {
        let checker = Arc::new(ConflictChecker::new(ledger.clone(), 10));
        let anchors = Arc::new(AnchorBook::fixed([("ATOM-USD", ANCHOR)]));
        let observer = Arc::new(FeedObserver::new(
            ledger.clone(),
            checker.clone(),
            anchors.clone(),
            ACCOUNT,
        ));
        PricePusher::new(
            observer,
            checker,
            ledger.clone(),
            anchors,
            RetryPolicy::immediate(attempts),
            Duration::ZERO,
        )
    }

    #[test]
    fn test_action_shape() {
        let action = build_push_action(1_700_000_000_500, ANCHOR, 987654, 5).marshal();
        let decoded = decode_capdata(&serde_json::to_string(&action).unwrap()).unwrap();
        assert_eq!(
            decoded,
            json!({
                "method": "executeOffer",
                "offer": {
                    "id": 1_700_000_000_500u64,
                    "invitationSpec": {
                        "source": "continuing",
                        "previousOffer": ANCHOR,
                        "invitationMakerName": "PushPrice",
                        "invitationArgs": [{"unitPrice": 987654, "roundId": 5}]
                    },
                    "proposal": {}
                }
            })
        );
    }

    #[tokio::test]
    async fn test_push_confirms_submission() {
        let ledger = FakeLedger::new();
        ledger.set_round("ATOM-USD", 4, "agoric1other");

        let pushed = pusher(&ledger, 3).push(987654, "ATOM-USD", 5, ACCOUNT).await.unwrap();
        assert!(pushed);
        assert_eq!(ledger.submissions().len(), 1);
        assert_eq!(ledger.submissions()[0], (ANCHOR, 5, 987654));
    }

    #[tokio::test]
    async fn test_second_push_short_circuits() {
        let ledger = FakeLedger::new();
        ledger.set_round("ATOM-USD", 4, "agoric1other");
        let pusher = pusher(&ledger, 3);

        assert!(pusher.push(987654, "ATOM-USD", 5, ACCOUNT).await.unwrap());
        assert!(pusher.push(987654, "ATOM-USD", 5, ACCOUNT).await.unwrap());
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_round_aborts_without_retry() {
        let ledger = FakeLedger::new();
        ledger.set_round("ATOM-USD", 6, "agoric1other");

        let pushed = pusher(&ledger, 5).push(987654, "ATOM-USD", 5, ACCOUNT).await.unwrap();
        assert!(!pushed);
        assert!(ledger.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_round_moving_mid_retry_aborts() {
        let ledger = FakeLedger::new();
        ledger.set_round("ATOM-USD", 5, "agoric1other");
        // first submission never lands and the round closes under us
        ledger.set_landing(false);
        ledger.advance_round_on_submit("ATOM-USD", 6);

        let pushed = pusher(&ledger, 5).push(987654, "ATOM-USD", 5, ACCOUNT).await.unwrap();
        assert!(!pushed);
        assert_eq!(ledger.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_bound() {
        let ledger = FakeLedger::new();
        ledger.set_round("ATOM-USD", 5, "agoric1other");
        ledger.set_landing(false);

        let pushed = pusher(&ledger, 3).push(987654, "ATOM-USD", 5, ACCOUNT).await.unwrap();
        assert!(!pushed);
        assert_eq!(ledger.submissions().len(), 3);
    }
}
