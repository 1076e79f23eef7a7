use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AppResult, LedgerError};
use crate::ledger::codec::as_u64;
use crate::ledger::{price_path, round_path, AnchorBook, LedgerReader};
use crate::oracle::conflict::ConflictChecker;
use crate::state::RoundSnapshot;

/// Reads the published price and round for a feed
pub struct FeedObserver {
    reader: Arc<dyn LedgerReader>,
    checker: Arc<ConflictChecker>,
    anchors: Arc<AnchorBook>,
    account: String,
}

impl FeedObserver {
    pub fn new(
        reader: Arc<dyn LedgerReader>,
        checker: Arc<ConflictChecker>,
        anchors: Arc<AnchorBook>,
        account: impl Into<String>,
    ) -> Self {
        Self {
            reader,
            checker,
            anchors,
            account: account.into(),
        }
    }

    /// Latest quoted price, or zero when it cannot be read. Zero means
    /// "nothing new" to every caller.
    pub async fn observe_price(&self, feed: &str) -> Decimal {
        let path = price_path(feed);
        match self.reader.read_latest(&path).await {
            Ok(quote) => match quote_price(&quote) {
                Some(price) => {
                    debug!("📈 {} quoted at {}", feed, price);
                    price
                }
                None => {
                    warn!("Unusable price quote for {}: {}", feed, quote);
                    Decimal::ZERO
                }
            },
            Err(e) => {
                warn!("Price read for {} failed: {}", feed, e);
                Decimal::ZERO
            }
        }
    }

    /// Latest round and whether this account already submitted to it.
    /// Read failures propagate.
    pub async fn observe_round(&self, feed: &str) -> AppResult<RoundSnapshot> {
        let path = round_path(feed);
        let raw = self.reader.read_latest(&path).await?;

        let round_id = raw
            .get("roundId")
            .and_then(as_u64)
            .ok_or_else(|| LedgerError::Decode {
                path: path.clone(),
                message: "missing roundId".to_string(),
            })?;
        let started_by = raw
            .get("startedBy")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let anchor = self.anchors.anchor_for(feed).await?;
        let submission_made = self
            .checker
            .has_submitted(&self.account, anchor, round_id)
            .await?;

        Ok(RoundSnapshot {
            round_id,
            started_by,
            submission_made,
        })
    }
}

/// `amountOut / amountIn` of a price quote
fn quote_price(quote: &Value) -> Option<Decimal> {
    let amount_in = as_u64(quote.get("amountIn")?.get("value")?)?;
    let amount_out = as_u64(quote.get("amountOut")?.get("value")?)?;
    if amount_in == 0 {
        return None;
    }
    Decimal::from(amount_out).checked_div(Decimal::from(amount_in))
}
