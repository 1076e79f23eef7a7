use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::error::{AppError, AppResult, LedgerError};
use crate::ledger::codec::as_u64;

enum AnchorSource {
    /// Re-read on every lookup so anchors can rotate without a restart
    File(PathBuf),
    #[cfg(test)]
    Fixed(HashMap<String, u64>),
}

/// Maps each feed to the standing offer its price pushes continue from
pub struct AnchorBook {
    source: AnchorSource,
}

impl AnchorBook {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: AnchorSource::File(path.into()),
        }
    }

    #[cfg(test)]
    pub fn fixed<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        Self {
            source: AnchorSource::Fixed(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    pub async fn anchor_for(&self, feed: &str) -> AppResult<u64> {
        match &self.source {
            #[cfg(test)]
            AnchorSource::Fixed(map) => map
                .get(feed)
                .copied()
                .ok_or_else(|| LedgerError::MissingAnchor(feed.to_string()).into()),
            AnchorSource::File(path) => {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                    AppError::Config(format!("cannot read offers file {}: {}", path.display(), e))
                })?;
                let map: HashMap<String, Value> = serde_json::from_str(&raw).map_err(|e| {
                    AppError::Config(format!("invalid offers file {}: {}", path.display(), e))
                })?;
                map.get(feed)
                    .and_then(as_u64)
                    .ok_or_else(|| LedgerError::MissingAnchor(feed.to_string()).into())
            }
        }
    }
}
