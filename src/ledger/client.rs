use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::LedgerError;
use crate::ledger::codec::{self, CapData, StreamCell};

/// Read side of the ledger
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Latest decoded value published at `path`
    async fn read_latest(&self, path: &str) -> Result<Value, LedgerError>;

    /// Up to `limit` decoded values published at `path`, newest first
    async fn read_history(&self, path: &str, limit: usize) -> Result<Vec<Value>, LedgerError>;
}

/// Signed-transaction submission
#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    /// Submit a wallet action on behalf of `signer`. Returns the tx hash when known.
    async fn submit(&self, action: &CapData, signer: &str) -> Result<Option<String>, LedgerError>;
}

#[derive(Debug, Deserialize)]
struct AbciEnvelope {
    result: AbciResult,
}

#[derive(Debug, Deserialize)]
struct AbciResult {
    response: AbciResponse,
}

#[derive(Debug, Deserialize)]
struct AbciResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    log: String,
    #[serde(default)]
    value: Option<String>,
}

/// vstorage reader over the chain RPC `abci_query` endpoint
pub struct VstorageClient {
    client: Client,
    endpoint: String,
    timeout_secs: u64,
}

impl VstorageClient {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LedgerError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout_secs,
        })
    }

    /// height 0 means the highest block
    fn query_url(&self, path: &str, height: u64) -> String {
        format!(
            "{}/abci_query?path=%22/custom/vstorage/data/{}%22&height={}",
            self.endpoint, path, height
        )
    }
}

fn decode_err(path: &str, e: impl ToString) -> LedgerError {
    LedgerError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl LedgerReader for VstorageClient {
    async fn read_latest(&self, path: &str) -> Result<Value, LedgerError> {
        let cell = self.read_cell(path, 0).await?;
        let last = cell
            .values
            .last()
            .ok_or_else(|| LedgerError::NoData(path.to_string()))?;
        codec::decode_capdata(last).map_err(|e| decode_err(path, e))
    }

    async fn read_history(&self, path: &str, limit: usize) -> Result<Vec<Value>, LedgerError> {
        walk_history(self, path, limit).await
    }
}

/// Source of raw stream cells by block height
#[async_trait]
trait CellReader: Send + Sync {
    /// Cell last written at or below `height`; 0 means the highest block
    async fn read_cell(&self, path: &str, height: u64) -> Result<StreamCell, LedgerError>;
}

#[async_trait]
impl CellReader for VstorageClient {
    async fn read_cell(&self, path: &str, height: u64) -> Result<StreamCell, LedgerError> {
        let url = self.query_url(path, height);
        debug!("🔍 vstorage query {} at height {}", path, height);

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                LedgerError::Timeout(self.timeout_secs)
            } else {
                LedgerError::Transport(e.to_string())
            }
        })?;
        let envelope: AbciEnvelope = response
            .json()
            .await
            .map_err(|e| LedgerError::Transport(format!("bad abci envelope: {}", e)))?;

        let AbciResponse { code, log, value } = envelope.result.response;
        if code != 0 {
            return Err(LedgerError::Query {
                path: path.to_string(),
                code,
                log,
            });
        }

        let encoded = value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| LedgerError::NoData(path.to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| decode_err(path, e))?;
        let text = String::from_utf8(bytes).map_err(|e| decode_err(path, e))?;

        codec::decode_stream_cell(&text).map_err(|e| decode_err(path, e))
    }
}

/// Walk cells from the newest backward collecting up to `limit` values.
/// Pruned or unreadable older heights end the walk with what was collected.
async fn walk_history(
    cells: &dyn CellReader,
    path: &str,
    limit: usize,
) -> Result<Vec<Value>, LedgerError> {
    let mut history = Vec::with_capacity(limit);
    let mut cell = cells.read_cell(path, 0).await?;

    loop {
        for raw in cell.values.iter().rev() {
            if history.len() == limit {
                return Ok(history);
            }
            history.push(codec::decode_capdata(raw).map_err(|e| decode_err(path, e))?);
        }

        if history.len() == limit || cell.block_height <= 1 {
            return Ok(history);
        }

        match cells.read_cell(path, cell.block_height - 1).await {
            Ok(older) if older.block_height < cell.block_height => cell = older,
            Ok(_) => return Ok(history),
            Err(e) => {
                debug!("History walk for {} stopped at {}: {}", path, cell.block_height, e);
                return Ok(history);
            }
        }
    }
}
