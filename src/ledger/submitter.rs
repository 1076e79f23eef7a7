use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::ledger::client::TransactionSubmitter;
use crate::ledger::codec::CapData;

/// Settings for the chain CLI used to sign and broadcast
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub binary: String,
    pub chain_id: String,
    pub node: String,
    pub keyring_backend: String,
    pub keyring_home: Option<String>,
    pub timeout_secs: u64,
}

/// Submits wallet actions through `<cli> tx swingset wallet-action`
pub struct CliSubmitter {
    config: CliConfig,
}

impl CliSubmitter {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    fn args(&self, action_json: &str, signer: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "tx".into(),
            "swingset".into(),
            "wallet-action".into(),
            "--allow-spend".into(),
            action_json.to_string(),
            "--from".into(),
            signer.to_string(),
            "--keyring-backend".into(),
            self.config.keyring_backend.clone(),
        ];
        if let Some(home) = &self.config.keyring_home {
            args.push("--home".into());
            args.push(home.clone());
        }
        args.extend([
            "--chain-id".to_string(),
            self.config.chain_id.clone(),
            "--node".to_string(),
            self.config.node.clone(),
            "--output".to_string(),
            "json".to_string(),
            "--yes".to_string(),
        ]);
        args
    }
}

/// Pull `txhash` out of the CLI's JSON reply, failing on a non-zero `code`
fn parse_broadcast_reply(stdout: &str) -> Result<Option<String>, LedgerError> {
    let Ok(reply) = serde_json::from_str::<serde_json::Value>(stdout.trim()) else {
        return Ok(None);
    };
    let code = reply.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
    if code != 0 {
        let log = reply
            .get("raw_log")
            .and_then(|l| l.as_str())
            .unwrap_or_default();
        return Err(LedgerError::Submit(format!("broadcast code {}: {}", code, log)));
    }
    Ok(reply
        .get("txhash")
        .and_then(|h| h.as_str())
        .map(str::to_owned))
}

#[async_trait]
impl TransactionSubmitter for CliSubmitter {
    async fn submit(&self, action: &CapData, signer: &str) -> Result<Option<String>, LedgerError> {
        let action_json =
            serde_json::to_string(action).map_err(|e| LedgerError::Submit(e.to_string()))?;
        debug!("Submitting wallet action from {}: {}", signer, action_json);

        let mut cmd = Command::new(&self.config.binary);
        cmd.args(self.args(&action_json, signer)).kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), cmd.output())
            .await
            .map_err(|_| LedgerError::Timeout(self.config.timeout_secs))?
            .map_err(|e| LedgerError::Submit(format!("failed to run {}: {}", self.config.binary, e)))?;

        if !output.status.success() {
            return Err(LedgerError::Submit(format!(
                "{} exited with {}: {}",
                self.config.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let tx_hash = parse_broadcast_reply(&String::from_utf8_lossy(&output.stdout))?;
        info!("📤 Wallet action broadcast (tx: {})", tx_hash.as_deref().unwrap_or("unknown"));
        Ok(tx_hash)
    }
}
