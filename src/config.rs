use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Bridge configuration, read from `BRIDGE_*` environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    pub listen_port: u16,
    pub executor_base_url: String,
    /// Heartbeat period
    pub poll_interval_secs: u64,
    /// Deviation / round watch period
    pub price_query_interval_secs: u64,
    pub decimal_places: u32,
    pub price_deviation_threshold_pct: f64,
    pub submit_retry_count: u32,
    /// Pause between executor retries; 0 retries immediately
    #[serde(default)]
    pub retry_backoff_ms: u64,
    pub ledger_endpoint: String,
    pub state_file_path: PathBuf,
    pub credentials_file_path: PathBuf,
    pub offer_anchor_map_path: PathBuf,
    pub account_identifier: String,
    pub chain_id: String,
    pub cli_binary: String,
    pub keyring_backend: String,
    #[serde(default)]
    pub keyring_home: Option<String>,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub settlement_delay_secs: Option<u64>,
    pub history_lookback: usize,
    pub align_to_minute: bool,
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("listen_port", 3000)?
            .set_default("executor_base_url", "")?
            .set_default("poll_interval_secs", 60)?
            .set_default("price_query_interval_secs", 12)?
            .set_default("decimal_places", 6)?
            .set_default("price_deviation_threshold_pct", 1.0)?
            .set_default("submit_retry_count", 3)?
            .set_default("retry_backoff_ms", 0)?
            .set_default("ledger_endpoint", "http://0.0.0.0:26657")?
            .set_default("state_file_path", "data/middleware_state.json")?
            .set_default("credentials_file_path", "config/ei_credentials.json")?
            .set_default("offer_anchor_map_path", "config/offers.json")?
            .set_default("account_identifier", "")?
            .set_default("chain_id", "agoriclocal")?
            .set_default("cli_binary", "agd")?
            .set_default("keyring_backend", "test")?
            .set_default("request_timeout_secs", 60)?
            .set_default("history_lookback", 10)?
            .set_default("align_to_minute", true)?
            .add_source(config::Environment::with_prefix("BRIDGE").try_parsing(true))
            .build()?;

        settings.try_deserialize()
    }

    /// Reject settings the bridge cannot run with. Startup must stop on error.
    pub fn validate(&self) -> AppResult<()> {
        if self.executor_base_url.trim().is_empty() {
            return Err(AppError::Config("BRIDGE_EXECUTOR_BASE_URL is required".into()));
        }
        reqwest::Url::parse(&self.executor_base_url).map_err(|e| {
            AppError::Config(format!("BRIDGE_EXECUTOR_BASE_URL is not a valid URL: {}", e))
        })?;
        if self.ledger_endpoint.trim().is_empty() {
            return Err(AppError::Config("BRIDGE_LEDGER_ENDPOINT is required".into()));
        }
        reqwest::Url::parse(&self.ledger_endpoint).map_err(|e| {
            AppError::Config(format!("BRIDGE_LEDGER_ENDPOINT is not a valid URL: {}", e))
        })?;
        if self.account_identifier.trim().is_empty() {
            return Err(AppError::Config("BRIDGE_ACCOUNT_IDENTIFIER is required".into()));
        }
        if self.poll_interval_secs == 0 || self.price_query_interval_secs == 0 {
            return Err(AppError::Config("poll intervals must be greater than zero".into()));
        }
        if self.submit_retry_count == 0 {
            return Err(AppError::Config("BRIDGE_SUBMIT_RETRY_COUNT must be at least 1".into()));
        }
        if self.decimal_places > 18 {
            return Err(AppError::Config(format!(
                "BRIDGE_DECIMAL_PLACES must be at most 18, got {}",
                self.decimal_places
            )));
        }
        if self.history_lookback == 0 {
            return Err(AppError::Config("BRIDGE_HISTORY_LOOKBACK must be at least 1".into()));
        }
        self.deviation_threshold()?;
        if self.state_file_path.as_os_str().is_empty() {
            return Err(AppError::Config("BRIDGE_STATE_FILE_PATH is required".into()));
        }
        if self.offer_anchor_map_path.as_os_str().is_empty() {
            return Err(AppError::Config("BRIDGE_OFFER_ANCHOR_MAP_PATH is required".into()));
        }
        Ok(())
    }

    pub fn deviation_threshold(&self) -> AppResult<Decimal> {
        let pct = self.price_deviation_threshold_pct;
        if !pct.is_finite() || pct < 0.0 {
            return Err(AppError::Config(format!(
                "BRIDGE_PRICE_DEVIATION_THRESHOLD_PCT must be a non-negative number, got {}",
                pct
            )));
        }
        Decimal::try_from(pct)
            .map_err(|e| AppError::Config(format!("invalid deviation threshold: {}", e)))
    }

    /// Wait between a submission and the re-check, two blocks and a bit by default
    pub fn settlement_delay_secs(&self) -> u64 {
        self.settlement_delay_secs
            .unwrap_or(self.price_query_interval_secs + 1)
    }
}

/// External initiator credentials presented to the job executor
#[derive(Debug, Deserialize, Clone)]
pub struct Credentials {
    #[serde(rename = "EI_IC_ACCESSKEY")]
    pub access_key: String,
    #[serde(rename = "EI_IC_SECRET")]
    pub secret: String,
}

impl Credentials {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read credentials {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("invalid credentials file {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BridgeConfig {
        BridgeConfig {
            listen_port: 3000,
            executor_base_url: "http://chainlink:6691".into(),
            poll_interval_secs: 60,
            price_query_interval_secs: 12,
            decimal_places: 6,
            price_deviation_threshold_pct: 1.0,
            submit_retry_count: 3,
            retry_backoff_ms: 0,
            ledger_endpoint: "http://0.0.0.0:26657".into(),
            state_file_path: "data/state.json".into(),
            credentials_file_path: "config/ei_credentials.json".into(),
            offer_anchor_map_path: "config/offers.json".into(),
            account_identifier: "agoric1oracle".into(),
            chain_id: "agoriclocal".into(),
            cli_binary: "agd".into(),
            keyring_backend: "test".into(),
            keyring_home: None,
            request_timeout_secs: 60,
            settlement_delay_secs: None,
            history_lookback: 10,
            align_to_minute: true,
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_missing_executor_url_is_fatal() {
        let mut cfg = sample();
        cfg.executor_base_url = String::new();
        assert!(matches!(cfg.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut cfg = sample();
        cfg.submit_retry_count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let mut cfg = sample();
        cfg.price_deviation_threshold_pct = -0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_settlement_delay_defaults_to_query_interval_plus_one() {
        let mut cfg = sample();
        assert_eq!(cfg.settlement_delay_secs(), 13);
        cfg.settlement_delay_secs = Some(0);
        assert_eq!(cfg.settlement_delay_secs(), 0);
    }

    #[test]
    fn test_credentials_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, r#"{"EI_IC_ACCESSKEY":"key","EI_IC_SECRET":"shh"}"#).unwrap();
        let creds = Credentials::load(&path).unwrap();
        assert_eq!(creds.access_key, "key");
        assert_eq!(creds.secret, "shh");
    }
}
