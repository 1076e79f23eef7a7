use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{
    api::{handler::AppState, ResultIngestor},
    config::{BridgeConfig, Credentials},
    error::{AppError, AppResult},
    execution::{Dispatcher, HttpJobRunner, RetryPolicy},
    ledger::{AnchorBook, CliConfig, CliSubmitter, VstorageClient},
    oracle::{ConflictChecker, FeedObserver, PricePusher},
    reconcile::{ReconciliationScheduler, ScheduleConfig},
    state::{FileStateStore, StateRepository},
};

/// Everything the process runs
pub struct Bridge {
    pub app_state: AppState,
    pub scheduler: Arc<ReconciliationScheduler>,
}

pub async fn initialize_bridge(config: &BridgeConfig) -> AppResult<Bridge> {
    info!("Initializing bridge components ...");

    // State
    let store = Arc::new(FileStateStore::new(&config.state_file_path));
    info!("✅ State file: {}", store.path().display());
    let state = Arc::new(StateRepository::new(store));
    state.initialise().await?;

    // Ledger access
    let reader = Arc::new(VstorageClient::new(&config.ledger_endpoint, config.request_timeout_secs)?);
    let submitter = Arc::new(CliSubmitter::new(CliConfig {
        binary: config.cli_binary.clone(),
        chain_id: config.chain_id.clone(),
        node: config.ledger_endpoint.clone(),
        keyring_backend: config.keyring_backend.clone(),
        keyring_home: config.keyring_home.clone(),
        timeout_secs: config.request_timeout_secs,
    }));
    let anchors = Arc::new(AnchorBook::from_file(&config.offer_anchor_map_path));
    info!("✅ Ledger client ready at {}", config.ledger_endpoint);

    // Oracle
    let checker = Arc::new(ConflictChecker::new(reader.clone(), config.history_lookback));
    let observer = Arc::new(FeedObserver::new(
        reader,
        checker.clone(),
        anchors.clone(),
        config.account_identifier.clone(),
    ));
    let retry = RetryPolicy::immediate(config.submit_retry_count);
    let pusher = Arc::new(PricePusher::new(
        observer.clone(),
        checker,
        submitter,
        anchors,
        retry,
        Duration::from_secs(config.settlement_delay_secs()),
    ));

    // Executor
    let credentials = Credentials::load(&config.credentials_file_path)?;
    let runner = HttpJobRunner::new(&config.executor_base_url, credentials, config.request_timeout_secs)
        .map_err(|e| AppError::Config(format!("cannot build executor client: {}", e)))?;
    let dispatch_retry = retry.with_backoff(Duration::from_millis(config.retry_backoff_ms));
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(runner), dispatch_retry));
    info!("✅ Executor client ready at {}", config.executor_base_url);

    let deviation_threshold = config.deviation_threshold()?;
    let ingestor = Arc::new(ResultIngestor::new(
        state.clone(),
        pusher,
        config.account_identifier.clone(),
        config.decimal_places,
        deviation_threshold,
    ));

    let scheduler = Arc::new(ReconciliationScheduler::new(
        ScheduleConfig {
            heartbeat_interval: Duration::from_secs(config.poll_interval_secs),
            query_interval: Duration::from_secs(config.price_query_interval_secs),
            deviation_threshold,
            align_to_minute: config.align_to_minute,
        },
        state.clone(),
        observer,
        dispatcher,
    ));

    info!("✓ Bridge components initialized");
    Ok(Bridge {
        app_state: AppState { state, ingestor },
        scheduler,
    })
}
