mod api;
mod bootstrap;
mod config;
mod error;
mod execution;
mod ledger;
mod oracle;
mod reconcile;
mod server;
mod state;

#[cfg(test)]
mod test_support;

use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,oracle_bridge=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting oracle bridge");

    // Configuration errors are fatal
    let config = config::BridgeConfig::from_env().context("loading BRIDGE_* configuration")?;
    config.validate().context("invalid configuration")?;

    let bridge = bootstrap::initialize_bridge(&config)
        .await
        .context("initializing bridge")?;

    let (shutdown_tx, server_shutdown) = broadcast::channel::<()>(1);
    let drivers = bridge.scheduler.start(&shutdown_tx);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("🛑 Shutdown requested");
        let _ = signal_tx.send(());
    });

    let app = server::create_app(
        bridge.app_state,
        Duration::from_secs(config.request_timeout_secs),
    );
    let bind_address = format!("0.0.0.0:{}", config.listen_port);
    server::run_server(app, &bind_address, server_shutdown)
        .await
        .with_context(|| format!("serving on {}", bind_address))?;

    // listener closed on its own: make sure the drivers stop too
    let _ = shutdown_tx.send(());
    for driver in drivers {
        if let Err(e) = driver.await {
            error!("Scheduler driver ended abnormally: {}", e);
        }
    }

    info!("👋 Bridge stopped");
    Ok(())
}
