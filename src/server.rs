use std::time::Duration;

use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Router,
};
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::api::handler::{
    adapter_result, create_job, delete_job, health_check, list_jobs, AppState,
};

pub fn create_app(state: AppState, request_timeout: Duration) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        .route("/health", get(health_check))
        // Executor bridge callbacks
        .route("/adapter", post(adapter_result))
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/:id", delete(delete_job))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(request_timeout_layer(request_timeout)),
        )
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

/// Requests running past `timeout` are answered with 408
fn request_timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}

/// Serve until a shutdown message arrives on `shutdown`. Subscribe before any
/// sender can fire so an early signal is not missed.
pub async fn run_server(
    app: Router,
    bind_address: &str,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("Closing listener");
        })
        .await?;
    Ok(())
}
