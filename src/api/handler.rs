use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use http::StatusCode;
use std::sync::Arc;
use tracing::{info, warn};

use super::ingest::ResultIngestor;
use super::models::*;
use crate::error::AppResult;
use crate::state::{Snapshot, StateRepository};

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<StateRepository>,
    pub ingestor: Arc<ResultIngestor>,
}

/// Executor callback with a job run result
/// POST /adapter
///
/// Acknowledges straight away; pushing on chain happens in the background.
/// Any body, JSON or not, gets the 200/500 answer.
pub async fn adapter_result(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<SuccessResponse>) {
    let report = ResultReport::from_body(&body);
    let valid = report.result.is_some();

    info!(
        "📥 Result for {:?} (request {:?}, type {:?})",
        report.job_name, report.request_id, report.reason
    );
    state.ingestor.accept(report);

    if valid {
        (StatusCode::OK, Json(SuccessResponse { success: true }))
    } else {
        warn!("Rejecting non-numeric result");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(SuccessResponse { success: false }))
    }
}

/// Register a feed job
/// POST /jobs
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> AppResult<Json<SuccessResponse>> {
    validate_body(&request)?;
    let name = request.params.name.trim().to_string();
    let job_id = request.job_id.trim().to_string();

    info!("➕ Registering job {} ({})", name, job_id);
    state
        .state
        .update(|snap| snap.register_job(&name, &job_id))
        .await?;

    Ok(Json(SuccessResponse { success: true }))
}

/// Remove a feed job and its cached results
/// DELETE /jobs/:id
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<SuccessResponse>> {
    let removed = state.state.update(|snap| snap.remove_job(&job_id)).await?;
    match removed {
        Some(job) => info!("➖ Removed job {} ({})", job.name, job_id),
        None => warn!("No job registered under {}", job_id),
    }
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /jobs - current persisted state
pub async fn list_jobs(State(state): State<AppState>) -> AppResult<Json<Snapshot>> {
    Ok(Json(state.state.snapshot().await?))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let snapshot = state.state.snapshot().await?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        jobs: snapshot.jobs.len(),
        timestamp: Utc::now(),
    }))
}
