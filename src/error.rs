use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Top-level error type for the entire bridge
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Ledger read/submit errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Query for {path} failed with code {code}: {log}")]
    Query { path: String, code: i64, log: String },

    #[error("Ledger unreachable: {0}")]
    Transport(String),

    #[error("No data published at {0}")]
    NoData(String),

    #[error("Malformed ledger value at {path}: {message}")]
    Decode { path: String, message: String },

    #[error("No anchor offer configured for feed {0}")]
    MissingAnchor(String),

    #[error("Transaction submission failed: {0}")]
    Submit(String),

    #[error("Ledger call timed out after {0}s")]
    Timeout(u64),
}

/// State snapshot persistence errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("State serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("State file path has no parent directory: {0}")]
    NoParentDirectory(String),
}

impl StateError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Job executor request errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Executor rejected run for job {job_id}: HTTP {status}")]
    Rejected { job_id: String, status: u16 },

    #[error("Executor unreachable for job {job_id}: {message}")]
    Unreachable { job_id: String, message: String },

    #[error("Gave up on job {job_id} after {attempts} attempts")]
    Exhausted { job_id: String, attempts: u32 },
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                msg,
                None,
            ),
            AppError::State(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STATE_ERROR",
                "Failed to persist bridge state".to_string(),
                Some(serde_json::json!({ "cause": e.to_string() })),
            ),
            AppError::Ledger(LedgerError::MissingAnchor(feed)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "MISSING_ANCHOR",
                format!("No anchor offer configured for {}", feed),
                Some(serde_json::json!({ "feed": feed })),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
