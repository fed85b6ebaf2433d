use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

/// Failure modes of the external comp-acquisition collaborator.
/// Always recovered locally by the refresh orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcquisitionError {
    #[error("comp acquisition timed out")]
    Timeout,

    #[error("no sold listings found")]
    NotFound,

    #[error("comp payload could not be parsed: {0}")]
    Parse(String),

    #[error("comp source unreachable: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        AppError::Validation { field, reason: reason.into() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Persistence(_) | AppError::Database(_) | AppError::Migration(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            AppError::Validation { field, .. } => {
                serde_json::json!({ "error": self.to_string(), "field": field })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
