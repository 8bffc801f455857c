//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::journal::JournalError;

/// Result type alias for HTTP handler operations
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Application error types surfaced over HTTP
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Wharf error: {0}")]
    Wharf(#[from] wharf_common::WharfError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Journal(ref e) => {
                tracing::error!("Journal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "A journal error occurred".to_string(),
                )
            }
            AppError::Wharf(ref e) => {
                tracing::error!("Wharf error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
