//! Unified infrastructure error types.
//!
//! Dispatch-path errors live in `relay::error`; this type covers the store,
//! configuration, and admin surface.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// Application-wide error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response structure
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                crate::logger::error("store", &format!("Database error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "Database operation failed")
            }
            AppError::Io(e) => {
                crate::logger::error("store", &format!("IO error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "File operation failed")
            }
            AppError::JsonSerialization(e) => {
                crate::logger::error("store", &format!("JSON error: {}", e));
                (StatusCode::INTERNAL_SERVER_ERROR, "Data serialization failed")
            }
            AppError::Config(msg) => {
                crate::logger::error("config", &format!("Config error: {}", msg));
                (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error")
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            AppError::Internal(msg) => {
                crate::logger::error("server", &format!("Internal error: {}", msg));
                (StatusCode::INTERNAL_SERVER_ERROR, msg.as_str())
            }
        };

        let body = Json(ErrorResponse {
            error: status.as_u16().to_string(),
            message: message.to_string(),
            details: Some(self.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for app operations
pub type AppResult<T> = Result<T, AppError>;
