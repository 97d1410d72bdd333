//! Dispatch-path error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Error kinds surfaced by the dispatch core.
#[derive(Debug, Clone)]
pub enum RelayError {
    /// Malformed JSON or an unknown model with no fuzzy match anywhere.
    BadRequest(String),
    /// Token unknown, expired, or inactive.
    Unauthorized(String),
    /// Token valid but not permitted for any resolved candidate channel.
    Forbidden(String),
    /// All candidates filtered out by cooldown or access control.
    NoCandidate(String),
    /// Every attempted candidate failed; carries the last upstream outcome.
    UpstreamExhausted { status: u16, body: String },
    /// Client closed the connection.
    Cancelled,
    /// Internal relay failure.
    Internal(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            RelayError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            RelayError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            RelayError::NoCandidate(msg) => write!(f, "No candidate: {}", msg),
            RelayError::UpstreamExhausted { status, body } => {
                write!(f, "Upstream exhausted: last status {}, body {}", status, body)
            }
            RelayError::Cancelled => write!(f, "Cancelled by client"),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::NoCandidate(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::UpstreamExhausted { .. } => StatusCode::BAD_GATEWAY,
            // Closest standard status for a gone client.
            RelayError::Cancelled => StatusCode::BAD_REQUEST,
            RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RelayError::BadRequest(_) => "invalid_request",
            RelayError::Unauthorized(_) => "unauthorized",
            RelayError::Forbidden(_) => "forbidden",
            RelayError::NoCandidate(_) => "no_candidate",
            RelayError::UpstreamExhausted { .. } => "upstream_exhausted",
            RelayError::Cancelled => "cancelled",
            RelayError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            RelayError::UpstreamExhausted { status, body } => {
                format!("All upstream attempts failed; last status {}: {}", status, body)
            }
            other => other.to_string(),
        };

        crate::logger::error(
            "relay",
            &format!(
                "Returning error response: status={}, type={}, message={}",
                status.as_u16(),
                self.kind(),
                message
            ),
        );

        (
            status,
            Json(serde_json::json!({
                "error": {
                    "type": self.kind(),
                    "message": message
                }
            })),
        )
            .into_response()
    }
}

/// Result type alias for dispatch operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(RelayError::BadRequest(String::new()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(RelayError::Unauthorized(String::new()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RelayError::Forbidden(String::new()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            RelayError::NoCandidate(String::new()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::UpstreamExhausted { status: 503, body: String::new() }.status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
