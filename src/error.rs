/// Unified error types for the Aurora relay
use crate::identity::IdentityError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration errors
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// A source's crawl queue is at capacity
    #[error("Crawl queue for {host} is full ({capacity} pending tasks)")]
    Backpressure { host: String, capacity: usize },

    /// Replay cursor older than the retained log
    #[error("Cursor {cursor} is older than the retained event log (oldest available: {oldest})")]
    ExpiredCursor { cursor: i64, oldest: i64 },

    /// Replay cursor beyond the current head
    #[error("Cursor {cursor} is ahead of the current sequence {head}")]
    FutureCursor { cursor: i64, head: i64 },

    /// Request rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Source or domain is banned
    #[error("Host is banned: {0}")]
    Banned(String),

    /// Identity resolution errors
    #[error("Identity resolution error: {0}")]
    Identity(#[from] IdentityError),

    /// Subscriber disconnected for lagging
    #[error("Subscriber fell too far behind and was disconnected")]
    ConsumerTooSlow,

    /// Component is stopping and no longer accepts work
    #[error("Relay is shutting down")]
    ShuttingDown,

    /// Event payload or metadata encoding errors
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// XRPC error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct XrpcErrorResponse {
    pub error: String,
    pub message: String,
}

impl RelayError {
    /// XRPC error name used in HTTP bodies and firehose `#error` frames
    pub fn error_name(&self) -> &'static str {
        match self {
            RelayError::Authentication(_) => "AuthenticationRequired",
            RelayError::Validation(_) => "InvalidRequest",
            RelayError::NotFound(_) => "NotFound",
            RelayError::Backpressure { .. } | RelayError::RateLimitExceeded => "RateLimitExceeded",
            RelayError::ExpiredCursor { .. } => "OutdatedCursor",
            RelayError::FutureCursor { .. } => "FutureCursor",
            RelayError::Banned(_) => "Forbidden",
            RelayError::Identity(_) => "IdentityResolutionFailed",
            RelayError::ConsumerTooSlow => "ConsumerTooSlow",
            RelayError::ShuttingDown => "ServiceUnavailable",
            _ => "InternalServerError",
        }
    }
}

/// Convert RelayError to HTTP response
impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            RelayError::Validation(_)
            | RelayError::ExpiredCursor { .. }
            | RelayError::FutureCursor { .. } => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Backpressure { .. } | RelayError::RateLimitExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            RelayError::Banned(_) => StatusCode::FORBIDDEN,
            RelayError::Identity(_) => StatusCode::BAD_GATEWAY,
            RelayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            RelayError::Database(_)
            | RelayError::Migration(_)
            | RelayError::Io(_)
            | RelayError::Encoding(_)
            | RelayError::Internal(_) => "Internal server error".to_string(), // Don't leak details
            other => other.to_string(),
        };

        let body = Json(XrpcErrorResponse {
            error: self.error_name().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_maps_to_429() {
        let resp = RelayError::Backpressure {
            host: "pds.example.com".to_string(),
            capacity: 10,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_cursor_errors_are_bad_requests() {
        let expired = RelayError::ExpiredCursor { cursor: 1, oldest: 50 };
        assert_eq!(expired.error_name(), "OutdatedCursor");
        assert_eq!(expired.into_response().status(), StatusCode::BAD_REQUEST);

        let future = RelayError::FutureCursor { cursor: 99, head: 10 };
        assert_eq!(future.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = RelayError::Internal("segment checksum mismatch".to_string());
        assert_eq!(err.error_name(), "InternalServerError");
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
