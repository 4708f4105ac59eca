//! # Error Types and Handling
//!
//! This module defines the error type shared by all FluxGate components and
//! its conversion to HTTP responses.
//!
//! ## Error Classification
//!
//! | Variant                  | Kind            | Retryable | HTTP Status         |
//! |--------------------------|-----------------|-----------|---------------------|
//! | `Config`                 | configuration   | no        | 400 Bad Request     |
//! | `InvalidRule`            | configuration   | no        | 400 Bad Request     |
//! | `InvalidArgument`        | programming     | no        | 400 Bad Request     |
//! | `Connection`             | transient       | yes       | 500 Internal Error  |
//! | `Timeout`                | transient       | yes       | 500 Internal Error  |
//! | `Store`                  | operation       | no        | 500 Internal Error  |
//! | `Repository`             | operation       | no        | 500 Internal Error  |
//! | `Serialization`          | operation       | no        | 500 Internal Error  |
//!
//! A rate-limit rejection is never an error: it travels through
//! [`RateLimitResult`](crate::rate_limiter::RateLimitResult) as the primary
//! result value and the filter turns it into a `429 Too Many Requests`.
//!
//! Inside the rate-limit path, connection errors and timeouts degrade to
//! fail-open admission at the filter; configuration and programming errors
//! propagate to the caller.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Error type for all FluxGate operations.
#[derive(Debug, Clone, Error)]
pub enum FluxgateError {
    /// Configuration is invalid or missing. Raised at startup; fatal to the
    /// owning process.
    #[error("configuration error: {0}")]
    Config(String),

    /// A rule or rule set failed validation.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Caller passed an illegal argument. A programming error; never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The coordination store or rule store is unreachable.
    #[error("connection error: {0}")]
    Connection(String),

    /// A store round-trip exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The coordination store returned a malformed or unexpected reply.
    #[error("store operation failed: {0}")]
    Store(String),

    /// The rule repository failed to produce rule documents.
    #[error("rule repository error: {0}")]
    Repository(String),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FluxgateError {
    /// Whether the operation that produced this error may be retried.
    ///
    /// Connection errors and timeouts are transient; everything else is
    /// either a configuration problem or a programming error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FluxgateError::Connection(_) | FluxgateError::Timeout(_))
    }
}

impl IntoResponse for FluxgateError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            FluxgateError::Config(_)
            | FluxgateError::InvalidRule(_)
            | FluxgateError::InvalidArgument(_) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": "invalid_request",
                    "message": self.to_string(),
                }),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "error": "internal_error",
                    "message": "An unexpected error occurred",
                }),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl From<redis::RedisError> for FluxgateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            FluxgateError::Timeout(err.to_string())
        } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            FluxgateError::Connection(err.to_string())
        } else {
            FluxgateError::Store(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FluxgateError {
    fn from(err: serde_json::Error) -> Self {
        FluxgateError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FluxgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(FluxgateError::Connection("refused".into()).is_retryable());
        assert!(FluxgateError::Timeout("5s elapsed".into()).is_retryable());
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        assert!(!FluxgateError::Config("missing uri".into()).is_retryable());
        assert!(!FluxgateError::InvalidRule("no bands".into()).is_retryable());
        assert!(!FluxgateError::InvalidArgument("permits = 0".into()).is_retryable());
        assert!(!FluxgateError::Store("bad reply".into()).is_retryable());
    }

    #[test]
    fn display_includes_cause() {
        let err = FluxgateError::Repository("collection missing".into());
        assert_eq!(err.to_string(), "rule repository error: collection missing");
    }
}
