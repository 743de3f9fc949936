//! Error taxonomy for the gateway.
//!
//! Every error carries a stable machine-readable code (used in logs and by
//! clients that pattern-match error strings) and preserves the driver-level
//! source for unwrapping. Retryability is a property of the error kind, not
//! of the call site.

use std::time::Duration;
use thiserror::Error;

/// Gateway error kinds.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport or driver-level connect failure. Retryable.
    #[error("CONNECTION_FAILED: {message}")]
    ConnectionFailed {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// The driver rejected the statement. Not retryable.
    #[error("QUERY_FAILED: {message}")]
    QueryFailed {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Socket-level failure on the wire protocol path. Retryable.
    #[error("CONNECTION_FAILED: transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Per-call or per-request deadline exceeded. Retryable.
    #[error("TIMEOUT: operation exceeded {0:?}")]
    Timeout(Duration),

    /// Pre-use validation failed after its retry budget.
    #[error("VALIDATION_FAILED: validation failed after {attempts} attempts")]
    ValidationFailed {
        attempts: u32,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Admission refused by the circuit breaker.
    #[error("CIRCUIT_BREAKER_OPEN: circuit breaker is open")]
    CircuitOpen,

    /// Admission refused by the token bucket.
    #[error("RATE_LIMIT_EXCEEDED: rate limit exceeded")]
    RateLimitExceeded,

    /// Admission refused by the concurrency limiter.
    #[error("CONNECTION_LIMIT_EXCEEDED: connection limit exceeded")]
    ConnectionLimitExceeded,

    /// Retry budget exhausted; wraps the last attempt's error.
    #[error("RETRY_EXHAUSTED: failed after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<GatewayError>,
    },

    /// Commit or rollback failure.
    #[error("TRANSACTION_FAILED: {message}")]
    TransactionFailed {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// Malformed frame, oversize frame, or response-id mismatch.
    #[error("PROTOCOL_ERROR: {0}")]
    Protocol(String),

    /// Frame exceeded the configured maximum request size.
    #[error("REQUEST_TOO_LARGE: request too large: {size} bytes (max {max})")]
    RequestTooLarge { size: u64, max: u64 },

    /// Operation attempted before `connect()` or after `disconnect()`.
    #[error("CONNECTION_FAILED: database not connected")]
    NotConnected,
}

impl GatewayError {
    /// Stable code string for this error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } | Self::Transport(_) | Self::NotConnected => {
                "CONNECTION_FAILED"
            }
            Self::QueryFailed { .. } => "QUERY_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::CircuitOpen => "CIRCUIT_BREAKER_OPEN",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ConnectionLimitExceeded => "CONNECTION_LIMIT_EXCEEDED",
            Self::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            Self::TransactionFailed { .. } => "TRANSACTION_FAILED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::RequestTooLarge { .. } => "REQUEST_TOO_LARGE",
        }
    }

    /// Whether the retry loop may attempt this operation again.
    ///
    /// Gate rejections are deliberately non-retryable at this layer: they
    /// are surfaced to the caller unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::Transport(_)
                | Self::Timeout(_)
                | Self::ValidationFailed { .. }
        )
    }

    /// Whether this error is an admission rejection by the resilience gate.
    #[must_use]
    pub fn is_gate_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen | Self::RateLimitExceeded | Self::ConnectionLimitExceeded
        )
    }

    /// Classify a driver error into a gateway kind.
    ///
    /// I/O, TLS, and pool-level failures are the connection-failure class
    /// (retryable); anything the database itself rejected is `QueryFailed`.
    #[must_use]
    pub fn from_driver(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => Self::ConnectionFailed {
                message: "timed out waiting for a pool connection".into(),
                source: Some(err),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::ConnectionFailed {
                message: "driver connection failure".into(),
                source: Some(err),
            },
            err @ sqlx::Error::Database(_) => {
                let message = err
                    .as_database_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| err.to_string());
                Self::QueryFailed {
                    message,
                    source: Some(err),
                }
            }
            other => {
                let message = other.to_string();
                Self::QueryFailed {
                    message,
                    source: Some(other),
                }
            }
        }
    }
}
