//! error.rs
//! Error types for the throttle engine and its persistence collaborator.

use thiserror::Error;

use crate::types::TimestampMs;

/// Dimension that caused an admission to be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    /// The requests-per-interval bucket is empty.
    RateLimit,
    /// The consumption-units bucket cannot cover the amount.
    VolumeLimit,
}

impl std::fmt::Display for LimitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitReason::RateLimit => write!(f, "rate limit"),
            LimitReason::VolumeLimit => write!(f, "volume limit"),
        }
    }
}

/// Every error the engine surfaces to its callers.
///
/// Persistence failures are deliberately absent: they stay inside the
/// persistence worker and are only logged.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ThrottleError {
    /// Construction parameters were rejected. Holds every problem found.
    #[error("invalid throttle configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),

    /// A negative amount, an empty request id, or a duplicate request id.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No ledger record exists for the request id being reconciled.
    #[error("no consumption record for request '{request_id}'")]
    NotFound { request_id: String },

    /// Raised by the `*_or_fail` variants and by the strict shortfall strategy.
    #[error("admission denied by {reason}, retry after {retry_after_ms} ms")]
    AdmissionDenied {
        reason: LimitReason,
        retry_after_ms: TimestampMs,
    },

    /// A snapshot or bucket state failed validation. Nothing was modified.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A queued gate waiter was rejected by `drain`.
    #[error("operation cancelled: gate drained before the lock was granted")]
    Cancelled,
}

/// Result alias used throughout the crate.
pub type ThrottleResult<T> = Result<T, ThrottleError>;

/// Failure reported by a [`PersistenceBackend`](crate::persistence::PersistenceBackend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("persistence backend is unavailable")]
    Unavailable,

    #[error("persistence backend failed: {0}")]
    Backend(String),

    #[error("failed to encode or decode persisted state: {0}")]
    Serialization(String),
}
