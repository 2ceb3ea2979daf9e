//! State store error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error type for state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Operation exceeded its time budget.
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// A stored value could not be interpreted.
    #[error("Invalid value for key {key}: {reason}")]
    InvalidValue {
        /// Offending key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            StoreError::Timeout(Duration::ZERO)
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}
