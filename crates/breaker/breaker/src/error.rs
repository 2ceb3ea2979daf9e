use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;

/// Error returned by a breaker-guarded call.
#[derive(Debug, Error)]
pub enum BreakerError<E = Infallible> {
    /// The circuit rejected the call without attempting it.
    #[error("circuit breaker '{name}' is open (retry after {}s)", .retry_after.as_secs())]
    Open {
        name: String,
        retry_after: Duration,
    },

    /// The guarded call ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns true if the call was rejected by the breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Retry hint for a rejected call.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BreakerError::Open { retry_after, .. } => Some(*retry_after),
            BreakerError::Inner(_) => None,
        }
    }

    /// Returns the inner error, if the call ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl BreakerError<Infallible> {
    /// Converts a rejection into a rejection for any call error type.
    pub fn widen<E>(self) -> BreakerError<E> {
        match self {
            BreakerError::Open { name, retry_after } => BreakerError::Open { name, retry_after },
            BreakerError::Inner(never) => match never {},
        }
    }
}
