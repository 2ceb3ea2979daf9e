use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the counting window before the circuit opens
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before probing
    pub timeout_seconds: u64,

    /// Probe calls allowed while half-open
    pub half_open_max_calls: u32,

    /// Failure count that raises a warning alert, independent of the trip threshold
    pub alert_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_seconds: 60,
            half_open_max_calls: 1,
            alert_threshold: 3,
        }
    }
}

impl BreakerConfig {
    /// Open-state timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Expiry of the failure counter.
    pub(crate) fn failure_window(&self) -> Duration {
        self.timeout() * 2
    }

    /// Expiry of the state record.
    pub(crate) fn state_ttl(&self) -> Duration {
        self.timeout() * 10
    }

    /// Replaces zero values with the smallest usable ones.
    pub(crate) fn sanitized(mut self) -> Self {
        if self.failure_threshold == 0 {
            tracing::warn!("failure_threshold of 0 would never close; using 1");
            self.failure_threshold = 1;
        }
        if self.half_open_max_calls == 0 {
            tracing::warn!("half_open_max_calls of 0 would never recover; using 1");
            self.half_open_max_calls = 1;
        }
        if self.timeout_seconds == 0 {
            self.timeout_seconds = 1;
        }
        self
    }
}
