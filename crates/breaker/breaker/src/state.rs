use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected until the timeout elapses
    Open,
    /// Probe calls test recovery
    HalfOpen,
}

impl CircuitState {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Parses the stored representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(CircuitState::Closed),
            "open" => Some(CircuitState::Open),
            "half_open" => Some(CircuitState::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a breaker, for health checks and monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    /// Dependency name
    pub name: String,
    /// Current state; `None` if the stored value was not recognised
    pub state: Option<CircuitState>,
    /// Failures in the current counting window
    pub failure_count: i64,
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
    /// Probe calls granted in the current half-open period
    pub half_open_calls: i64,
    /// True when calls pass through without probing
    pub is_available: bool,
    /// When the circuit last opened (open state only)
    pub opened_at: Option<DateTime<Utc>>,
    /// Seconds until the circuit probes again (open state only)
    pub retry_in_seconds: Option<u64>,
    /// Lifetime counters (7-day expiry)
    pub statistics: BTreeMap<String, i64>,
    /// True if any value was read from the local fallback
    pub degraded: bool,
}
