//! Circuit Breaker Pattern for outbound dependencies
//!
//! Protects a failing dependency and enables auto-recovery:
//! - Closed: Normal operation, requests go through
//! - Open: Too many failures, requests are rejected
//! - Half-Open: Testing recovery, limited probe requests allowed
//!
//! Concurrent instances coordinate only through the store's atomic verbs. Two
//! instances tripping at the same moment both write `opened_at`; the later
//! write wins.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tripwire_core::{Alert, AlertLevel, Alerter, SharedClock, SystemClock, TracingAlerter};
use tripwire_store::{StateStoreAdapter, StoreOutcome};

use crate::config::BreakerConfig;
use crate::error::BreakerError;
use crate::state::{CircuitState, CircuitStatus};

const STATS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Counters reported under `statistics` in [`CircuitStatus`].
const STAT_NAMES: [&str; 7] = [
    "total_calls",
    "successful_calls",
    "failed_calls",
    "rejected_calls",
    "circuit_opens",
    "recoveries",
    "manual_resets",
];

/// Whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

/// Store keys for one breaker.
#[derive(Debug, Clone)]
struct Keys {
    state: String,
    failures: String,
    opened_at: String,
    half_open_calls: String,
    stats: String,
}

impl Keys {
    fn new(name: &str) -> Self {
        let base = format!("circuit_breaker:{name}");
        Self {
            state: format!("{base}:state"),
            failures: format!("{base}:failures"),
            opened_at: format!("{base}:opened_at"),
            half_open_calls: format!("{base}:half_open_calls"),
            stats: format!("{base}:stats"),
        }
    }

    fn stat(&self, stat: &str) -> String {
        format!("{}:{stat}", self.stats)
    }
}

/// Circuit breaker for one named dependency
///
/// Opens when the failure threshold is reached within the counting window,
/// then transitions to half-open after the timeout to test recovery. All
/// state is kept in the shared store, so every instance using the same store
/// and name sees the same circuit.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    keys: Keys,
    store: Arc<StateStoreAdapter>,
    clock: SharedClock,
    alerter: Arc<dyn Alerter>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("backend", &self.store.backend())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a circuit breaker using the system clock and log-only alerts
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        store: Arc<StateStoreAdapter>,
    ) -> Self {
        let name = name.into();
        let config = config.sanitized();

        tracing::info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            timeout_seconds = config.timeout_seconds,
            backend = store.backend(),
            "Circuit breaker initialized"
        );

        Self {
            keys: Keys::new(&name),
            name,
            config,
            store,
            clock: SystemClock::shared(),
            alerter: Arc::new(TracingAlerter),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the alerting collaborator
    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    /// Dependency name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Execute a future with circuit breaker protection
    ///
    /// # Errors
    ///
    /// Returns `BreakerError::Open` without polling `fut` if the circuit rejects the call.
    /// Returns `BreakerError::Inner` if the call ran and failed.
    pub async fn call<Fut, T, E>(&self, fut: Fut) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if let Err(rejected) = self.check().await {
            return Err(rejected.widen());
        }

        match fut.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(e.to_string()).await;
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Check whether a call is allowed, with a retry hint on rejection
    ///
    /// Consumes a probe slot when half-open, exactly like [`Self::can_call`].
    pub async fn check(&self) -> Result<(), BreakerError> {
        match self.admit().await {
            Admission::Allowed => Ok(()),
            Admission::Rejected { retry_after } => Err(BreakerError::Open {
                name: self.name.clone(),
                retry_after,
            }),
        }
    }

    /// Returns true if a call may go ahead. Never fails; on uncertainty the
    /// call is allowed.
    pub async fn can_call(&self) -> bool {
        self.admit().await == Admission::Allowed
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let state = self.store.get(&self.keys.state).await;

        self.store.delete(&self.keys.failures).await;

        if self.parse_state(state.value()) == Some(CircuitState::HalfOpen) {
            self.set_state(CircuitState::Closed).await;
            self.store.delete(&self.keys.opened_at).await;
            tracing::info!(breaker = %self.name, "Recovered from degraded state -> CLOSED");
            self.increment_stat("recoveries").await;
        }

        self.store.delete(&self.keys.half_open_calls).await;

        self.increment_stat("total_calls").await;
        self.increment_stat("successful_calls").await;
    }

    /// Record a failed call
    pub async fn record_failure(&self, error: impl fmt::Display) {
        // Owned so the future stays Send for any error type.
        let error = error.to_string();
        let state = self.store.get(&self.keys.state).await;
        let state = self.parse_state(state.value());

        self.increment_stat("total_calls").await;
        self.increment_stat("failed_calls").await;

        if state == Some(CircuitState::HalfOpen) {
            tracing::warn!(breaker = %self.name, error = %error, "Probe call failed");
            self.open_circuit(&error).await;
            return;
        }

        let failures = self
            .store
            .incr_with_expiry(&self.keys.failures, self.config.failure_window())
            .await
            .into_inner();

        tracing::warn!(
            breaker = %self.name,
            failures,
            threshold = self.config.failure_threshold,
            error = %error,
            "Failure recorded"
        );

        if failures == i64::from(self.config.alert_threshold) {
            self.alert(
                AlertLevel::Warning,
                "Circuit breaker failures rising",
                format!(
                    "{} has failed {} times ({} trips the circuit)",
                    self.name, failures, self.config.failure_threshold
                ),
                json!({ "failures": failures, "last_error": error }),
            )
            .await;
        }

        // Already-open circuits keep their original window.
        if state != Some(CircuitState::Open)
            && failures >= i64::from(self.config.failure_threshold)
        {
            self.open_circuit(&error).await;
        }
    }

    /// Get current circuit breaker status for monitoring
    pub async fn get_status(&self) -> CircuitStatus {
        let state_read = self.store.get(&self.keys.state).await;
        let failures = self.store.get_parsed::<i64>(&self.keys.failures).await;
        let probes = self.store.get_parsed::<i64>(&self.keys.half_open_calls).await;
        let mut degraded =
            state_read.is_degraded() || failures.is_degraded() || probes.is_degraded();

        let state = self.parse_state(state_read.value());

        let mut opened_at = None;
        let mut retry_in_seconds = None;
        if state == Some(CircuitState::Open) {
            let read = self.store.get_parsed::<f64>(&self.keys.opened_at).await;
            degraded |= read.is_degraded();
            if let Some(at) = read.into_inner().and_then(from_unix_seconds) {
                let remaining = self.config.timeout_seconds as f64 - self.elapsed_since(at);
                opened_at = Some(at);
                retry_in_seconds = Some(remaining.max(0.0) as u64);
            }
        }

        let mut statistics = BTreeMap::new();
        for stat in STAT_NAMES {
            let value = self.store.get_parsed::<i64>(&self.keys.stat(stat)).await;
            degraded |= value.is_degraded();
            statistics.insert(stat.to_string(), value.into_inner().unwrap_or(0));
        }

        CircuitStatus {
            name: self.name.clone(),
            state,
            failure_count: failures.into_inner().unwrap_or(0),
            failure_threshold: self.config.failure_threshold,
            timeout_seconds: self.config.timeout_seconds,
            half_open_calls: probes.into_inner().unwrap_or(0),
            is_available: state == Some(CircuitState::Closed),
            opened_at,
            retry_in_seconds,
            statistics,
            degraded,
        }
    }

    /// Manually reset circuit breaker to CLOSED state
    pub async fn reset(&self) {
        tracing::warn!(breaker = %self.name, "Manual reset -> CLOSED");

        self.set_state(CircuitState::Closed).await;
        self.store.delete(&self.keys.failures).await;
        self.store.delete(&self.keys.opened_at).await;
        self.store.delete(&self.keys.half_open_calls).await;

        self.increment_stat("manual_resets").await;
    }

    async fn admit(&self) -> Admission {
        let read = self.store.get(&self.keys.state).await;

        let state = match read.value() {
            None => return Admission::Allowed,
            Some(raw) => match CircuitState::parse(raw) {
                Some(state) => state,
                None => {
                    tracing::warn!(
                        breaker = %self.name,
                        state = %raw,
                        "Unknown state, allowing call"
                    );
                    return Admission::Allowed;
                }
            },
        };

        match state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => self.admit_open(&read).await,
            CircuitState::HalfOpen => self.admit_half_open().await,
        }
    }

    async fn admit_open(&self, state_read: &StoreOutcome<Option<String>>) -> Admission {
        let opened_at = self.store.get_parsed::<f64>(&self.keys.opened_at).await;

        if !opened_at.same_source(state_read) {
            tracing::debug!(breaker = %self.name, "State read from mixed sources, allowing call");
            return Admission::Allowed;
        }

        // A missing timestamp means its TTL (the timeout) has lapsed.
        let elapsed = opened_at
            .into_inner()
            .and_then(from_unix_seconds)
            .map(|at| self.elapsed_since(at));

        match elapsed {
            Some(elapsed) if elapsed < self.config.timeout_seconds as f64 => {
                let remaining = self.config.timeout_seconds as f64 - elapsed;
                tracing::debug!(
                    breaker = %self.name,
                    retry_in = remaining.ceil() as u64,
                    "OPEN - rejecting call"
                );
                self.increment_stat("rejected_calls").await;
                Admission::Rejected {
                    retry_after: Duration::from_secs_f64(remaining),
                }
            }
            _ => {
                self.set_state(CircuitState::HalfOpen).await;
                // This call is the first probe.
                self.store
                    .set_with_expiry(&self.keys.half_open_calls, "1", self.config.state_ttl())
                    .await;
                tracing::info!(
                    breaker = %self.name,
                    "Timeout expired -> HALF_OPEN (testing recovery)"
                );
                Admission::Allowed
            }
        }
    }

    async fn admit_half_open(&self) -> Admission {
        let granted = self
            .store
            .incr_with_expiry(&self.keys.half_open_calls, self.config.state_ttl())
            .await
            .into_inner();

        if granted <= i64::from(self.config.half_open_max_calls) {
            tracing::debug!(
                breaker = %self.name,
                probe = granted,
                max = self.config.half_open_max_calls,
                "HALF_OPEN - allowing probe call"
            );
            Admission::Allowed
        } else {
            tracing::debug!(breaker = %self.name, "HALF_OPEN - probe budget spent");
            self.increment_stat("rejected_calls").await;
            Admission::Rejected {
                retry_after: self.config.timeout(),
            }
        }
    }

    async fn open_circuit(&self, error: &str) {
        let now = self.clock.now();

        self.set_state(CircuitState::Open).await;
        self.store
            .set_with_expiry(
                &self.keys.opened_at,
                &to_unix_seconds(now),
                self.config.timeout(),
            )
            .await;
        self.store.delete(&self.keys.half_open_calls).await;

        tracing::error!(
            breaker = %self.name,
            timeout_seconds = self.config.timeout_seconds,
            "Threshold exceeded -> OPEN"
        );
        self.increment_stat("circuit_opens").await;

        self.alert(
            AlertLevel::Critical,
            "Circuit breaker opened",
            format!(
                "{} is rejecting calls for {}s",
                self.name, self.config.timeout_seconds
            ),
            json!({
                "opened_at": now.to_rfc3339(),
                "timeout_seconds": self.config.timeout_seconds,
                "last_error": error,
            }),
        )
        .await;
    }

    async fn set_state(&self, state: CircuitState) {
        self.store
            .set_with_expiry(&self.keys.state, state.as_str(), self.config.state_ttl())
            .await;
    }

    async fn increment_stat(&self, stat: &str) {
        self.store.incr_with_expiry(&self.keys.stat(stat), STATS_TTL).await;
    }

    async fn alert(
        &self,
        level: AlertLevel,
        title: &str,
        message: String,
        metadata: serde_json::Value,
    ) {
        let alert = Alert::new(level, format!("circuit_breaker:{}", self.name), title, message)
            .with_metadata(metadata)
            .raised_at(self.clock.now());
        self.alerter.send(alert).await;
    }

    fn parse_state(&self, raw: &Option<String>) -> Option<CircuitState> {
        match raw {
            None => Some(CircuitState::Closed),
            Some(s) => CircuitState::parse(s),
        }
    }

    fn elapsed_since(&self, at: DateTime<Utc>) -> f64 {
        let elapsed = self.clock.now() - at;
        elapsed.num_milliseconds() as f64 / 1000.0
    }
}

fn to_unix_seconds(at: DateTime<Utc>) -> String {
    format!("{:.3}", at.timestamp_millis() as f64 / 1000.0)
}

fn from_unix_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_core::{ManualClock, MemoryAlerter};

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new(
            "stripe_api",
            BreakerConfig::default(),
            Arc::new(StateStoreAdapter::local_only()),
        )
        .with_clock(clock)
        .with_alerter(Arc::new(MemoryAlerter::new()))
    }

    #[tokio::test]
    async fn test_fresh_breaker_is_closed() {
        let breaker = breaker(ManualClock::starting_now());

        assert!(breaker.can_call().await);
        let status = breaker.get_status().await;
        assert_eq!(status.state, Some(CircuitState::Closed));
        assert!(status.is_available);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let breaker = breaker(ManualClock::starting_now());

        for _ in 0..4 {
            breaker.record_failure("timeout").await;
            assert!(breaker.can_call().await);
        }
        breaker.record_failure("timeout").await;

        assert!(!breaker.can_call().await);
        let status = breaker.get_status().await;
        assert_eq!(status.state, Some(CircuitState::Open));
        assert_eq!(status.retry_in_seconds, Some(60));
        assert_eq!(status.statistics["circuit_opens"], 1);
        assert_eq!(status.statistics["rejected_calls"], 1);
    }

    #[tokio::test]
    async fn test_check_reports_retry_after() {
        let clock = ManualClock::starting_now();
        let breaker = breaker(clock.clone());

        for _ in 0..5 {
            breaker.record_failure("503").await;
        }
        clock.advance_secs(20);

        let err = breaker.check().await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(40)));
    }

    #[tokio::test]
    async fn test_missing_opened_at_counts_as_elapsed() {
        let breaker = breaker(ManualClock::starting_now());

        for _ in 0..5 {
            breaker.record_failure("503").await;
        }
        breaker.store.delete(&breaker.keys.opened_at).await;

        assert!(breaker.can_call().await);
        assert_eq!(breaker.get_status().await.state, Some(CircuitState::HalfOpen));
    }

    #[tokio::test]
    async fn test_unknown_state_fails_open() {
        let breaker = breaker(ManualClock::starting_now());
        breaker.store.set(&breaker.keys.state, "melted").await;

        assert!(breaker.can_call().await);
        assert_eq!(breaker.get_status().await.state, None);
    }

    #[tokio::test]
    async fn test_reset_closes_circuit() {
        let breaker = breaker(ManualClock::starting_now());

        for _ in 0..5 {
            breaker.record_failure("503").await;
        }
        breaker.reset().await;

        assert!(breaker.can_call().await);
        let status = breaker.get_status().await;
        assert_eq!(status.state, Some(CircuitState::Closed));
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.statistics["manual_resets"], 1);
    }

    #[tokio::test]
    async fn test_call_records_outcome() {
        let breaker = breaker(ManualClock::starting_now());

        let ok: Result<u32, BreakerError<String>> = breaker.call(async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32, BreakerError<String>> =
            breaker.call(async { Err("declined".to_string()) }).await;
        assert_eq!(err.unwrap_err().into_inner().as_deref(), Some("declined"));

        let status = breaker.get_status().await;
        assert_eq!(status.failure_count, 1);
        assert_eq!(status.statistics["total_calls"], 2);
        assert_eq!(status.statistics["successful_calls"], 1);
    }

    #[tokio::test]
    async fn test_call_not_polled_when_open() {
        let breaker = breaker(ManualClock::starting_now());
        for _ in 0..5 {
            breaker.record_failure("503").await;
        }

        let polled = std::sync::atomic::AtomicBool::new(false);
        let result: Result<(), BreakerError<String>> = breaker
            .call(async {
                polled.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_unix_seconds_round_trip() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let stored = to_unix_seconds(at);
        assert_eq!(stored, "1700000000.123");
        assert_eq!(from_unix_seconds(stored.parse().unwrap()), Some(at));
        assert_eq!(from_unix_seconds(f64::NAN), None);
    }
}
