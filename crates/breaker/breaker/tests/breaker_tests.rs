//! Integration tests for the circuit breaker
//!
//! This test suite covers:
//! - The CLOSED -> OPEN -> HALF_OPEN -> CLOSED cycle
//! - Half-open probe budget
//! - Alerting side effects
//! - State shared between instances and degraded-store behavior
//! - Fail-open when state and timestamp come from different stores
//! - Breaker futures running on spawned tasks

use async_trait::async_trait;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tripwire_breaker::{
    BreakerConfig, BreakerError, BreakerRegistry, CircuitBreaker, CircuitState,
};
use tripwire_core::{AlertLevel, Clock, ManualClock, MemoryAlerter};
use tripwire_store::{
    MemoryStateStore, StateStore, StateStoreAdapter, StoreError, StoreResult,
};

struct Harness {
    clock: Arc<ManualClock>,
    alerter: Arc<MemoryAlerter>,
    breaker: CircuitBreaker,
}

fn harness(config: BreakerConfig) -> Harness {
    let clock = ManualClock::starting_now();
    let alerter = Arc::new(MemoryAlerter::new());
    let breaker = CircuitBreaker::new(
        "stripe_api",
        config,
        Arc::new(StateStoreAdapter::local_only()),
    )
    .with_clock(clock.clone())
    .with_alerter(alerter.clone());

    Harness {
        clock,
        alerter,
        breaker,
    }
}

mod state_machine_tests {
    use super::*;

    #[tokio::test]
    async fn test_open_then_recover() {
        let h = harness(BreakerConfig::default());

        for _ in 0..5 {
            h.breaker.record_failure("connection reset").await;
        }
        assert!(!h.breaker.can_call().await);

        h.clock.advance_secs(60);
        assert!(h.breaker.can_call().await);
        assert_eq!(h.breaker.get_status().await.state, Some(CircuitState::HalfOpen));

        h.breaker.record_success().await;

        let status = h.breaker.get_status().await;
        assert_eq!(status.state, Some(CircuitState::Closed));
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.statistics["recoveries"], 1);
        assert!(h.breaker.can_call().await);
    }

    #[tokio::test]
    async fn test_rejects_until_timeout() {
        let h = harness(BreakerConfig::default());

        for _ in 0..5 {
            h.breaker.record_failure("503").await;
        }

        h.clock.advance_secs(59);
        assert!(!h.breaker.can_call().await);

        h.clock.advance_secs(1);
        assert!(h.breaker.can_call().await);
    }

    #[tokio::test]
    async fn test_probe_budget_is_exact() {
        let h = harness(BreakerConfig {
            half_open_max_calls: 2,
            ..BreakerConfig::default()
        });

        for _ in 0..5 {
            h.breaker.record_failure("503").await;
        }
        h.clock.advance_secs(60);

        // The transitioning call is the first probe.
        assert!(h.breaker.can_call().await);
        assert!(h.breaker.can_call().await);
        assert!(!h.breaker.can_call().await);
        assert!(!h.breaker.can_call().await);
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_with_fresh_window() {
        let h = harness(BreakerConfig::default());

        for _ in 0..5 {
            h.breaker.record_failure("503").await;
        }
        h.clock.advance_secs(60);
        assert!(h.breaker.can_call().await);

        h.breaker.record_failure("still down").await;

        let status = h.breaker.get_status().await;
        assert_eq!(status.state, Some(CircuitState::Open));
        assert_eq!(status.retry_in_seconds, Some(60));
        assert!(!h.breaker.can_call().await);

        h.clock.advance_secs(60);
        assert!(h.breaker.can_call().await);
    }

    #[tokio::test]
    async fn test_success_on_closed_only_zeroes_counters() {
        let h = harness(BreakerConfig::default());

        h.breaker.record_failure("503").await;
        h.breaker.record_failure("503").await;
        h.breaker.record_success().await;
        h.breaker.record_success().await;

        let status = h.breaker.get_status().await;
        assert_eq!(status.state, Some(CircuitState::Closed));
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.statistics["recoveries"], 0);

        // Counting starts over after the reset.
        for _ in 0..4 {
            h.breaker.record_failure("503").await;
        }
        assert!(h.breaker.can_call().await);
    }

    #[tokio::test]
    async fn test_failures_while_open_keep_window() {
        let h = harness(BreakerConfig::default());

        for _ in 0..5 {
            h.breaker.record_failure("503").await;
        }
        h.clock.advance_secs(30);
        h.breaker.record_failure("late failure").await;

        assert_eq!(h.breaker.get_status().await.retry_in_seconds, Some(30));
    }
}

mod alert_tests {
    use super::*;

    #[tokio::test]
    async fn test_alert_threshold_then_open_alert() {
        let h = harness(BreakerConfig::default());

        for _ in 0..2 {
            h.breaker.record_failure("503").await;
        }
        assert!(h.alerter.alerts().await.is_empty());

        h.breaker.record_failure("503").await;
        assert_eq!(h.alerter.count_at(AlertLevel::Warning).await, 1);
        assert_eq!(h.alerter.count_at(AlertLevel::Critical).await, 0);

        h.breaker.record_failure("503").await;
        h.breaker.record_failure("503").await;

        let alerts = h.alerter.alerts().await;
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[1].level, AlertLevel::Critical);
        assert_eq!(alerts[1].source, "circuit_breaker:stripe_api");
    }

    #[tokio::test]
    async fn test_alerts_stamped_with_breaker_clock() {
        let h = harness(BreakerConfig::default());
        h.clock.advance_secs(-3_600);

        for _ in 0..5 {
            h.breaker.record_failure("503").await;
        }

        let alerts = h.alerter.alerts().await;
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().all(|a| a.raised_at == h.clock.now()));
    }
}

mod distributed_tests {
    use super::*;

    #[tokio::test]
    async fn test_instances_share_state() {
        let shared: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let clock = ManualClock::starting_now();

        let instance_a = BreakerRegistry::new(
            Arc::new(StateStoreAdapter::new(shared.clone())),
            BreakerConfig::default(),
        )
        .with_clock(clock.clone());
        let instance_b = BreakerRegistry::new(
            Arc::new(StateStoreAdapter::new(shared.clone())),
            BreakerConfig::default(),
        )
        .with_clock(clock.clone());

        let a = instance_a.get("stripe_api").await;
        let b = instance_b.get("stripe_api").await;

        for _ in 0..3 {
            a.record_failure("503").await;
        }
        for _ in 0..2 {
            b.record_failure("503").await;
        }

        assert!(!a.can_call().await);
        assert!(!b.can_call().await);
    }

    #[derive(Debug)]
    struct DownStore;

    #[async_trait]
    impl StateStore for DownStore {
        fn backend(&self) -> &'static str {
            "down"
        }

        async fn incr_with_expiry(&self, _key: &str, _ttl: Duration) -> StoreResult<i64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn set_with_expiry(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Duration,
        ) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn ping(&self) -> StoreResult<()> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_degrades_to_local_state() {
        let clock = ManualClock::starting_now();
        let breaker = CircuitBreaker::new(
            "stripe_api",
            BreakerConfig::default(),
            Arc::new(StateStoreAdapter::new(Arc::new(DownStore))),
        )
        .with_clock(clock.clone());

        assert!(breaker.can_call().await);

        for _ in 0..5 {
            breaker.record_failure("503").await;
        }
        assert!(!breaker.can_call().await);

        let status = breaker.get_status().await;
        assert!(status.degraded);
        assert_eq!(status.state, Some(CircuitState::Open));

        clock.advance_secs(60);
        assert!(breaker.can_call().await);
    }
}

mod mixed_source_tests {
    use super::*;

    /// Shared store whose `opened_at` reads can be switched off on their own.
    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryStateStore,
        down: AtomicBool,
        opened_at_down: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self, key: &str) -> StoreResult<()> {
            let down = self.down.load(Ordering::SeqCst)
                || (key.ends_with(":opened_at") && self.opened_at_down.load(Ordering::SeqCst));
            if down {
                Err(StoreError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        fn backend(&self) -> &'static str {
            "flaky"
        }

        async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
            self.check(key)?;
            self.inner.incr_with_expiry(key, ttl).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.check(key)?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            self.check(key)?;
            self.inner.set(key, value).await
        }

        async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.check(key)?;
            self.inner.set_with_expiry(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.check(key)?;
            self.inner.delete(key).await
        }

        async fn ping(&self) -> StoreResult<()> {
            self.check("")
        }
    }

    #[tokio::test]
    async fn test_open_state_with_local_timestamp_allows_call() {
        let shared = Arc::new(FlakyStore::default());
        let clock = ManualClock::starting_now();
        let breaker = CircuitBreaker::new(
            "stripe_api",
            BreakerConfig::default(),
            Arc::new(StateStoreAdapter::new(shared.clone())),
        )
        .with_clock(clock.clone());

        // Trip while the shared store is down: a fresh `opened_at` lands locally.
        shared.down.store(true, Ordering::SeqCst);
        for _ in 0..5 {
            breaker.record_failure("503").await;
        }
        assert!(!breaker.can_call().await);

        // Shared store answers OPEN, but the timestamp can only come from local memory.
        shared.down.store(false, Ordering::SeqCst);
        shared.opened_at_down.store(true, Ordering::SeqCst);
        shared
            .inner
            .set("circuit_breaker:stripe_api:state", "open")
            .await
            .unwrap();

        assert!(breaker.can_call().await);

        // Allowed without moving the shared circuit to HALF_OPEN.
        assert_eq!(
            shared.inner.get("circuit_breaker:stripe_api:state").await.unwrap(),
            Some("open".to_string())
        );
        assert_eq!(
            shared
                .inner
                .get("circuit_breaker:stripe_api:half_open_calls")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_timestamp_read_recovers_to_rejecting() {
        let shared = Arc::new(FlakyStore::default());
        let clock = ManualClock::starting_now();
        let breaker = CircuitBreaker::new(
            "stripe_api",
            BreakerConfig::default(),
            Arc::new(StateStoreAdapter::new(shared.clone())),
        )
        .with_clock(clock.clone());

        for _ in 0..5 {
            breaker.record_failure("503").await;
        }
        assert!(!breaker.can_call().await);

        shared.opened_at_down.store(true, Ordering::SeqCst);
        assert!(breaker.can_call().await);

        shared.opened_at_down.store(false, Ordering::SeqCst);
        assert!(!breaker.can_call().await);
    }
}

mod spawned_task_tests {
    use super::*;

    /// Error that may move between threads but not be shared by reference.
    #[derive(Debug)]
    struct CountedError(Cell<u32>);

    impl fmt::Display for CountedError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "upstream failed {} times", self.0.get())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_record_failure_runs_on_spawned_tasks() {
        let breaker = Arc::new(harness(BreakerConfig::default()).breaker);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let breaker = breaker.clone();
            handles.push(tokio::spawn(async move {
                breaker.record_failure("connection reset").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(!breaker.can_call().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_call_with_non_sync_error_runs_on_spawned_task() {
        let breaker = Arc::new(harness(BreakerConfig::default()).breaker);

        for attempt in 1..=5 {
            let breaker = breaker.clone();
            let result = tokio::spawn(async move {
                breaker
                    .call(async move { Err::<(), _>(CountedError(Cell::new(attempt))) })
                    .await
            })
            .await
            .unwrap();
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }

        let result = breaker.call(async { Ok::<_, CountedError>(1) }).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }
}
