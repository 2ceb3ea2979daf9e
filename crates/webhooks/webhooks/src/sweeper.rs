//! Background retry sweeper.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tripwire_core::SharedClock;

use crate::attempt::DeliveryAttempt;
use crate::delivery::Dispatcher;
use crate::error::{WebhookError, WebhookResult};
use crate::event::{DomainEvent, EventLookup};
use crate::store::DeliveryStore;
use crate::subscription::{SubscriptionRegistry, WebhookSubscription};

/// Sweeper settings.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Most rows taken per sweep.
    pub batch_size: usize,
    /// How long a claim hides a row from other sweepers.
    pub claim_lease: Duration,
    /// Attempts and events stored longer ago than this are pruned on each
    /// sweep.
    pub retention: Option<Duration>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            claim_lease: Duration::from_secs(60),
            retention: Some(Duration::from_secs(30 * 24 * 60 * 60)),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows found due.
    pub due: usize,
    /// Rows redelivered.
    pub retried: usize,
    /// Redeliveries that succeeded.
    pub succeeded: usize,
    /// Rows not redelivered: claimed elsewhere, superseded, or nothing left
    /// to deliver to.
    pub skipped: usize,
    /// Old rows pruned.
    pub pruned: usize,
    /// Old events pruned.
    pub pruned_events: usize,
}

/// Periodically redelivers attempts whose retry is due.
pub struct RetrySweeper {
    config: SweeperConfig,
    dispatcher: Dispatcher,
    store: Arc<dyn DeliveryStore>,
    registry: Arc<dyn SubscriptionRegistry>,
    events: Arc<dyn EventLookup>,
    clock: SharedClock,
    /// Held for a whole sweep so counts never see a retry half-recorded.
    sweeping: Mutex<()>,
}

enum Skip {
    Claimed,
    Superseded,
    Unreachable(&'static str),
}

impl RetrySweeper {
    /// Creates a sweeper.
    pub fn new(
        config: SweeperConfig,
        dispatcher: Dispatcher,
        store: Arc<dyn DeliveryStore>,
        registry: Arc<dyn SubscriptionRegistry>,
        events: Arc<dyn EventLookup>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            dispatcher,
            store,
            registry,
            events,
            clock,
            sweeping: Mutex::new(()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Runs one sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the due rows could not be listed. Per-row
    /// problems are logged and counted as skipped.
    pub async fn run_once(&self) -> WebhookResult<SweepReport> {
        let _sweeping = self.sweeping.lock().await;
        let now = self.clock.now();
        let lease = chrono_duration(self.config.claim_lease)?;
        let max_attempts = self.dispatcher.scheduler().max_attempts();

        let due = self
            .store
            .due_retries(now, max_attempts, lease, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        let mut tasks = JoinSet::new();
        for row in due {
            match self.prepare(&row, now, lease).await {
                Ok((subscription, event)) => {
                    let dispatcher = self.dispatcher.clone();
                    let next = row.attempt_number + 1;
                    tasks.spawn(async move {
                        dispatcher
                            .deliver_to_subscription(&subscription, &event, next)
                            .await
                    });
                }
                Err(Skip::Claimed) => report.skipped += 1,
                Err(Skip::Superseded) => {
                    tracing::debug!(attempt_id = %row.id, "Retry superseded by a later attempt");
                    report.skipped += 1;
                }
                Err(Skip::Unreachable(reason)) => {
                    tracing::info!(
                        subscription_id = %row.subscription_id,
                        event_id = %row.event_id,
                        reason,
                        "Dropping scheduled retry"
                    );
                    if let Err(e) = self.store.set_next_retry(&row.id, None).await {
                        tracing::warn!(attempt_id = %row.id, error = %e, "Failed to clear retry");
                    }
                    report.skipped += 1;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(attempt)) => {
                    report.retried += 1;
                    if attempt.succeeded() {
                        report.succeeded += 1;
                    }
                }
                Ok(Err(WebhookError::DuplicateAttempt { .. })) => report.skipped += 1,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Retry could not be recorded");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Retry task failed");
                    report.skipped += 1;
                }
            }
        }

        if let Some(retention) = self.config.retention {
            let cutoff = now - chrono_duration(retention)?;
            report.pruned = self.store.prune_before(cutoff).await?;
            report.pruned_events = self.events.prune_before(cutoff).await?;
        }

        if report.due > 0 || report.pruned > 0 || report.pruned_events > 0 {
            tracing::info!(
                due = report.due,
                retried = report.retried,
                succeeded = report.succeeded,
                skipped = report.skipped,
                pruned = report.pruned,
                pruned_events = report.pruned_events,
                "Retry sweep finished"
            );
        }

        Ok(report)
    }

    /// Number of attempts still waiting on a retry, due or not.
    ///
    /// Waits for a running sweep to finish first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store could not be read.
    pub async fn pending(&self) -> WebhookResult<usize> {
        let _sweeping = self.sweeping.lock().await;
        let max_attempts = self.dispatcher.scheduler().max_attempts();
        self.store.pending_retries(max_attempts).await
    }

    /// Sweeps every `interval` until `shutdown` turns true or its sender is
    /// dropped. Sweep errors are logged and retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting retry sweeper"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Retry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Retry sweeper stopped");
    }

    async fn prepare(
        &self,
        row: &DeliveryAttempt,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<(WebhookSubscription, DomainEvent), Skip> {
        match self.store.claim_retry(&row.id, now, lease).await {
            Ok(true) => {}
            Ok(false) => return Err(Skip::Claimed),
            Err(e) => {
                tracing::warn!(attempt_id = %row.id, error = %e, "Failed to claim retry");
                return Err(Skip::Claimed);
            }
        }

        match self.store.latest_attempt(&row.subscription_id, &row.event_id).await {
            Ok(Some(latest)) if latest.attempt_number > row.attempt_number => {
                return Err(Skip::Superseded);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(attempt_id = %row.id, error = %e, "Failed to check latest attempt");
                return Err(Skip::Claimed);
            }
        }

        let subscription = match self.registry.get_subscription(&row.subscription_id).await {
            Ok(Some(subscription)) if subscription.active => subscription,
            Ok(Some(_)) => return Err(Skip::Unreachable("subscription deactivated")),
            Ok(None) => return Err(Skip::Unreachable("subscription deleted")),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %row.subscription_id,
                    error = %e,
                    "Failed to load subscription"
                );
                return Err(Skip::Claimed);
            }
        };

        let event = match self.events.get_event(&row.event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(Skip::Unreachable("event not found")),
            Err(e) => {
                tracing::warn!(event_id = %row.event_id, error = %e, "Failed to load event");
                return Err(Skip::Claimed);
            }
        };

        Ok((subscription, event))
    }
}

fn chrono_duration(duration: Duration) -> WebhookResult<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| WebhookError::ConfigError(format!("duration out of range: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DispatchConfig;
    use crate::event::InMemoryEventStore;
    use crate::retry::{BackoffTable, RetryScheduler};
    use crate::store::InMemoryDeliveryStore;
    use crate::subscription::InMemorySubscriptionRegistry;
    use tripwire_core::{Clock, ManualClock, NoopAlerter};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryDeliveryStore>,
        registry: Arc<InMemorySubscriptionRegistry>,
        events: Arc<InMemoryEventStore>,
        sweeper: RetrySweeper,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryDeliveryStore::new());
        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        let events = Arc::new(InMemoryEventStore::with_clock(clock.clone()));

        let scheduler = RetryScheduler::new(
            Arc::new(BackoffTable::default()),
            store.clone(),
            registry.clone(),
            Arc::new(NoopAlerter),
            clock.clone(),
        );
        let dispatcher = Dispatcher::new(
            DispatchConfig::default(),
            registry.clone(),
            store.clone(),
            scheduler,
            clock.clone(),
        )
        .unwrap();
        let sweeper = RetrySweeper::new(
            SweeperConfig::default(),
            dispatcher,
            store.clone(),
            registry.clone(),
            events.clone(),
            clock.clone(),
        );

        Fixture {
            clock,
            store,
            registry,
            events,
            sweeper,
        }
    }

    async fn scheduled_row(f: &Fixture, subscription_id: &str, event_id: &str) -> DeliveryAttempt {
        let mut row = DeliveryAttempt::new(subscription_id, event_id, 1, f.clock.now())
            .with_error("refused", 1);
        row.next_retry_at = Some(f.clock.now() + chrono::Duration::seconds(60));
        f.store.append(&row).await.unwrap();
        row
    }

    #[tokio::test]
    async fn test_nothing_due_before_backoff() {
        let f = fixture();
        scheduled_row(&f, "sub-1", "evt-1").await;

        let report = f.sweeper.run_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_deactivated_subscription_is_skipped() {
        let f = fixture();
        f.registry
            .insert(
                WebhookSubscription::new("alice", "http://127.0.0.1:1", "s")
                    .with_id("sub-1")
                    .deactivated(),
            )
            .await;
        f.events
            .insert(DomainEvent::new("evt-1", "Ethereum", "Curve", Utc::now()))
            .await;
        let row = scheduled_row(&f, "sub-1", "evt-1").await;

        f.clock.advance_secs(61);
        let report = f.sweeper.run_once().await.unwrap();

        assert_eq!(report.due, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(f.store.len().await, 1);
        assert_eq!(f.store.get(&row.id).await.unwrap().unwrap().next_retry_at, None);
    }

    #[tokio::test]
    async fn test_missing_event_is_skipped() {
        let f = fixture();
        f.registry
            .insert(WebhookSubscription::new("alice", "http://127.0.0.1:1", "s").with_id("sub-1"))
            .await;
        scheduled_row(&f, "sub-1", "evt-gone").await;

        f.clock.advance_secs(61);
        let report = f.sweeper.run_once().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(f.store.len().await, 1);
        assert!(f.sweeper.run_once().await.unwrap().due == 0);
    }

    #[tokio::test]
    async fn test_claimed_row_is_not_taken_twice() {
        let f = fixture();
        let row = scheduled_row(&f, "sub-1", "evt-1").await;

        f.clock.advance_secs(61);
        let lease = chrono::Duration::seconds(60);
        assert!(f.store.claim_retry(&row.id, f.clock.now(), lease).await.unwrap());

        let report = f.sweeper.run_once().await.unwrap();
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_prunes_old_rows() {
        let f = fixture();
        let sent_at = f.clock.now() - chrono::Duration::days(31);
        let old = DeliveryAttempt::new("sub-1", "evt-old", 1, sent_at);
        f.store.append(&old).await.unwrap();

        let report = f.sweeper.run_once().await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_prunes_old_events_with_rows() {
        let f = fixture();
        f.events
            .insert(DomainEvent::new("evt-old", "Ethereum", "Curve", Utc::now()))
            .await;
        f.store
            .append(&DeliveryAttempt::new("sub-1", "evt-old", 1, f.clock.now()))
            .await
            .unwrap();

        f.clock.advance_secs(29 * 24 * 60 * 60);
        f.events
            .insert(DomainEvent::new("evt-new", "Ethereum", "Curve", Utc::now()))
            .await;
        assert_eq!(f.sweeper.run_once().await.unwrap().pruned_events, 0);

        f.clock.advance_secs(2 * 24 * 60 * 60);
        let report = f.sweeper.run_once().await.unwrap();

        assert_eq!(report.pruned, 1);
        assert_eq!(report.pruned_events, 1);
        assert!(f.events.get_event("evt-old").await.unwrap().is_none());
        assert!(f.events.get_event("evt-new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_counts_scheduled_rows() {
        let f = fixture();
        assert_eq!(f.sweeper.pending().await.unwrap(), 0);

        let row = scheduled_row(&f, "sub-1", "evt-1").await;
        assert_eq!(f.sweeper.pending().await.unwrap(), 1);

        f.store.set_next_retry(&row.id, None).await.unwrap();
        assert_eq!(f.sweeper.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);

        let sweeper = Arc::new(f.sweeper);
        let handle = tokio::spawn({
            let sweeper = sweeper.clone();
            async move { sweeper.run(rx).await }
        });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
