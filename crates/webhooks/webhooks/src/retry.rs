//! Retry strategies and scheduling for webhook delivery.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tripwire_core::{Alert, AlertLevel, Alerter, SharedClock};

use crate::attempt::DeliveryAttempt;
use crate::error::{WebhookError, WebhookResult};
use crate::store::DeliveryStore;
use crate::subscription::SubscriptionRegistry;

/// Trait for retry strategies.
pub trait RetryStrategy: Send + Sync {
    /// Returns the delay after failed attempt `attempt_number` (1-based), or
    /// None if no attempts remain.
    fn next_delay(&self, attempt_number: u32) -> Option<Duration>;

    /// Returns the maximum number of attempts, including the first.
    fn max_attempts(&self) -> u32;

    /// Checks if another attempt should follow attempt `attempt_number`.
    fn should_retry(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts()
    }
}

/// Fixed backoff table.
///
/// The delay after attempt `n` is `tiers[n - 1]`. Tiers are strictly
/// increasing and bounded, so the worst-case end-to-end latency is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffTable {
    tiers: Vec<Duration>,
    max_attempts: u32,
}

impl BackoffTable {
    /// Creates a validated backoff table.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::ConfigError` if the table is empty, not
    /// strictly increasing, or shorter than `max_attempts - 1`.
    pub fn new(tiers: Vec<Duration>, max_attempts: u32) -> WebhookResult<Self> {
        if max_attempts == 0 {
            return Err(WebhookError::ConfigError("max_attempts must be at least 1".into()));
        }
        if tiers.is_empty() {
            return Err(WebhookError::ConfigError("backoff table is empty".into()));
        }
        if tiers.windows(2).any(|w| w[0] >= w[1]) {
            return Err(WebhookError::ConfigError(
                "backoff tiers must be strictly increasing".into(),
            ));
        }
        if (tiers.len() as u64) < u64::from(max_attempts) - 1 {
            return Err(WebhookError::ConfigError(format!(
                "{} backoff tiers cannot cover {} attempts",
                tiers.len(),
                max_attempts
            )));
        }
        Ok(Self { tiers, max_attempts })
    }

    /// Creates a validated table from whole seconds.
    pub fn from_secs(tiers: &[u64], max_attempts: u32) -> WebhookResult<Self> {
        Self::new(tiers.iter().copied().map(Duration::from_secs).collect(), max_attempts)
    }

    /// The configured tiers.
    pub fn tiers(&self) -> &[Duration] {
        &self.tiers
    }

    /// Sum of every delay a pair can wait through before its last attempt.
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts).filter_map(|n| self.next_delay(n)).sum()
    }
}

impl Default for BackoffTable {
    /// 60s, 300s, 900s with 3 attempts.
    fn default() -> Self {
        Self {
            tiers: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
            max_attempts: 3,
        }
    }
}

impl RetryStrategy for BackoffTable {
    fn next_delay(&self, attempt_number: u32) -> Option<Duration> {
        if attempt_number == 0 || !self.should_retry(attempt_number) {
            return None;
        }
        self.tiers.get(attempt_number as usize - 1).copied()
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// No retry strategy - fails immediately.
#[derive(Debug, Clone, Default)]
pub struct NoRetry;

impl RetryStrategy for NoRetry {
    fn next_delay(&self, _attempt_number: u32) -> Option<Duration> {
        None
    }

    fn max_attempts(&self) -> u32 {
        1
    }
}

/// What happened after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Another attempt is due at `next_retry_at`.
    Scheduled {
        next_attempt_number: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// No attempts remain; the failure is permanent.
    Exhausted { attempts: u32 },
}

/// Decides and persists what follows a failed attempt.
#[derive(Clone)]
pub struct RetryScheduler {
    strategy: Arc<dyn RetryStrategy>,
    store: Arc<dyn DeliveryStore>,
    registry: Arc<dyn SubscriptionRegistry>,
    alerter: Arc<dyn Alerter>,
    clock: SharedClock,
}

impl RetryScheduler {
    /// Creates a scheduler.
    pub fn new(
        strategy: Arc<dyn RetryStrategy>,
        store: Arc<dyn DeliveryStore>,
        registry: Arc<dyn SubscriptionRegistry>,
        alerter: Arc<dyn Alerter>,
        clock: SharedClock,
    ) -> Self {
        Self {
            strategy,
            store,
            registry,
            alerter,
            clock,
        }
    }

    /// Maximum attempts per (subscription, event).
    pub fn max_attempts(&self) -> u32 {
        self.strategy.max_attempts()
    }

    /// Handles a failed attempt that has already been stored.
    ///
    /// Below the attempt limit, `next_retry_at` is persisted on the attempt.
    /// At the limit, the subscription's failure fields are updated and the
    /// alerter is told.
    pub async fn on_failure(&self, attempt: &DeliveryAttempt) -> WebhookResult<RetryDecision> {
        let highest = self
            .store
            .latest_attempt(&attempt.subscription_id, &attempt.event_id)
            .await?
            .map(|a| a.attempt_number)
            .unwrap_or(attempt.attempt_number)
            .max(attempt.attempt_number);

        let now = self.clock.now();

        if let Some(delay) = self.strategy.next_delay(highest) {
            let delay = chrono::Duration::from_std(delay).map_err(|e| {
                WebhookError::ConfigError(format!("backoff delay out of range: {e}"))
            })?;
            let next_retry_at = now + delay;

            self.store.set_next_retry(&attempt.id, Some(next_retry_at)).await?;

            tracing::info!(
                subscription_id = %attempt.subscription_id,
                event_id = %attempt.event_id,
                next_attempt = highest + 1,
                max_attempts = self.strategy.max_attempts(),
                next_retry_at = %next_retry_at,
                "Scheduled webhook retry"
            );

            return Ok(RetryDecision::Scheduled {
                next_attempt_number: highest + 1,
                next_retry_at,
            });
        }

        let error = attempt.error.as_deref().unwrap_or("unknown error");
        self.registry
            .record_permanent_failure(&attempt.subscription_id, error, now)
            .await?;

        tracing::warn!(
            subscription_id = %attempt.subscription_id,
            event_id = %attempt.event_id,
            attempts = highest,
            error = %error,
            "Max retry attempts reached"
        );

        let alert = Alert::new(
            AlertLevel::Warning,
            format!("webhook:{}", attempt.subscription_id),
            "Webhook delivery failed permanently",
            format!(
                "Event {} could not be delivered after {} attempts: {}",
                attempt.event_id, highest, error
            ),
        )
        .with_metadata(json!({
            "subscription_id": attempt.subscription_id,
            "event_id": attempt.event_id,
            "attempts": highest,
            "last_error": error,
        }))
        .raised_at(now);
        self.alerter.send(alert).await;

        Ok(RetryDecision::Exhausted { attempts: highest })
    }
}
