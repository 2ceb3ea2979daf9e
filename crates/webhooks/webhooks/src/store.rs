//! Delivery record store trait for persistence.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::attempt::DeliveryAttempt;
use crate::error::{WebhookError, WebhookResult};

/// Trait for delivery record store backends.
///
/// Rows are append-only apart from the retry columns. Implementations must
/// reject a second row with the same (subscription, event, attempt_number).
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Appends an attempt.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::DuplicateAttempt` if the attempt number is taken.
    async fn append(&self, attempt: &DeliveryAttempt) -> WebhookResult<()>;

    /// Gets an attempt by ID.
    async fn get(&self, id: &str) -> WebhookResult<Option<DeliveryAttempt>>;

    /// Gets the attempt with the highest number for a pair.
    async fn latest_attempt(
        &self,
        subscription_id: &str,
        event_id: &str,
    ) -> WebhookResult<Option<DeliveryAttempt>>;

    /// Lists all attempts for a pair, lowest number first.
    async fn attempts_for(
        &self,
        subscription_id: &str,
        event_id: &str,
    ) -> WebhookResult<Vec<DeliveryAttempt>>;

    /// Sets `next_retry_at` on an attempt.
    async fn set_next_retry(
        &self,
        id: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> WebhookResult<()>;

    /// Lists unclaimed attempts due for retry: `next_retry_at <= now` and
    /// `attempt_number < max_attempts`, oldest first.
    ///
    /// Rows superseded by a later attempt for the same pair are left out.
    /// A claim older than `lease` no longer hides a row.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        lease: Duration,
        limit: usize,
    ) -> WebhookResult<Vec<DeliveryAttempt>>;

    /// Counts attempts that still carry a scheduled retry, due or not,
    /// claimed or not. Superseded rows are left out as in
    /// [`Self::due_retries`].
    async fn pending_retries(&self, max_attempts: u32) -> WebhookResult<usize>;

    /// Takes a due attempt for redelivery. Returns false if another sweeper
    /// holds a live claim on it.
    async fn claim_retry(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> WebhookResult<bool>;

    /// Deletes attempts sent before `cutoff`. Returns how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> WebhookResult<usize>;
}

fn claim_is_live(attempt: &DeliveryAttempt, now: DateTime<Utc>, lease: Duration) -> bool {
    attempt.retry_claimed_at.is_some_and(|at| at + lease > now)
}

/// In-memory delivery store for testing.
///
/// Attempts are indexed by (subscription, event) pair so that the newest
/// attempt of a pair is found without scanning every row.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryStore {
    inner: RwLock<Rows>,
}

type Pair = (String, String);

#[derive(Debug, Default)]
struct Rows {
    attempts: HashMap<String, DeliveryAttempt>,
    /// attempt_number -> attempt id, per pair.
    by_pair: HashMap<Pair, BTreeMap<u32, String>>,
}

impl Rows {
    fn pair_of(attempt: &DeliveryAttempt) -> Pair {
        (attempt.subscription_id.clone(), attempt.event_id.clone())
    }

    fn pair(&self, subscription_id: &str, event_id: &str) -> Option<&BTreeMap<u32, String>> {
        self.by_pair.get(&(subscription_id.to_string(), event_id.to_string()))
    }

    fn is_latest(&self, attempt: &DeliveryAttempt) -> bool {
        self.pair(&attempt.subscription_id, &attempt.event_id)
            .and_then(|numbers| numbers.keys().next_back())
            .is_some_and(|&highest| highest == attempt.attempt_number)
    }

    /// Rows that still carry a retry: scheduled, under the attempt cap and
    /// not superseded.
    fn retryable(&self, max_attempts: u32) -> impl Iterator<Item = &DeliveryAttempt> {
        self.attempts.values().filter(move |a| {
            a.next_retry_at.is_some() && a.attempt_number < max_attempts && self.is_latest(a)
        })
    }
}

impl InMemoryDeliveryStore {
    /// Creates a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored attempt, in no particular order.
    pub async fn all(&self) -> Vec<DeliveryAttempt> {
        self.inner.read().await.attempts.values().cloned().collect()
    }

    /// Number of stored attempts.
    pub async fn len(&self) -> usize {
        self.inner.read().await.attempts.len()
    }

    /// Returns true if no attempts are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn append(&self, attempt: &DeliveryAttempt) -> WebhookResult<()> {
        let mut rows = self.inner.write().await;
        let rows = &mut *rows;

        let numbers = rows.by_pair.entry(Rows::pair_of(attempt)).or_default();
        if numbers.contains_key(&attempt.attempt_number) {
            return Err(WebhookError::DuplicateAttempt {
                subscription_id: attempt.subscription_id.clone(),
                event_id: attempt.event_id.clone(),
                attempt_number: attempt.attempt_number,
            });
        }

        numbers.insert(attempt.attempt_number, attempt.id.clone());
        rows.attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> WebhookResult<Option<DeliveryAttempt>> {
        Ok(self.inner.read().await.attempts.get(id).cloned())
    }

    async fn latest_attempt(
        &self,
        subscription_id: &str,
        event_id: &str,
    ) -> WebhookResult<Option<DeliveryAttempt>> {
        let rows = self.inner.read().await;
        Ok(rows
            .pair(subscription_id, event_id)
            .and_then(|numbers| numbers.values().next_back())
            .and_then(|id| rows.attempts.get(id))
            .cloned())
    }

    async fn attempts_for(
        &self,
        subscription_id: &str,
        event_id: &str,
    ) -> WebhookResult<Vec<DeliveryAttempt>> {
        let rows = self.inner.read().await;
        Ok(rows
            .pair(subscription_id, event_id)
            .map(|numbers| {
                numbers
                    .values()
                    .filter_map(|id| rows.attempts.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_next_retry(
        &self,
        id: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> WebhookResult<()> {
        let mut rows = self.inner.write().await;
        let attempt = rows
            .attempts
            .get_mut(id)
            .ok_or_else(|| WebhookError::StorageError(format!("attempt {id} not found")))?;
        attempt.next_retry_at = next_retry_at;
        Ok(())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        lease: Duration,
        limit: usize,
    ) -> WebhookResult<Vec<DeliveryAttempt>> {
        let rows = self.inner.read().await;
        let mut due: Vec<DeliveryAttempt> = rows
            .retryable(max_attempts)
            .filter(|a| {
                a.next_retry_at.is_some_and(|at| at <= now) && !claim_is_live(a, now, lease)
            })
            .cloned()
            .collect();
        due.sort_by_key(|a| a.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn pending_retries(&self, max_attempts: u32) -> WebhookResult<usize> {
        Ok(self.inner.read().await.retryable(max_attempts).count())
    }

    async fn claim_retry(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> WebhookResult<bool> {
        let mut rows = self.inner.write().await;
        let Some(attempt) = rows.attempts.get_mut(id) else {
            return Ok(false);
        };
        if attempt.next_retry_at.is_none() || claim_is_live(attempt, now, lease) {
            return Ok(false);
        }
        attempt.retry_claimed_at = Some(now);
        Ok(true)
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> WebhookResult<usize> {
        let mut rows = self.inner.write().await;
        let rows = &mut *rows;
        let before_len = rows.attempts.len();

        let by_pair = &mut rows.by_pair;
        rows.attempts.retain(|_, a| {
            if a.sent_at >= cutoff {
                return true;
            }
            let pair = Rows::pair_of(a);
            if let Some(numbers) = by_pair.get_mut(&pair) {
                numbers.remove(&a.attempt_number);
                if numbers.is_empty() {
                    by_pair.remove(&pair);
                }
            }
            false
        });

        Ok(before_len - rows.attempts.len())
    }
}
