//! State store adapter with local fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryStateStore;
use crate::outcome::StoreOutcome;
use crate::store::StateStore;

/// Adapter in front of an optional shared store.
///
/// ## Strategy
/// - Every verb goes to the shared store first when one is configured.
/// - On a shared-store error the adapter logs a warning and serves the verb
///   from local memory, returning [`StoreOutcome::Degraded`].
/// - Without a shared store, local memory is authoritative and results are
///   [`StoreOutcome::Healthy`].
///
/// The adapter never returns an error. Local state written while degraded is
/// not reconciled with the shared store once it recovers.
#[derive(Debug)]
pub struct StateStoreAdapter {
    shared: Option<Arc<dyn StateStore>>,
    local: MemoryStateStore,
    degraded: AtomicBool,
}

impl StateStoreAdapter {
    /// Creates an adapter in front of a shared store.
    pub fn new(shared: Arc<dyn StateStore>) -> Self {
        Self {
            shared: Some(shared),
            local: MemoryStateStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Creates an adapter with no shared store.
    ///
    /// Suitable for tests and single-instance deployments only: each process
    /// keeps its own state.
    pub fn local_only() -> Self {
        Self {
            shared: None,
            local: MemoryStateStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Connects to Redis, falling back to local-only mode if it is unreachable.
    #[cfg(feature = "redis-backend")]
    pub async fn connect(url: &str, prefix: &str, timeout: Duration) -> Self {
        match crate::RedisStateStore::connect(url, prefix, timeout, timeout).await {
            Ok(store) => {
                tracing::info!(url = %url, prefix = %prefix, "Using Redis for shared state");
                Self::new(Arc::new(store))
            }
            Err(e) => {
                tracing::warn!(
                    url = %url,
                    error = %e,
                    "Redis unavailable, falling back to local state (single instance only)"
                );
                Self::local_only()
            }
        }
    }

    /// Returns true if a shared store is configured.
    pub fn is_distributed(&self) -> bool {
        self.shared.is_some()
    }

    /// Returns true if the last shared-store operation failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Name of the configured backend.
    pub fn backend(&self) -> &'static str {
        self.shared
            .as_ref()
            .map(|s| s.backend())
            .unwrap_or_else(|| self.local.backend())
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!(backend = self.backend(), "Shared state store recovered");
        }
    }

    fn mark_degraded(&self, verb: &str, key: &str, err: &StoreError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                backend = self.backend(),
                verb,
                store_key = %key,
                error = %err,
                "Shared state store failed, continuing with local state"
            );
        } else {
            tracing::debug!(
                verb,
                store_key = %key,
                error = %err,
                "Shared state store still failing"
            );
        }
    }

    async fn route<'a, T, F, Fut>(
        &'a self,
        verb: &str,
        key: &str,
        op: F,
    ) -> StoreResult<StoreOutcome<T>>
    where
        F: Fn(&'a dyn StateStore) -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        if let Some(shared) = &self.shared {
            match op(shared.as_ref()).await {
                Ok(value) => {
                    self.mark_healthy();
                    return Ok(StoreOutcome::Healthy(value));
                }
                Err(e) => self.mark_degraded(verb, key, &e),
            }
            return op(&self.local).await.map(StoreOutcome::Degraded);
        }

        op(&self.local).await.map(StoreOutcome::Healthy)
    }

    /// Atomically increments `key` and refreshes its expiry.
    pub async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> StoreOutcome<i64> {
        match self
            .route("incr", key, |s| s.incr_with_expiry(key, ttl))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Only a corrupt local value gets here; restart the counter.
                tracing::warn!(store_key = %key, error = %e, "Resetting unreadable local counter");
                let _ = self.local.set_with_expiry(key, "1", ttl).await;
                self.local_outcome(1)
            }
        }
    }

    /// Reads `key`.
    pub async fn get(&self, key: &str) -> StoreOutcome<Option<String>> {
        self.route("get", key, |s| s.get(key))
            .await
            .unwrap_or_else(|_| self.local_outcome(None))
    }

    /// Reads `key` and parses it, treating unparseable values as absent.
    pub async fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> StoreOutcome<Option<T>> {
        self.get(key).await.map(|v| v.and_then(|s| s.parse().ok()))
    }

    /// Writes `key` without expiry.
    pub async fn set(&self, key: &str, value: &str) -> StoreOutcome<()> {
        self.route("set", key, |s| s.set(key, value))
            .await
            .unwrap_or_else(|_| self.local_outcome(()))
    }

    /// Writes `key` with an expiry.
    pub async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> StoreOutcome<()> {
        self.route("set_ex", key, |s| s.set_with_expiry(key, value, ttl))
            .await
            .unwrap_or_else(|_| self.local_outcome(()))
    }

    /// Removes `key`.
    pub async fn delete(&self, key: &str) -> StoreOutcome<()> {
        self.route("delete", key, |s| s.delete(key))
            .await
            .unwrap_or_else(|_| self.local_outcome(()))
    }

    fn local_outcome<T>(&self, value: T) -> StoreOutcome<T> {
        if self.shared.is_some() {
            StoreOutcome::Degraded(value)
        } else {
            StoreOutcome::Healthy(value)
        }
    }
}
