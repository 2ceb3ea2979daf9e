//! Registry of named circuit breakers.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tripwire_core::{Alerter, SharedClock, SystemClock, TracingAlerter};
use tripwire_store::StateStoreAdapter;

use crate::breaker::CircuitBreaker;
use crate::config::BreakerConfig;
use crate::state::CircuitStatus;

/// One breaker per dependency name, created on first use.
///
/// Every breaker shares the registry's store, clock and alerter. Per-name
/// configuration can be registered up front; other names get the default.
pub struct BreakerRegistry {
    store: Arc<StateStoreAdapter>,
    clock: SharedClock,
    alerter: Arc<dyn Alerter>,
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Create a registry with the system clock and log-only alerts
    pub fn new(store: Arc<StateStoreAdapter>, defaults: BreakerConfig) -> Self {
        Self {
            store,
            clock: SystemClock::shared(),
            alerter: Arc::new(TracingAlerter),
            defaults,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the clock handed to new breakers
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the alerter handed to new breakers
    pub fn with_alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = alerter;
        self
    }

    /// Use `config` for the breaker named `name`
    pub fn with_config(mut self, name: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Get the breaker for `name`, creating it if needed
    pub async fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                Arc::new(
                    CircuitBreaker::new(name, config, self.store.clone())
                        .with_clock(self.clock.clone())
                        .with_alerter(self.alerter.clone()),
                )
            })
            .clone()
    }

    /// Names of breakers created so far, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of every breaker created so far, sorted by name
    pub async fn statuses(&self) -> Vec<CircuitStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> = {
            let map = self.breakers.read().await;
            let mut all: Vec<_> = map.values().cloned().collect();
            all.sort_by(|a, b| a.name().cmp(b.name()));
            all
        };

        let mut statuses = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            statuses.push(breaker.get_status().await);
        }
        statuses
    }

    /// Shared store adapter
    pub fn store(&self) -> &Arc<StateStoreAdapter> {
        &self.store
    }
}
