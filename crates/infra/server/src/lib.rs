//! # Tripwire Worker
//!
//! Assembles a running Tripwire process from a [`TripwireConfig`]: the
//! shared state store, the breaker registry and the webhook system, fed by
//! newline-delimited JSON events.
//!
//! The standalone binary only feeds webhooks. The breaker registry is built
//! for code that embeds a [`Worker`] and guards its own upstream calls
//! through [`Worker::breakers`]; the worker reports every breaker's status
//! when it stops.

mod config;

pub use config::{
    ConfigError, StoreConfig, SubscriptionConfig, TripwireConfig, WorkerConfig, load_config,
    parse_config,
};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tripwire_breaker::BreakerRegistry;
use tripwire_store::StateStoreAdapter;
use tripwire_webhooks::{
    DomainEvent, InMemoryDeliveryStore, InMemoryEventStore, InMemorySubscriptionRegistry,
    WebhookError, WebhookSystem,
};

/// How often a worker with closed input checks whether deliveries settled.
const SETTLE_POLL: Duration = Duration::from_millis(250);

/// Worker error.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running Tripwire process.
pub struct Worker {
    config: TripwireConfig,
    breakers: BreakerRegistry,
    events: Arc<InMemoryEventStore>,
    webhooks: WebhookSystem,
}

impl Worker {
    /// Connects the state store and builds every component.
    ///
    /// Breakers named under `[breakers.<name>]` are created up front so they
    /// show in status reports before their first call.
    pub async fn build(config: TripwireConfig) -> Result<Self, WorkerError> {
        let store = Arc::new(connect_store(&config.store).await);

        let mut breakers = BreakerRegistry::new(store, config.breaker.clone());
        for (name, breaker) in &config.breakers {
            breakers = breakers.with_config(name, breaker.clone());
        }
        for name in config.breakers.keys() {
            breakers.get(name).await;
        }

        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        for subscription in &config.subscriptions {
            registry.insert(subscription.to_subscription()).await;
        }

        let events = Arc::new(InMemoryEventStore::new());
        let webhooks = WebhookSystem::new(
            config.webhooks.clone(),
            registry.clone(),
            Arc::new(InMemoryDeliveryStore::new()),
            events.clone(),
        )?;

        tracing::info!(
            store = breakers.store().backend(),
            breakers = config.breakers.len(),
            subscriptions = registry.len().await,
            "Tripwire worker ready"
        );

        Ok(Self {
            config,
            breakers,
            events,
            webhooks,
        })
    }

    /// Parses one JSON event, records it for retries and queues it for delivery.
    pub async fn ingest_line(&self, line: &str) -> Result<(), WorkerError> {
        let event: DomainEvent = serde_json::from_str(line)?;
        self.events.insert(event.clone()).await;
        self.webhooks.submit(event)?;
        Ok(())
    }

    /// Runs until `shutdown` resolves, or until `input` ends and the webhook
    /// system has settled.
    ///
    /// Malformed lines are logged and skipped. Once input closes the worker
    /// keeps sweeping until every event had its first delivery and no retry
    /// is pending. Events accepted before shutdown are still delivered.
    pub async fn run<R, S>(&self, input: R, shutdown: S) -> Result<(), WorkerError>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        let handle = self.webhooks.start()?;
        let mut lines = input.lines();
        tokio::pin!(shutdown);

        let mut input_closed = false;
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        if let Err(e) = self.ingest_line(&line).await {
                            tracing::warn!(error = %e, "Skipping event");
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Event input closed");
                        input_closed = true;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read events");
                        input_closed = true;
                        break;
                    }
                },
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
            }
        }

        if input_closed {
            self.wait_until_settled(&mut shutdown).await;
        }

        handle.shutdown().await;

        for status in self.breakers.statuses().await {
            tracing::info!(
                breaker = %status.name,
                state = status.state.map(|s| s.as_str()).unwrap_or("unknown"),
                failures = status.failure_count,
                degraded = status.degraded,
                "Breaker status"
            );
        }

        Ok(())
    }

    async fn wait_until_settled<S>(&self, shutdown: &mut std::pin::Pin<&mut S>)
    where
        S: Future<Output = ()>,
    {
        loop {
            match self.webhooks.is_settled().await {
                Ok(true) => {
                    tracing::info!("All deliveries settled");
                    return;
                }
                Ok(false) => {
                    tracing::debug!("Waiting for pending deliveries and retries");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to check pending retries"),
            }

            tokio::select! {
                _ = tokio::time::sleep(SETTLE_POLL) => {}
                _ = shutdown.as_mut() => {
                    tracing::info!("Shutdown requested with retries pending");
                    return;
                }
            }
        }
    }

    /// Breaker registry.
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Webhook system.
    pub fn webhooks(&self) -> &WebhookSystem {
        &self.webhooks
    }

    /// Gets the configuration.
    pub fn config(&self) -> &TripwireConfig {
        &self.config
    }
}

async fn connect_store(config: &StoreConfig) -> StateStoreAdapter {
    match &config.redis_url {
        Some(url) => StateStoreAdapter::connect(url, &config.prefix, config.timeout()).await,
        None => {
            tracing::info!("No redis_url configured, breaker state is local to this process");
            StateStoreAdapter::local_only()
        }
    }
}
