//! Webhook system - main entry point.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tripwire_core::{Alerter, SharedClock, SystemClock, TracingAlerter};

use crate::delivery::{DispatchConfig, Dispatcher};
use crate::error::{WebhookError, WebhookResult};
use crate::event::{DomainEvent, EventLookup};
use crate::retry::{BackoffTable, RetryScheduler};
use crate::store::DeliveryStore;
use crate::subscription::SubscriptionRegistry;
use crate::sweeper::{RetrySweeper, SweeperConfig};

/// Webhook system configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Domain used in the event type (`<domain>.detected`) and payload key.
    pub event_domain: String,
    /// Timeout for one delivery call.
    pub request_timeout_secs: u64,
    /// Deliveries in flight at once.
    pub max_in_flight: usize,
    /// Attempts per (subscription, event), including the first.
    pub max_attempts: u32,
    /// Delay after each failed attempt, strictly increasing.
    pub backoff_seconds: Vec<u64>,
    /// Time between retry sweeps.
    pub sweep_interval_secs: u64,
    /// Rows taken per sweep.
    pub sweep_batch_size: usize,
    /// How long a sweeper's claim on a row lasts.
    pub claim_lease_secs: u64,
    /// Attempt rows and events older than this are pruned. `None` keeps
    /// everything. Must outlast the whole backoff schedule.
    pub retention_days: Option<u32>,
    /// Events buffered between `submit` and delivery.
    pub intake_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            event_domain: "exploit".to_string(),
            request_timeout_secs: 10,
            max_in_flight: 64,
            max_attempts: 3,
            backoff_seconds: vec![60, 300, 900],
            sweep_interval_secs: 5,
            sweep_batch_size: 100,
            claim_lease_secs: 60,
            retention_days: Some(30),
            intake_capacity: 1024,
        }
    }
}

impl WebhookConfig {
    /// Creates a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event domain.
    pub fn event_domain(mut self, domain: impl Into<String>) -> Self {
        self.event_domain = domain.into();
        self
    }

    /// Sets the maximum attempts.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Sets the backoff table.
    pub fn backoff_seconds(mut self, tiers: Vec<u64>) -> Self {
        self.backoff_seconds = tiers;
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Sets the intake capacity.
    pub fn intake_capacity(mut self, capacity: usize) -> Self {
        self.intake_capacity = capacity;
        self
    }

    /// Dispatcher settings.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            event_domain: self.event_domain.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_in_flight: self.max_in_flight,
        }
    }

    /// Sweeper settings.
    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_secs),
            batch_size: self.sweep_batch_size,
            claim_lease: Duration::from_secs(self.claim_lease_secs),
            retention: self
                .retention_days
                .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
        }
    }

    /// Validated backoff table.
    pub fn backoff(&self) -> WebhookResult<BackoffTable> {
        BackoffTable::from_secs(&self.backoff_seconds, self.max_attempts)
    }

    /// Checks every setting.
    pub fn validate(&self) -> WebhookResult<()> {
        if self.event_domain.is_empty() {
            return Err(WebhookError::ConfigError("event_domain is empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(WebhookError::ConfigError(
                "request_timeout_secs must be at least 1".into(),
            ));
        }
        if self.sweep_interval_secs == 0 || self.sweep_batch_size == 0 {
            return Err(WebhookError::ConfigError(
                "sweeper interval and batch size must be positive".into(),
            ));
        }
        if self.intake_capacity == 0 {
            return Err(WebhookError::ConfigError("intake_capacity must be at least 1".into()));
        }
        let backoff = self.backoff()?;

        // Pruning an event before its last retry would drop that retry.
        if let Some(days) = self.retention_days {
            let retention = u64::from(days) * 24 * 60 * 60;
            let schedule: u64 = backoff.total_delay().as_secs();
            if retention <= schedule {
                return Err(WebhookError::ConfigError(format!(
                    "retention_days ({days}) must outlast the backoff schedule ({schedule}s)"
                )));
            }
        }
        Ok(())
    }
}

/// The main webhook system.
///
/// Owns the dispatcher and sweeper. Producers hand events to `submit` and
/// never wait on delivery.
pub struct WebhookSystem {
    config: WebhookConfig,
    registry: Arc<dyn SubscriptionRegistry>,
    store: Arc<dyn DeliveryStore>,
    dispatcher: Dispatcher,
    sweeper: Arc<RetrySweeper>,
    intake: mpsc::Sender<DomainEvent>,
    pending: Mutex<Option<mpsc::Receiver<DomainEvent>>>,
    /// Events accepted by `submit` whose first delivery has not finished.
    outstanding: Arc<AtomicUsize>,
}

impl WebhookSystem {
    /// Creates a system that alerts through tracing and reads the system clock.
    pub fn new(
        config: WebhookConfig,
        registry: Arc<dyn SubscriptionRegistry>,
        store: Arc<dyn DeliveryStore>,
        events: Arc<dyn EventLookup>,
    ) -> WebhookResult<Self> {
        Self::with_parts(
            config,
            registry,
            store,
            events,
            Arc::new(TracingAlerter),
            SystemClock::shared(),
        )
    }

    /// Creates a system with a custom alerter and clock.
    pub fn with_parts(
        config: WebhookConfig,
        registry: Arc<dyn SubscriptionRegistry>,
        store: Arc<dyn DeliveryStore>,
        events: Arc<dyn EventLookup>,
        alerter: Arc<dyn Alerter>,
        clock: SharedClock,
    ) -> WebhookResult<Self> {
        config.validate()?;

        let scheduler = RetryScheduler::new(
            Arc::new(config.backoff()?),
            store.clone(),
            registry.clone(),
            alerter,
            clock.clone(),
        );
        let dispatcher = Dispatcher::new(
            config.dispatch_config(),
            registry.clone(),
            store.clone(),
            scheduler,
            clock.clone(),
        )?;
        let sweeper = Arc::new(RetrySweeper::new(
            config.sweeper_config(),
            dispatcher.clone(),
            store.clone(),
            registry.clone(),
            events,
            clock,
        ));

        let (intake, pending) = mpsc::channel(config.intake_capacity);

        Ok(Self {
            config,
            registry,
            store,
            dispatcher,
            sweeper,
            intake,
            pending: Mutex::new(Some(pending)),
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Hands an event to the intake queue.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::QueueError` if the queue is full or the
    /// system has shut down.
    pub fn submit(&self, event: DomainEvent) -> WebhookResult<()> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.intake.try_send(event).map_err(|e| {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    WebhookError::QueueError(format!("intake full, dropped event {}", event.id))
                }
                mpsc::error::TrySendError::Closed(event) => {
                    WebhookError::QueueError(format!("intake closed, dropped event {}", event.id))
                }
            }
        })
    }

    /// Returns true once every submitted event has had its first delivery
    /// and no attempt is waiting on a retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the delivery store could not be read.
    pub async fn is_settled(&self) -> WebhookResult<bool> {
        if self.outstanding.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        Ok(self.sweeper.pending().await? == 0)
    }

    /// Delivers an event right away, bypassing the intake queue.
    pub async fn deliver_now(&self, event: &DomainEvent) -> usize {
        self.dispatcher.deliver_event(event).await
    }

    /// Starts the intake worker and the retry sweeper.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the system was already started.
    pub fn start(&self) -> WebhookResult<SystemHandle> {
        let pending = self
            .pending
            .lock()
            .map_err(|_| WebhookError::Internal("intake lock poisoned".into()))?
            .take()
            .ok_or_else(|| WebhookError::Internal("webhook system already started".into()))?;

        let (shutdown, watcher) = watch::channel(false);

        let intake = tokio::spawn(run_intake(
            self.dispatcher.clone(),
            pending,
            self.outstanding.clone(),
            watcher.clone(),
        ));
        let sweeper = tokio::spawn({
            let sweeper = self.sweeper.clone();
            async move { sweeper.run(watcher).await }
        });

        tracing::info!(
            event_domain = %self.config.event_domain,
            intake_capacity = self.config.intake_capacity,
            "Webhook system started"
        );

        Ok(SystemHandle {
            shutdown,
            tasks: vec![intake, sweeper],
        })
    }

    /// The retry sweeper.
    pub fn sweeper(&self) -> &RetrySweeper {
        &self.sweeper
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Arc<dyn SubscriptionRegistry> {
        &self.registry
    }

    /// The delivery store.
    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    /// Gets the configuration.
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }
}

async fn run_intake(
    dispatcher: Dispatcher,
    mut pending: mpsc::Receiver<DomainEvent>,
    outstanding: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut deliveries = tokio::task::JoinSet::new();
    let deliver = |event: DomainEvent| {
        let dispatcher = dispatcher.clone();
        let outstanding = outstanding.clone();
        async move {
            dispatcher.deliver_event(&event).await;
            outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    };

    loop {
        tokio::select! {
            received = pending.recv() => {
                let Some(event) = received else { break };
                deliveries.spawn(deliver(event));
            }
            Some(_) = deliveries.join_next(), if !deliveries.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Events already accepted by `submit` are still delivered.
    pending.close();
    while let Some(event) = pending.recv().await {
        deliveries.spawn(deliver(event));
    }
    while deliveries.join_next().await.is_some() {}
    tracing::info!("Webhook intake stopped");
}

/// Handle to a started system.
pub struct SystemHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SystemHandle {
    /// Stops the intake worker and sweeper and waits for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Webhook task ended abnormally");
            }
        }
    }
}
