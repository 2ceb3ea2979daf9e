//! Domain events delivered to subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tripwire_core::{SharedClock, SystemClock};

use crate::error::WebhookResult;

/// An event produced by the aggregation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique identifier.
    pub id: String,
    /// Amount in USD, if known.
    #[serde(rename = "amount_usd", alias = "amount", default)]
    pub amount: Option<f64>,
    /// Category, if classified.
    #[serde(default)]
    pub category: Option<String>,
    /// Chain the event happened on.
    pub chain: String,
    /// Protocol involved.
    pub protocol: String,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Transaction hash.
    #[serde(default)]
    pub tx_hash: Option<String>,
    /// Reporting source.
    #[serde(default)]
    pub source: Option<String>,
    /// Link to the source report.
    #[serde(default)]
    pub source_url: Option<String>,
}

impl DomainEvent {
    /// Creates an event with the required fields.
    pub fn new(
        id: impl Into<String>,
        chain: impl Into<String>,
        protocol: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            amount: None,
            category: None,
            chain: chain.into(),
            protocol: protocol.into(),
            timestamp,
            description: None,
            tx_hash: None,
            source: None,
            source_url: None,
        }
    }

    /// Sets the amount.
    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Sets the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Looks events up by id when a retry comes due.
#[async_trait]
pub trait EventLookup: Send + Sync {
    /// Gets an event by id.
    async fn get_event(&self, id: &str) -> WebhookResult<Option<DomainEvent>>;

    /// Forgets events stored before `cutoff`. Returns how many were removed.
    ///
    /// Backends that manage their own retention keep the default, which
    /// removes nothing.
    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> WebhookResult<usize> {
        Ok(0)
    }
}

/// In-memory event store for testing and the standalone worker.
///
/// Remembers when each event was stored; retention is measured from then,
/// not from the event's own timestamp.
#[derive(Debug)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<String, (DomainEvent, DateTime<Utc>)>>,
    clock: SharedClock,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::with_clock(SystemClock::shared())
    }
}

impl InMemoryEventStore {
    /// Creates an empty store on the system clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store on the given clock.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Stores an event, replacing any with the same id.
    pub async fn insert(&self, event: DomainEvent) {
        let stored_at = self.clock.now();
        self.events
            .write()
            .await
            .insert(event.id.clone(), (event, stored_at));
    }

    /// Removes an event.
    pub async fn remove(&self, id: &str) -> Option<DomainEvent> {
        self.events.write().await.remove(id).map(|(event, _)| event)
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Returns true if no events are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventLookup for InMemoryEventStore {
    async fn get_event(&self, id: &str) -> WebhookResult<Option<DomainEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(id)
            .map(|(event, _)| event.clone()))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> WebhookResult<usize> {
        let mut events = self.events.write().await;
        let before_len = events.len();
        events.retain(|_, (_, stored_at)| *stored_at >= cutoff);
        Ok(before_len - events.len())
    }
}
