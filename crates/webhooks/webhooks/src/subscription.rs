//! Webhook subscriptions and the registry they are read from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::error::{WebhookError, WebhookResult};
use crate::event::DomainEvent;

/// A subscriber endpoint.
///
/// Subscriptions are owned by an external management layer. The delivery
/// engine reads them and updates the aggregate counters only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    /// Unique identifier.
    pub id: String,
    /// Owner of the subscription.
    pub owner: String,
    /// Target URL.
    pub endpoint_url: String,
    /// Secret for signing payloads.
    pub secret: String,
    /// Which events this subscription receives.
    #[serde(default)]
    pub filter: SubscriptionFilter,
    /// Whether this subscription is active.
    pub active: bool,
    /// Attempts sent, including retries.
    #[serde(default)]
    pub total_sent: u64,
    /// Attempts that succeeded.
    #[serde(default)]
    pub total_success: u64,
    /// Deliveries that exhausted their retries.
    #[serde(default)]
    pub total_failed: u64,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl WebhookSubscription {
    /// Creates a new active subscription that matches every event.
    pub fn new(
        owner: impl Into<String>,
        endpoint_url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            endpoint_url: endpoint_url.into(),
            secret: secret.into(),
            filter: SubscriptionFilter::default(),
            active: true,
            total_sent: 0,
            total_success: 0,
            total_failed: 0,
            last_error: None,
            last_sent_at: None,
            last_success_at: None,
            last_failure_at: None,
        }
    }

    /// Sets the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the filter.
    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Deactivates the subscription.
    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    /// Checks if this subscription should receive an event.
    pub fn should_receive(&self, event: &DomainEvent) -> bool {
        self.active && self.filter.matches(event)
    }
}

/// Filter for which events a subscription receives.
///
/// Present fields are AND-ed; an absent field matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionFilter {
    /// Minimum amount in USD.
    #[serde(alias = "min_amount_usd")]
    pub min_amount: Option<f64>,
    /// Allowed chains.
    pub chains: Option<HashSet<String>>,
    /// Allowed protocols.
    pub protocols: Option<HashSet<String>>,
    /// Allowed categories.
    pub categories: Option<HashSet<String>>,
}

impl SubscriptionFilter {
    /// Sets the minimum amount.
    pub fn min_amount(mut self, amount: f64) -> Self {
        self.min_amount = Some(amount);
        self
    }

    /// Restricts to the given chains.
    pub fn chains(mut self, chains: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.chains = Some(chains.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts to the given protocols.
    pub fn protocols(mut self, protocols: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.protocols = Some(protocols.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts to the given categories.
    pub fn categories(mut self, categories: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.categories = Some(categories.into_iter().map(Into::into).collect());
        self
    }

    /// Checks if an event matches this filter.
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if let Some(min) = self.min_amount {
            // Unknown amounts never clear a threshold.
            match event.amount {
                Some(amount) if amount >= min => {}
                _ => return false,
            }
        }

        if let Some(chains) = &self.chains {
            if !chains.contains(&event.chain) {
                return false;
            }
        }

        if let Some(protocols) = &self.protocols {
            if !protocols.contains(&event.protocol) {
                return false;
            }
        }

        if let Some(categories) = &self.categories {
            match &event.category {
                Some(category) if categories.contains(category) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Source of subscriptions, and sink for their delivery counters.
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    /// Lists active subscriptions.
    async fn active_subscriptions(&self) -> WebhookResult<Vec<WebhookSubscription>>;

    /// Gets a subscription by id, active or not.
    async fn get_subscription(&self, id: &str) -> WebhookResult<Option<WebhookSubscription>>;

    /// Counts one sent attempt.
    async fn record_attempt(
        &self,
        id: &str,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> WebhookResult<()>;

    /// Records a delivery that exhausted its retries.
    async fn record_permanent_failure(
        &self,
        id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> WebhookResult<()>;
}

/// In-memory subscription registry for testing and the standalone worker.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionRegistry {
    subscriptions: RwLock<HashMap<String, WebhookSubscription>>,
}

impl InMemorySubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a subscription.
    pub async fn insert(&self, subscription: WebhookSubscription) {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id.clone(), subscription);
    }

    /// Marks a subscription inactive.
    pub async fn deactivate(&self, id: &str) -> WebhookResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let subscription = subscriptions
            .get_mut(id)
            .ok_or_else(|| WebhookError::SubscriptionNotFound(id.to_string()))?;
        subscription.active = false;
        Ok(())
    }

    /// Number of stored subscriptions.
    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Returns true if no subscriptions are stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SubscriptionRegistry for InMemorySubscriptionRegistry {
    async fn active_subscriptions(&self) -> WebhookResult<Vec<WebhookSubscription>> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions.values().filter(|s| s.active).cloned().collect())
    }

    async fn get_subscription(&self, id: &str) -> WebhookResult<Option<WebhookSubscription>> {
        Ok(self.subscriptions.read().await.get(id).cloned())
    }

    async fn record_attempt(
        &self,
        id: &str,
        succeeded: bool,
        at: DateTime<Utc>,
    ) -> WebhookResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let subscription = subscriptions
            .get_mut(id)
            .ok_or_else(|| WebhookError::SubscriptionNotFound(id.to_string()))?;

        subscription.total_sent += 1;
        subscription.last_sent_at = Some(at);
        if succeeded {
            subscription.total_success += 1;
            subscription.last_success_at = Some(at);
        }
        Ok(())
    }

    async fn record_permanent_failure(
        &self,
        id: &str,
        error: &str,
        at: DateTime<Utc>,
    ) -> WebhookResult<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let subscription = subscriptions
            .get_mut(id)
            .ok_or_else(|| WebhookError::SubscriptionNotFound(id.to_string()))?;

        subscription.total_failed += 1;
        subscription.last_error = Some(error.to_string());
        subscription.last_failure_at = Some(at);
        Ok(())
    }
}
