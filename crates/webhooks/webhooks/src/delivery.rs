//! Webhook delivery dispatcher.

use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tripwire_core::SharedClock;

use crate::attempt::{DeliveryAttempt, MAX_RESPONSE_BODY_CHARS};
use crate::error::{WebhookError, WebhookResult};
use crate::event::DomainEvent;
use crate::payload::{build_payload, canonical_body, event_type};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::signature::WebhookSigner;
use crate::store::DeliveryStore;
use crate::subscription::{SubscriptionRegistry, WebhookSubscription};

/// Hex HMAC-SHA256 of the body.
pub const SIGNATURE_HEADER: &str = "X-Signature";
/// `<domain>.detected`.
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";
/// `<subscription_id>-<event_id>-<unix_time>`.
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";
/// Attempt number, sent on retries only.
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

/// Most response bytes read; enough for the stored characters in any UTF-8.
const MAX_RESPONSE_BODY_BYTES: usize = MAX_RESPONSE_BODY_CHARS * 4;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Domain used for the event type and payload key.
    pub event_domain: String,
    /// Timeout for one HTTP call, including reading the response.
    pub request_timeout: Duration,
    /// Deliveries in flight at once, across all events.
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            event_domain: "exploit".to_string(),
            request_timeout: Duration::from_secs(10),
            max_in_flight: 64,
        }
    }
}

/// Sends events to matching subscriptions.
///
/// Cloning is cheap; clones share the HTTP client, stores and in-flight limit.
#[derive(Clone)]
pub struct Dispatcher {
    config: DispatchConfig,
    client: reqwest::Client,
    registry: Arc<dyn SubscriptionRegistry>,
    store: Arc<dyn DeliveryStore>,
    scheduler: RetryScheduler,
    clock: SharedClock,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        config: DispatchConfig,
        registry: Arc<dyn SubscriptionRegistry>,
        store: Arc<dyn DeliveryStore>,
        scheduler: RetryScheduler,
        clock: SharedClock,
    ) -> WebhookResult<Self> {
        if config.max_in_flight == 0 {
            return Err(WebhookError::ConfigError("max_in_flight must be at least 1".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
            client,
            registry,
            store,
            scheduler,
            clock,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Retry scheduler used after failed attempts.
    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    /// Delivers an event to every active subscription whose filter matches.
    ///
    /// Deliveries run concurrently, bounded by `max_in_flight`. Returns how
    /// many succeeded on this first attempt. Never fails: every problem is
    /// logged and left to the retry path.
    pub async fn deliver_event(&self, event: &DomainEvent) -> usize {
        let subscriptions = match self.registry.active_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Failed to load subscriptions");
                return 0;
            }
        };

        let active = subscriptions.len();
        let matching: Vec<WebhookSubscription> = subscriptions
            .into_iter()
            .filter(|s| s.should_receive(event))
            .collect();
        let matched = matching.len();

        tracing::info!(
            event_id = %event.id,
            matched,
            active,
            "Sending event to webhooks"
        );

        let event = Arc::new(event.clone());
        let mut tasks = JoinSet::new();
        for subscription in matching {
            let dispatcher = self.clone();
            let event = event.clone();
            tasks.spawn(async move {
                dispatcher
                    .deliver_to_subscription(&subscription, &event, 1)
                    .await
            });
        }

        let mut delivered = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(attempt)) if attempt.succeeded() => delivered += 1,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Delivery could not be recorded"
                ),
                Err(e) => {
                    tracing::error!(event_id = %event.id, error = %e, "Delivery task failed")
                }
            }
        }

        tracing::info!(event_id = %event.id, delivered, matched, "Delivered event to webhooks");
        delivered
    }

    /// Delivers one event to one subscription as attempt `attempt_number`.
    ///
    /// Appends the attempt row, updates the subscription counters, and on
    /// failure hands the attempt to the retry scheduler. The returned attempt
    /// carries the scheduled `next_retry_at`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error only if the attempt row could not be stored,
    /// including `WebhookError::DuplicateAttempt`.
    pub async fn deliver_to_subscription(
        &self,
        subscription: &WebhookSubscription,
        event: &DomainEvent,
        attempt_number: u32,
    ) -> WebhookResult<DeliveryAttempt> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| WebhookError::Internal("dispatcher closed".into()))?;

        let now = self.clock.now();
        let payload = build_payload(event, &self.config.event_domain, now)?;
        let body = canonical_body(&payload)?;

        let mut attempt = DeliveryAttempt::new(&subscription.id, &event.id, attempt_number, now);
        attempt.signature = WebhookSigner::new(&subscription.secret).sign(body.as_bytes());

        let mut request = self
            .client
            .post(&subscription.endpoint_url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &attempt.signature)
            .header(EVENT_TYPE_HEADER, event_type(&self.config.event_domain))
            .header(DELIVERY_ID_HEADER, &attempt.delivery_id)
            .timeout(self.config.request_timeout);

        if attempt_number > 1 {
            request = request.header(RETRY_ATTEMPT_HEADER, attempt_number.to_string());
        }

        let start = Instant::now();
        let response = request.body(body).send().await;

        let mut attempt = match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let text = read_capped(resp).await;
                attempt.with_response(status, text, start.elapsed().as_millis() as u64)
            }
            Err(e) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                attempt.with_error(WebhookError::from(e).to_string(), latency_ms)
            }
        };

        self.store.append(&attempt).await?;

        let succeeded = attempt.succeeded();
        if let Err(e) = self.registry.record_attempt(&subscription.id, succeeded, now).await {
            tracing::warn!(
                subscription_id = %subscription.id,
                error = %e,
                "Failed to update subscription stats"
            );
        }

        if succeeded {
            tracing::info!(
                subscription_id = %subscription.id,
                event_id = %event.id,
                attempt = attempt_number,
                latency_ms = attempt.latency_ms,
                "Webhook delivered"
            );
            return Ok(attempt);
        }

        tracing::warn!(
            subscription_id = %subscription.id,
            event_id = %event.id,
            attempt = attempt_number,
            error = attempt.error.as_deref().unwrap_or_default(),
            "Webhook delivery failed"
        );

        match self.scheduler.on_failure(&attempt).await {
            Ok(RetryDecision::Scheduled { next_retry_at, .. }) => {
                attempt.next_retry_at = Some(next_retry_at);
            }
            Ok(RetryDecision::Exhausted { .. }) => {}
            Err(e) => tracing::error!(
                subscription_id = %subscription.id,
                event_id = %event.id,
                error = %e,
                "Failed to schedule retry"
            ),
        }

        Ok(attempt)
    }
}

/// Reads the response body up to [`MAX_RESPONSE_BODY_BYTES`] and drops the
/// rest unread. A body that fails midway keeps what arrived.
async fn read_capped(mut resp: reqwest::Response) -> Option<String> {
    let mut body = Vec::new();
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let room = MAX_RESPONSE_BODY_BYTES - body.len();
                body.extend_from_slice(&chunk[..chunk.len().min(room)]);
                if body.len() >= MAX_RESPONSE_BODY_BYTES {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "Response body cut short");
                if body.is_empty() {
                    return None;
                }
                break;
            }
        }
    }
    Some(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{BackoffTable, NoRetry, RetryStrategy};
    use crate::store::InMemoryDeliveryStore;
    use crate::subscription::InMemorySubscriptionRegistry;
    use chrono::Utc;
    use tripwire_core::{ManualClock, NoopAlerter};
    use wiremock::matchers::{header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher(
        registry: Arc<InMemorySubscriptionRegistry>,
        store: Arc<InMemoryDeliveryStore>,
        strategy: Arc<dyn RetryStrategy>,
    ) -> Dispatcher {
        let clock = ManualClock::starting_now();
        let scheduler = RetryScheduler::new(
            strategy,
            store.clone(),
            registry.clone(),
            Arc::new(NoopAlerter),
            clock.clone(),
        );
        Dispatcher::new(
            DispatchConfig {
                request_timeout: Duration::from_secs(2),
                ..DispatchConfig::default()
            },
            registry,
            store,
            scheduler,
            clock,
        )
        .unwrap()
    }

    fn event() -> DomainEvent {
        DomainEvent::new("evt-1", "Ethereum", "Curve", Utc::now()).with_amount(2_000_000.0)
    }

    #[tokio::test]
    async fn test_headers_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Content-Type", "application/json"))
            .and(header("X-Event-Type", "exploit.detected"))
            .and(header_exists("X-Signature"))
            .and(header_exists("X-Delivery-Id"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let subscription =
            WebhookSubscription::new("alice", format!("{}/hook", server.uri()), "secret");
        let dispatcher = dispatcher(registry, store.clone(), Arc::new(BackoffTable::default()));

        let attempt = dispatcher
            .deliver_to_subscription(&subscription, &event(), 1)
            .await
            .unwrap();

        assert!(attempt.succeeded());
        assert_eq!(attempt.next_retry_at, None);
        assert_eq!(store.len().await, 1);
        assert!(server.received_requests().await.unwrap()[0]
            .headers
            .get(RETRY_ATTEMPT_HEADER)
            .is_none());
    }

    #[tokio::test]
    async fn test_retry_header_on_later_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-Retry-Attempt", "2"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let subscription = WebhookSubscription::new("alice", server.uri(), "secret");
        let dispatcher = dispatcher(registry, store, Arc::new(BackoffTable::default()));

        let attempt = dispatcher
            .deliver_to_subscription(&subscription, &event(), 2)
            .await
            .unwrap();
        assert!(attempt.succeeded());
    }

    #[tokio::test]
    async fn test_failure_without_retries_is_final() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        let subscription = WebhookSubscription::new("alice", server.uri(), "secret");
        registry.insert(subscription.clone()).await;
        let store = Arc::new(InMemoryDeliveryStore::new());
        let dispatcher = dispatcher(registry.clone(), store, Arc::new(NoRetry));

        let attempt = dispatcher
            .deliver_to_subscription(&subscription, &event(), 1)
            .await
            .unwrap();

        assert_eq!(attempt.status_code, Some(500));
        assert_eq!(attempt.response_body.as_deref(), Some("boom"));
        assert_eq!(attempt.next_retry_at, None);

        let stored = registry.get_subscription(&subscription.id).await.unwrap().unwrap();
        assert_eq!(stored.total_sent, 1);
        assert_eq!(stored.total_failed, 1);
    }

    #[tokio::test]
    async fn test_large_response_body_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("é".repeat(1_000_000)))
            .mount(&server)
            .await;

        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let subscription = WebhookSubscription::new("alice", server.uri(), "secret");
        let dispatcher = dispatcher(registry, store, Arc::new(NoRetry));

        let attempt = dispatcher
            .deliver_to_subscription(&subscription, &event(), 1)
            .await
            .unwrap();

        let body = attempt.response_body.unwrap();
        assert_eq!(body.chars().count(), MAX_RESPONSE_BODY_CHARS);
        assert!(body.chars().all(|c| c == 'é'));
    }

    #[tokio::test]
    async fn test_duplicate_attempt_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let subscription = WebhookSubscription::new("alice", server.uri(), "secret");
        let dispatcher = dispatcher(registry, store, Arc::new(BackoffTable::default()));

        dispatcher.deliver_to_subscription(&subscription, &event(), 1).await.unwrap();
        let again = dispatcher.deliver_to_subscription(&subscription, &event(), 1).await;

        assert!(matches!(again, Err(WebhookError::DuplicateAttempt { .. })));
    }

    #[test]
    fn test_zero_in_flight_rejected() {
        let registry = Arc::new(InMemorySubscriptionRegistry::new());
        let store = Arc::new(InMemoryDeliveryStore::new());
        let clock = ManualClock::starting_now();
        let scheduler = RetryScheduler::new(
            Arc::new(NoRetry),
            store.clone(),
            registry.clone(),
            Arc::new(NoopAlerter),
            clock.clone(),
        );

        let result = Dispatcher::new(
            DispatchConfig {
                max_in_flight: 0,
                ..DispatchConfig::default()
            },
            registry,
            store,
            scheduler,
            clock,
        );
        assert!(matches!(result, Err(WebhookError::ConfigError(_))));
    }
}
