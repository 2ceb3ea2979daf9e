//! # Tripwire Webhooks
//!
//! Webhook delivery engine for Tripwire providing:
//! - Subscription filtering by amount, chain, protocol and category
//! - Signed fan-out delivery with a bounded number of calls in flight
//! - A fixed backoff table for failed attempts
//! - A background sweeper that redelivers due retries
//! - HMAC signature verification for receivers
//!
//! ## Example
//!
//! ```rust,ignore
//! use tripwire_webhooks::{WebhookSystem, WebhookConfig, WebhookSubscription, SubscriptionFilter};
//!
//! let subscriptions = Arc::new(InMemorySubscriptionRegistry::new());
//! subscriptions
//!     .insert(
//!         WebhookSubscription::new("alice", "https://example.com/hook", "secret123")
//!             .with_filter(SubscriptionFilter::default().min_amount(1_000_000.0)),
//!     )
//!     .await;
//!
//! let system = WebhookSystem::new(WebhookConfig::default(), subscriptions, deliveries, events)?;
//! let handle = system.start()?;
//! system.submit(event)?;
//! handle.shutdown().await;
//! ```

mod attempt;
mod delivery;
mod error;
mod event;
mod payload;
mod receiver;
mod retry;
mod signature;
mod store;
mod subscription;
mod sweeper;
mod system;

pub use attempt::{DeliveryAttempt, MAX_RESPONSE_BODY_CHARS};
pub use delivery::{
    DELIVERY_ID_HEADER, DispatchConfig, Dispatcher, EVENT_TYPE_HEADER, RETRY_ATTEMPT_HEADER,
    SIGNATURE_HEADER,
};
pub use error::{WebhookError, WebhookResult};
pub use event::{DomainEvent, EventLookup, InMemoryEventStore};
pub use payload::{WebhookPayload, build_payload, canonical_body, event_type};
pub use receiver::WebhookReceiver;
pub use retry::{BackoffTable, NoRetry, RetryDecision, RetryScheduler, RetryStrategy};
pub use signature::{SignatureError, WebhookSigner};
pub use store::{DeliveryStore, InMemoryDeliveryStore};
pub use subscription::{
    InMemorySubscriptionRegistry, SubscriptionFilter, SubscriptionRegistry, WebhookSubscription,
};
pub use sweeper::{RetrySweeper, SweepReport, SweeperConfig};
pub use system::{SystemHandle, WebhookConfig, WebhookSystem};
