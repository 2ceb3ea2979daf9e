//! Delivery attempt records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum stored length of a response body, in characters.
pub const MAX_RESPONSE_BODY_CHARS: usize = 1000;

/// One attempt to deliver one event to one subscription.
///
/// `attempt_number` starts at 1 and is unique per (subscription, event).
/// `next_retry_at` is `None` exactly when the attempt succeeded or no
/// attempts remain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Attempt ID.
    pub id: String,
    pub subscription_id: String,
    pub event_id: String,
    pub attempt_number: u32,
    /// Value sent in `X-Delivery-Id`.
    pub delivery_id: String,
    /// Signature sent in `X-Signature`.
    pub signature: String,
    pub sent_at: DateTime<Utc>,
    /// HTTP status code (if received).
    pub status_code: Option<u16>,
    /// Response body (truncated).
    pub response_body: Option<String>,
    /// Error message (if failed).
    pub error: Option<String>,
    /// Duration in milliseconds.
    pub latency_ms: u64,
    /// When the sweeper should retry.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When a sweeper took this row for redelivery.
    pub retry_claimed_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// Creates an attempt record with no outcome yet.
    pub fn new(
        subscription_id: impl Into<String>,
        event_id: impl Into<String>,
        attempt_number: u32,
        sent_at: DateTime<Utc>,
    ) -> Self {
        let subscription_id = subscription_id.into();
        let event_id = event_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            delivery_id: format!("{}-{}-{}", subscription_id, event_id, sent_at.timestamp()),
            subscription_id,
            event_id,
            attempt_number,
            signature: String::new(),
            sent_at,
            status_code: None,
            response_body: None,
            error: None,
            latency_ms: 0,
            next_retry_at: None,
            retry_claimed_at: None,
        }
    }

    /// Records a received response. Non-2xx responses count as failures.
    pub fn with_response(
        mut self,
        status_code: u16,
        body: Option<String>,
        latency_ms: u64,
    ) -> Self {
        self.status_code = Some(status_code);
        self.response_body = body.map(|b| truncate_chars(b, MAX_RESPONSE_BODY_CHARS));
        self.latency_ms = latency_ms;
        if !(200..300).contains(&status_code) {
            self.error = Some(format!("HTTP {status_code}"));
        }
        self
    }

    /// Records a transport error or timeout.
    pub fn with_error(mut self, error: impl Into<String>, latency_ms: u64) -> Self {
        self.error = Some(truncate_chars(error.into(), MAX_RESPONSE_BODY_CHARS / 2));
        self.latency_ms = latency_ms;
        self
    }

    /// Returns true if the endpoint answered with a 2xx status.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.status_code.is_some_and(|s| (200..300).contains(&s))
    }
}

fn truncate_chars(mut s: String, max: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
    s
}
