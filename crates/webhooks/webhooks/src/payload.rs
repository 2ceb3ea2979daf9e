//! Canonical webhook payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WebhookError, WebhookResult};
use crate::event::DomainEvent;

/// Builds the payload for an event.
///
/// Shape: `{"event_type": "<domain>.detected", "timestamp": <unix>,
/// "<domain>": {...}}`.
pub fn build_payload(
    event: &DomainEvent,
    domain: &str,
    now: DateTime<Utc>,
) -> WebhookResult<Value> {
    let mut payload = Map::new();
    payload.insert("event_type".into(), Value::String(event_type(domain)));
    payload.insert("timestamp".into(), Value::from(now.timestamp()));
    payload.insert(domain.to_string(), serde_json::to_value(event)?);
    Ok(Value::Object(payload))
}

/// Serializes a payload compactly with object keys sorted at every level.
///
/// The bytes returned are exactly the bytes that are signed and sent.
pub fn canonical_body(payload: &Value) -> WebhookResult<String> {
    Ok(serde_json::to_string(&sorted(payload))?)
}

/// `X-Event-Type` value for a domain.
pub fn event_type(domain: &str) -> String {
    format!("{domain}.detected")
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sorted(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Parsed webhook payload, as seen by a receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Event type, e.g. `exploit.detected`.
    pub event_type: String,
    /// Unix time the payload was built.
    pub timestamp: i64,
    /// Remaining fields, keyed by domain.
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl WebhookPayload {
    /// Domain part of the event type.
    pub fn domain(&self) -> &str {
        self.event_type
            .strip_suffix(".detected")
            .unwrap_or(&self.event_type)
    }

    /// Event data under the domain key.
    pub fn data(&self) -> Option<&Value> {
        self.body.get(self.domain())
    }

    /// Decodes the event data.
    pub fn event(&self) -> WebhookResult<DomainEvent> {
        let data = self.data().ok_or_else(|| {
            WebhookError::InvalidPayload(format!("missing '{}' object", self.domain()))
        })?;
        Ok(serde_json::from_value(data.clone())?)
    }
}
