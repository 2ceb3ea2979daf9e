//! Webhook receiver for verifying incoming webhooks.

use serde_json::Value;

use crate::error::{WebhookError, WebhookResult};
use crate::payload::WebhookPayload;
use crate::signature::WebhookSigner;

/// Webhook receiver for verifying incoming webhooks.
///
/// Subscribers use this to check the `X-Signature` header against the raw
/// request body before trusting it.
#[derive(Debug, Clone)]
pub struct WebhookReceiver {
    signer: WebhookSigner,
}

impl WebhookReceiver {
    /// Creates a new webhook receiver.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            signer: WebhookSigner::new(secret),
        }
    }

    /// Verifies a webhook signature and parses the payload.
    pub fn verify(&self, signature: &str, body: &[u8]) -> WebhookResult<WebhookPayload> {
        self.verify_signature(signature, body)?;
        Ok(serde_json::from_slice(body)?)
    }

    /// Verifies a webhook and returns the raw JSON value.
    pub fn verify_raw(&self, signature: &str, body: &[u8]) -> WebhookResult<Value> {
        self.verify_signature(signature, body)?;
        Ok(serde_json::from_slice(body)?)
    }

    /// Verifies only the signature without parsing.
    pub fn verify_signature(&self, signature: &str, body: &[u8]) -> WebhookResult<()> {
        self.signer
            .verify_strict(signature, body)
            .map_err(|_| WebhookError::InvalidSignature)
    }
}
