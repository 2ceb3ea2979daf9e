//! HMAC signature generation and verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Webhook signer for generating and verifying signatures.
///
/// The signature is the lowercase hex HMAC-SHA256 of the exact body bytes,
/// keyed by the subscription secret.
#[derive(Clone)]
pub struct WebhookSigner {
    secret: String,
}

impl std::fmt::Debug for WebhookSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSigner").finish_non_exhaustive()
    }
}

impl WebhookSigner {
    /// Creates a new signer with the given secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Generates a signature for the given payload.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies a signature against the payload in constant time.
    pub fn verify(&self, signature: &str, payload: &[u8]) -> bool {
        self.verify_strict(signature, payload).is_ok()
    }

    /// Verifies a signature, reporting why it was rejected.
    pub fn verify_strict(&self, signature: &str, payload: &[u8]) -> Result<(), SignatureError> {
        let expected = hex::decode(signature.trim()).map_err(|_| SignatureError::InvalidFormat)?;

        let mut mac = self.mac();
        mac.update(payload);
        mac.verify_slice(&expected).map_err(|_| SignatureError::Invalid)
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC can take key of any size")
    }
}

/// Signature verification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is not hex.
    InvalidFormat,
    /// Signature is invalid.
    Invalid,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidFormat => write!(f, "Invalid signature format"),
            SignatureError::Invalid => write!(f, "Invalid signature"),
        }
    }
}

impl std::error::Error for SignatureError {}
