//! Worker configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tripwire_breaker::BreakerConfig;
use tripwire_webhooks::{SubscriptionFilter, WebhookConfig, WebhookSubscription};

/// Complete worker configuration, one section per table in the TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TripwireConfig {
    /// `[worker]`
    pub worker: WorkerConfig,
    /// `[store]`
    pub store: StoreConfig,
    /// `[breaker]`: defaults for every breaker.
    pub breaker: BreakerConfig,
    /// `[breakers.<name>]`: settings for one named breaker.
    pub breakers: BTreeMap<String, BreakerConfig>,
    /// `[webhooks]`
    pub webhooks: WebhookConfig,
    /// `[[subscriptions]]`
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Log level.
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Shared state store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis URL. Unset means local-only state.
    pub redis_url: Option<String>,
    /// Prefix for every key written.
    pub prefix: String,
    /// Connect and command timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            prefix: "tripwire".to_string(),
            timeout_ms: 2000,
        }
    }
}

impl StoreConfig {
    /// Connect and command timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A subscription seeded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Fixed ID; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub owner: String,
    pub endpoint_url: String,
    pub secret: String,
    #[serde(default)]
    pub filter: SubscriptionFilter,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl SubscriptionConfig {
    /// Builds the subscription.
    pub fn to_subscription(&self) -> WebhookSubscription {
        let mut subscription =
            WebhookSubscription::new(&self.owner, &self.endpoint_url, &self.secret)
                .with_filter(self.filter.clone());
        if let Some(id) = &self.id {
            subscription = subscription.with_id(id);
        }
        if !self.active {
            subscription = subscription.deactivated();
        }
        subscription
    }
}

/// Loads configuration from a TOML file. A missing file yields defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<TripwireConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(TripwireConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    parse_config(&content)
}

/// Parses configuration from TOML text.
pub fn parse_config(content: &str) -> Result<TripwireConfig, ConfigError> {
    let config: TripwireConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config
        .webhooks
        .validate()
        .map_err(|e| ConfigError::Invalid(format!("[webhooks] {e}")))?;

    for subscription in &config.subscriptions {
        if subscription.endpoint_url.is_empty() || subscription.secret.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "subscription for '{}' needs an endpoint_url and a secret",
                subscription.owner
            )));
        }
    }

    Ok(config)
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
