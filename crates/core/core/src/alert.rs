//! Alerting collaborator.
//!
//! Tripwire does not page anyone itself. Components raise an [`Alert`] and
//! hand it to an [`Alerter`] supplied by the host application. Sending an
//! alert never fails from the caller's point of view.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::RwLock;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational.
    Info,
    /// Something degraded but still working.
    Warning,
    /// Something failed.
    Error,
    /// Operator attention required.
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Error => write!(f, "error"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// A single alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Short title.
    pub title: String,
    /// Human-readable message.
    pub message: String,
    /// Severity.
    pub level: AlertLevel,
    /// Component that raised the alert (e.g. `circuit_breaker:stripe_api`).
    pub source: String,
    /// Additional context.
    pub metadata: Value,
    /// When the alert was raised.
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    /// Creates a new alert with empty metadata, raised at the wall-clock time.
    ///
    /// Components holding a [`crate::Clock`] should follow with
    /// [`Self::raised_at`] so alert times line up with their own.
    pub fn new(
        level: AlertLevel,
        source: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            level,
            source: source.into(),
            metadata: Value::Null,
            raised_at: Utc::now(),
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Overrides the time the alert was raised.
    pub fn raised_at(mut self, at: DateTime<Utc>) -> Self {
        self.raised_at = at;
        self
    }
}

/// Receives alerts raised by Tripwire components.
#[async_trait]
pub trait Alerter: Send + Sync {
    /// Delivers an alert. Implementations swallow their own failures.
    async fn send(&self, alert: Alert);
}

/// Alerter that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAlerter;

#[async_trait]
impl Alerter for NoopAlerter {
    async fn send(&self, _alert: Alert) {}
}

/// Alerter that writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerter;

#[async_trait]
impl Alerter for TracingAlerter {
    async fn send(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Info => tracing::info!(
                source = %alert.source,
                title = %alert.title,
                metadata = %alert.metadata,
                "{}",
                alert.message
            ),
            AlertLevel::Warning => tracing::warn!(
                source = %alert.source,
                title = %alert.title,
                metadata = %alert.metadata,
                "{}",
                alert.message
            ),
            AlertLevel::Error | AlertLevel::Critical => tracing::error!(
                source = %alert.source,
                title = %alert.title,
                level = %alert.level,
                metadata = %alert.metadata,
                "{}",
                alert.message
            ),
        }
    }
}

/// In-memory alerter for testing.
#[derive(Debug, Default)]
pub struct MemoryAlerter {
    alerts: RwLock<Vec<Alert>>,
}

impl MemoryAlerter {
    /// Creates an empty alerter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every alert received so far.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.read().await.clone()
    }

    /// Returns the number of alerts received at `level`.
    pub async fn count_at(&self, level: AlertLevel) -> usize {
        self.alerts
            .read()
            .await
            .iter()
            .filter(|a| a.level == level)
            .count()
    }
}

#[async_trait]
impl Alerter for MemoryAlerter {
    async fn send(&self, alert: Alert) {
        self.alerts.write().await.push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_alerter_records() {
        let alerter = MemoryAlerter::new();

        alerter
            .send(Alert::new(AlertLevel::Warning, "test", "title", "message"))
            .await;
        alerter
            .send(Alert::new(AlertLevel::Critical, "test", "title", "message"))
            .await;

        assert_eq!(alerter.alerts().await.len(), 2);
        assert_eq!(alerter.count_at(AlertLevel::Critical).await, 1);
    }

    #[test]
    fn test_raised_at_override() {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let alert = Alert::new(AlertLevel::Info, "test", "title", "message").raised_at(at);
        assert_eq!(alert.raised_at, at);
    }

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        assert_eq!(AlertLevel::Error.to_string(), "error");
    }
}
