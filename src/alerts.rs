//! Deduplicated, severity-tagged alerts.
//!
//! Alerts are raised by the health monitor and the router. At most one unresolved alert per
//! `(service, message)` exists within the dedup window; repeated triggers are dropped, not
//! queued. Accepted alerts are logged and handed to an optional [`AlertSink`] on a spawned task
//! so a slow or failing sink never blocks the caller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

/// Window (seconds) in which an identical unresolved alert suppresses a new one.
pub const DEDUP_WINDOW_SECS: i64 = 5 * 60;
/// Resolved alerts older than this many seconds are purged.
pub const RESOLVED_RETENTION_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub service: String,
    pub message: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Somewhere accepted alerts are forwarded to.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Forwards alerts as JSON to an HTTP endpoint.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "webhook answered HTTP {status}");
        Ok(())
    }
}

pub struct AlertManager {
    alerts: Mutex<Vec<Alert>>,
    sink: Option<Arc<dyn AlertSink>>,
    clock: Arc<dyn Clock>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            sink: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Alert>> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise an alert unless an identical unresolved one was raised within the dedup window.
    ///
    /// Returns the new alert, or `None` when it was suppressed.
    pub fn create_alert(
        &self,
        alert_type: AlertType,
        service: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
    ) -> Option<Alert> {
        let service = service.into();
        let message = message.into();
        let now = self.clock.now();
        let window = TimeDelta::seconds(DEDUP_WINDOW_SECS);

        let alert = {
            let mut alerts = self.lock();
            let duplicate = alerts.iter().any(|a| {
                !a.is_resolved()
                    && a.service == service
                    && a.message == message
                    && now - a.created_at < window
            });
            if duplicate {
                return None;
            }

            let alert = Alert {
                id: Uuid::new_v4(),
                alert_type,
                service,
                message,
                severity,
                created_at: now,
                resolved_at: None,
            };
            alerts.push(alert.clone());
            alert
        };

        log_alert(&alert);
        self.forward(&alert);
        Some(alert)
    }

    fn forward(&self, alert: &Alert) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        // Forwarding is best-effort; without a runtime there is nowhere to run it.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(alert_id = %alert.id, "no async runtime, alert not forwarded");
            return;
        };
        let alert = alert.clone();
        runtime.spawn(async move {
            if let Err(err) = sink.send(&alert).await {
                warn!(alert_id = %alert.id, error = %err, "failed to forward alert");
            }
        });
    }

    /// Stamp a resolution time. Returns `false` for unknown or already resolved alerts.
    pub fn resolve_alert(&self, id: Uuid) -> bool {
        let now = self.clock.now();
        let mut alerts = self.lock();
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) if !alert.is_resolved() => {
                alert.resolved_at = Some(now);
                info!(alert_id = %id, service = %alert.service, "alert resolved");
                true
            }
            _ => false,
        }
    }

    /// Drop resolved alerts whose resolution is older than the retention window.
    pub fn purge_resolved(&self) -> usize {
        let cutoff = self.clock.now() - TimeDelta::seconds(RESOLVED_RETENTION_SECS);
        let mut alerts = self.lock();
        let before = alerts.len();
        alerts.retain(|a| a.resolved_at.is_none_or(|resolved| resolved >= cutoff));
        before - alerts.len()
    }

    /// Alerts newest-first, optionally capped at `limit`.
    pub fn get_alerts(&self, limit: Option<usize>) -> Vec<Alert> {
        let alerts = self.lock();
        let take = limit.unwrap_or(alerts.len());
        alerts.iter().rev().take(take).cloned().collect()
    }

    /// Unresolved alerts, newest-first.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.lock()
            .iter()
            .rev()
            .filter(|a| !a.is_resolved())
            .cloned()
            .collect()
    }
}

fn log_alert(alert: &Alert) {
    match alert.alert_type {
        AlertType::Error => error!(
            alert_id = %alert.id,
            service = %alert.service,
            severity = %alert.severity,
            "{}",
            alert.message
        ),
        AlertType::Warning => warn!(
            alert_id = %alert.id,
            service = %alert.service,
            severity = %alert.severity,
            "{}",
            alert.message
        ),
        AlertType::Info => info!(
            alert_id = %alert.id,
            service = %alert.service,
            severity = %alert.severity,
            "{}",
            alert.message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> (AlertManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (AlertManager::new().with_clock(clock.clone()), clock)
    }

    #[test]
    fn identical_alert_within_window_is_suppressed() {
        let (alerts, clock) = manager();
        let first = alerts.create_alert(AlertType::Warning, "local", "down", Severity::Medium);
        clock.advance(TimeDelta::minutes(4));
        let second = alerts.create_alert(AlertType::Warning, "local", "down", Severity::Medium);

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(alerts.active_alerts().len(), 1);
    }

    #[test]
    fn identical_alert_after_window_is_accepted() {
        let (alerts, clock) = manager();
        alerts.create_alert(AlertType::Warning, "local", "down", Severity::Medium);
        clock.advance(TimeDelta::minutes(5));
        assert!(
            alerts
                .create_alert(AlertType::Warning, "local", "down", Severity::Medium)
                .is_some()
        );
    }

    #[test]
    fn resolved_alert_does_not_suppress() {
        let (alerts, _clock) = manager();
        let first = alerts
            .create_alert(AlertType::Warning, "local", "down", Severity::Medium)
            .expect("first alert accepted");
        assert!(alerts.resolve_alert(first.id));
        assert!(!alerts.resolve_alert(first.id));
        assert!(
            alerts
                .create_alert(AlertType::Warning, "local", "down", Severity::Medium)
                .is_some()
        );
    }

    #[test]
    fn different_service_is_not_a_duplicate() {
        let (alerts, _clock) = manager();
        alerts.create_alert(AlertType::Warning, "local", "down", Severity::Medium);
        assert!(
            alerts
                .create_alert(AlertType::Warning, "docker", "down", Severity::Medium)
                .is_some()
        );
    }

    #[test]
    fn purge_drops_only_old_resolved_alerts() {
        let (alerts, clock) = manager();
        let old = alerts
            .create_alert(AlertType::Info, "router", "old", Severity::Low)
            .expect("accepted");
        alerts.resolve_alert(old.id);
        let open = alerts
            .create_alert(AlertType::Info, "router", "open", Severity::Low)
            .expect("accepted");

        clock.advance(TimeDelta::hours(25));
        let fresh = alerts
            .create_alert(AlertType::Info, "router", "fresh", Severity::Low)
            .expect("accepted");
        alerts.resolve_alert(fresh.id);

        assert_eq!(alerts.purge_resolved(), 1);
        let ids: Vec<Uuid> = alerts.get_alerts(None).iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![fresh.id, open.id]);
    }

    #[test]
    fn get_alerts_is_newest_first_and_limited() {
        let (alerts, clock) = manager();
        for n in 0..5 {
            alerts.create_alert(AlertType::Info, "router", format!("n{n}"), Severity::Low);
            clock.advance(TimeDelta::seconds(1));
        }
        let latest: Vec<String> = alerts
            .get_alerts(Some(2))
            .into_iter()
            .map(|a| a.message)
            .collect();
        assert_eq!(latest, vec!["n4", "n3"]);
    }

    struct FailingSink;

    #[async_trait]
    impl AlertSink for FailingSink {
        async fn send(&self, _alert: &Alert) -> anyhow::Result<()> {
            anyhow::bail!("sink is down")
        }
    }

    #[tokio::test]
    async fn forwarding_failure_never_reaches_the_caller() {
        let alerts = AlertManager::new().with_sink(Arc::new(FailingSink));
        let alert = alerts.create_alert(AlertType::Error, "system", "hot", Severity::Critical);
        assert!(alert.is_some());
        tokio::task::yield_now().await;
    }
}
