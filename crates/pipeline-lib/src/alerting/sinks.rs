//! Notifications and the sinks that deliver them
//!
//! Handles:
//! - The notification record emitted on alert transitions
//! - Structured-log delivery
//! - Alertmanager-compatible webhook delivery

use super::rules::Severity;
use crate::error::{ConfigError, SinkError};
use crate::models::Labels;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Firing,
    Escalated,
    Resolved,
    /// A sink itself is failing
    Meta,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Firing => write!(f, "firing"),
            NotificationKind::Escalated => write!(f, "escalated"),
            NotificationKind::Resolved => write!(f, "resolved"),
            NotificationKind::Meta => write!(f, "meta"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub alert_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub metric: String,
    /// Canonical partition key
    pub key: String,
    pub labels: Labels,
    pub kind: NotificationKind,
    pub severity: Severity,
    pub escalation_level: usize,
    pub value: Option<f64>,
    pub first_triggered_ms: Option<i64>,
    pub at_ms: i64,
    /// Sink names this notification goes to
    pub sinks: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub sink: String,
    pub status: Option<u16>,
}

/// Delivery channel for notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &Notification) -> Result<Delivered, SinkError>;
}

/// Writes each notification as a structured log record
pub struct LogSink {
    name: String,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, n: &Notification) -> Result<Delivered, SinkError> {
        info!(
            event = "alert_notification",
            sink = %self.name,
            alert_id = %n.alert_id,
            rule_id = %n.rule_id,
            key = %n.key,
            kind = %n.kind,
            severity = %n.severity,
            escalation_level = n.escalation_level,
            value = ?n.value,
            "{}",
            n.message
        );
        Ok(Delivered {
            sink: self.name.clone(),
            status: None,
        })
    }
}

/// Alertmanager webhook alert format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// Alert status (firing or resolved)
    pub status: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// RFC3339
    pub starts_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertmanagerPayload {
    pub alerts: Vec<AlertmanagerAlert>,
}

fn rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

impl From<&Notification> for AlertmanagerPayload {
    fn from(n: &Notification) -> Self {
        let mut labels: HashMap<String, String> = n
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        labels.insert("alertname".to_string(), n.rule_name.clone());
        labels.insert("severity".to_string(), n.severity.to_string());
        labels.insert("rule_id".to_string(), n.rule_id.clone());
        labels.insert("metric".to_string(), n.metric.clone());
        labels.insert("alert_id".to_string(), n.alert_id.clone());

        let mut annotations = HashMap::new();
        annotations.insert("summary".to_string(), format!("{} on {}", n.rule_name, n.key));
        annotations.insert("description".to_string(), n.message.clone());
        annotations.insert("escalation_level".to_string(), n.escalation_level.to_string());
        if let Some(value) = n.value {
            annotations.insert("value".to_string(), format!("{:.4}", value));
        }

        let resolved = n.kind == NotificationKind::Resolved;
        AlertmanagerPayload {
            alerts: vec![AlertmanagerAlert {
                status: if resolved { "resolved" } else { "firing" }.to_string(),
                labels,
                annotations,
                starts_at: rfc3339(n.first_triggered_ms.unwrap_or(n.at_ms)),
                ends_at: resolved.then(|| rfc3339(n.at_ms)),
                generator_url: None,
            }],
        }
    }
}

/// POSTs an Alertmanager-compatible payload
pub struct WebhookSink {
    name: String,
    url: url::Url,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(name: impl Into<String>, url: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let name = name.into();
        let url = url::Url::parse(url)
            .map_err(|e| ConfigError::new(format!("sink {}: invalid url {}: {}", name, url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::new(format!(
                "sink {}: unsupported scheme {}",
                name,
                url.scheme()
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::new(format!("sink {}: {}", name, e)))?;
        Ok(Self { name, url, client })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, notification: &Notification) -> Result<Delivered, SinkError> {
        let payload = AlertmanagerPayload::from(notification);
        let response = self
            .client
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| SinkError::Delivery {
                sink: self.name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Delivery {
                sink: self.name.clone(),
                reason: format!("http status {}", status),
            });
        }
        Ok(Delivered {
            sink: self.name.clone(),
            status: Some(status.as_u16()),
        })
    }
}
