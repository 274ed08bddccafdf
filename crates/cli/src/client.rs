//! API client for communicating with the pipeline daemon

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use url::Url;

/// Non-success answer from the daemon
#[derive(Debug, Error)]
#[error("API error ({status}): {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

/// API client for the pipeline daemon
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("Invalid path")
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path)?)
            .send()
            .await
            .context("Failed to send request")?;

        parse(response).await
    }

    /// Make a GET request with query parameters
    pub async fn get_with_query<T: DeserializeOwned, Q: Serialize>(&self, path: &str, query: &Q) -> Result<T> {
        let response = self
            .client
            .get(self.url(path)?)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        parse(response).await
    }

    /// Make a POST request with JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.url(path)?)
            .json(body)
            .send()
            .await
            .context("Failed to send request")?;

        parse(response).await
    }

    /// Make a DELETE request; the daemon answers with no body
    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(path)?)
            .send()
            .await
            .context("Failed to send request")?;

        check(response).await.map(|_| ())
    }
}

async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|e| e.error)
        .unwrap_or(body);
    Err(ApiError { status, message }.into())
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
    check(response)
        .await?
        .json()
        .await
        .context("Failed to parse response")
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Metric name plus label set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub metric: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, "{}", self.metric);
        }
        let labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}{{{}}}", self.metric, labels.join(","))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedSample {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    #[serde(default)]
    pub errors: Vec<RejectedSample>,
    /// Accepted samples a partition queue refused
    #[serde(default)]
    pub dropped: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backpressure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interval {
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aggregate {
    pub window_id: String,
    pub key: SeriesKey,
    pub kind: String,
    pub interval: Interval,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub percentiles: Option<Percentiles>,
    pub trend_slope: f64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub key: SeriesKey,
    pub timestamp_ms: i64,
    pub source: ScoreSource,
    pub value: f64,
    pub detector_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub excluded: Vec<String>,
    pub combined: f64,
    pub is_anomaly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub at_ms: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub key: SeriesKey,
    pub state: String,
    pub severity: String,
    pub first_triggered_ms: Option<i64>,
    pub last_notified_ms: Option<i64>,
    pub escalation_level: usize,
    pub suppressed_until_ms: Option<i64>,
    pub acknowledged_until_ms: Option<i64>,
    pub resolved_at_ms: Option<i64>,
    pub last_value: Option<f64>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTarget {
    pub metric: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Rule as returned by the daemon; conditions stay opaque to the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub target: RuleTarget,
    pub condition: serde_json::Value,
    pub severity: String,
    #[serde(default)]
    pub for_secs: u64,
    #[serde(default)]
    pub cooldown_secs: u64,
    pub sinks: Vec<String>,
    #[serde(default)]
    pub escalation: Vec<serde_json::Value>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub partitions: usize,
    pub queue_depths: Vec<usize>,
    pub rules: usize,
    pub alerts: usize,
    pub windows_published: u64,
    pub keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key_display() {
        let mut key = SeriesKey {
            metric: "latency".to_string(),
            labels: BTreeMap::new(),
        };
        assert_eq!(key.to_string(), "latency");

        key.labels.insert("route".to_string(), "/api".to_string());
        key.labels.insert("method".to_string(), "GET".to_string());
        assert_eq!(key.to_string(), "latency{method=GET,route=/api}");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
