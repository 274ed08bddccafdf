//! Core data models for the telemetry pipeline

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Label set attached to a sample. Ordered so the canonical form is free.
pub type Labels = BTreeMap<String, String>;

/// Current wall-clock time in Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A single timestamped metric observation pushed by an instrumented source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Event time in Unix milliseconds
    pub timestamp_ms: i64,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: Labels,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            name: name.into(),
            value,
            labels: Labels::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Batched ingestion envelope (`{"samples": [...]}`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleBatch {
    pub samples: Vec<MetricSample>,
}

/// Routing identity of a sample: metric name plus canonicalized label set.
///
/// The hash is taken over the canonical text form with SHA-256, so it is
/// identical across processes and restarts, which checkpoints rely on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "PartitionKeyRepr", into = "PartitionKeyRepr")]
pub struct PartitionKey {
    metric: String,
    labels: Labels,
    canonical: String,
    hash: u64,
}

impl PartitionKey {
    pub fn new(metric: impl Into<String>, labels: Labels) -> Self {
        let metric = metric.into();
        let canonical = canonical_form(&metric, &labels);
        let digest = Sha256::digest(canonical.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);

        Self {
            metric,
            labels,
            canonical,
            hash: u64::from_be_bytes(prefix),
        }
    }

    pub fn from_sample(sample: &MetricSample) -> Self {
        Self::new(sample.name.clone(), sample.labels.clone())
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Canonical text form, e.g. `http_latency{method="GET",route="/"}`
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn stable_hash(&self) -> u64 {
        self.hash
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[derive(Serialize, Deserialize)]
struct PartitionKeyRepr {
    metric: String,
    #[serde(default)]
    labels: Labels,
}

impl From<PartitionKeyRepr> for PartitionKey {
    fn from(repr: PartitionKeyRepr) -> Self {
        PartitionKey::new(repr.metric, repr.labels)
    }
}

impl From<PartitionKey> for PartitionKeyRepr {
    fn from(key: PartitionKey) -> Self {
        PartitionKeyRepr {
            metric: key.metric,
            labels: key.labels,
        }
    }
}

fn canonical_form(metric: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return metric.to_string();
    }

    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    format!("{}{{{}}}", metric, pairs.join(","))
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Kind of window that produced an aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Sliding,
    Session,
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::Sliding => write!(f, "sliding"),
            WindowKind::Session => write!(f, "session"),
        }
    }
}

/// Half-open event-time interval `[start_ms, end_ms)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowInterval {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl WindowInterval {
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms < self.end_ms
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }
}

/// Streaming percentile estimates for a closed window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Aggregate emitted exactly once per closed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub window_id: String,
    pub key: PartitionKey,
    pub kind: WindowKind,
    pub interval: WindowInterval,
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    /// Absent when the percentile summary failed for this window
    pub percentiles: Option<Percentiles>,
    /// Least-squares slope in value units per second
    pub trend_slope: f64,
    pub degraded: bool,
}

impl AggregateResult {
    pub fn window_id_for(key: &PartitionKey, kind: WindowKind, interval: &WindowInterval) -> String {
        format!(
            "{}|{}|{}|{}",
            kind,
            key.canonical(),
            interval.start_ms,
            interval.end_ms
        )
    }

    /// Compare two results for the same window within a floating-point tolerance
    pub fn approx_eq(&self, other: &AggregateResult, tolerance: f64) -> bool {
        fn close(a: f64, b: f64, tolerance: f64) -> bool {
            (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0)
        }

        let percentiles_match = match (&self.percentiles, &other.percentiles) {
            (Some(a), Some(b)) => {
                close(a.p50, b.p50, tolerance)
                    && close(a.p75, b.p75, tolerance)
                    && close(a.p95, b.p95, tolerance)
                    && close(a.p99, b.p99, tolerance)
            }
            (None, None) => true,
            _ => false,
        };

        self.window_id == other.window_id
            && self.count == other.count
            && self.degraded == other.degraded
            && close(self.mean, other.mean, tolerance)
            && close(self.min, other.min, tolerance)
            && close(self.max, other.max, tolerance)
            && close(self.stddev, other.stddev, tolerance)
            && close(self.trend_slope, other.trend_slope, tolerance)
            && percentiles_match
    }

    /// 95th minus 50th percentile; zero when percentiles are unavailable
    pub fn spread(&self) -> f64 {
        self.percentiles.map(|p| p.p95 - p.p50).unwrap_or(0.0)
    }
}

/// Identifier of a detector inside the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Statistical,
    Trend,
    Distributional,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Statistical => "statistical",
            DetectorKind::Trend => "trend",
            DetectorKind::Distributional => "distributional",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an anomaly score was computed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoreSource {
    Aggregate { window_id: String },
    Sample,
}

/// Ensemble output for one evaluated point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub key: PartitionKey,
    pub timestamp_ms: i64,
    pub source: ScoreSource,
    /// Observed value the detectors scored
    pub value: f64,
    pub detector_scores: BTreeMap<DetectorKind, f64>,
    /// Detectors that failed for this evaluation and were left out of the vote
    pub excluded: Vec<DetectorKind>,
    pub combined: f64,
    pub is_anomaly: bool,
}
