//! Aggregate and anomaly export
//!
//! This module provides the read side of the pipeline:
//! - Idempotent aggregate publication keyed by window id
//! - Bounded per-key aggregate retention with FIFO eviction
//! - Bounded anomaly score log
//! - Broadcast channel for live subscribers (SSE)

use crate::models::{AggregateResult, AnomalyScore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Relative tolerance when comparing a republished aggregate to the stored one
const REPUBLISH_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Aggregates kept per key (default: 500)
    pub retention_per_key: usize,
    /// Scores kept in the anomaly log (default: 10,000)
    pub anomaly_log_capacity: usize,
    /// Events a slow subscriber may lag before it skips ahead
    pub broadcast_capacity: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            retention_per_key: 500,
            anomaly_log_capacity: 10_000,
            broadcast_capacity: 1024,
        }
    }
}

/// Event delivered to live subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ExportEvent {
    Aggregate(AggregateResult),
    Anomaly(AnomalyScore),
}

impl ExportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExportEvent::Aggregate(_) => "aggregate",
            ExportEvent::Anomaly(_) => "anomaly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Same window id with identical values; nothing changed
    Duplicate,
    /// Same window id with different values; stored copy replaced, not re-emitted
    Replaced,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregateQuery {
    pub metric: Option<String>,
    /// Canonical key text
    pub key: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnomalyQuery {
    pub metric: Option<String>,
    pub flagged: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    aggregates: HashMap<String, VecDeque<AggregateResult>>,
    anomalies: VecDeque<AnomalyScore>,
    published: u64,
}

/// Shared export hub. Clones share state.
#[derive(Clone)]
pub struct ExportHub {
    config: ExportConfig,
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<ExportEvent>,
}

impl ExportHub {
    pub fn new(config: ExportConfig) -> Self {
        let (events, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            config,
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExportEvent> {
        self.events.subscribe()
    }

    /// Publish a closed window's aggregate at most once per window id
    pub fn publish_aggregate(&self, result: AggregateResult) -> PublishOutcome {
        let retention = self.config.retention_per_key.max(1);
        let mut inner = self.write();
        let history = inner
            .aggregates
            .entry(result.key.canonical().to_string())
            .or_default();

        if let Some(existing) = history.iter_mut().find(|a| a.window_id == result.window_id) {
            if existing.approx_eq(&result, REPUBLISH_TOLERANCE) {
                debug!(window_id = %result.window_id, "Duplicate aggregate ignored");
                return PublishOutcome::Duplicate;
            }
            warn!(
                window_id = %result.window_id,
                stored_mean = existing.mean,
                new_mean = result.mean,
                "Aggregate republished with different values, replacing stored copy"
            );
            *existing = result;
            return PublishOutcome::Replaced;
        }

        history.push_back(result.clone());
        while history.len() > retention {
            history.pop_front();
        }
        inner.published += 1;
        drop(inner);

        // No subscribers is fine
        let _ = self.events.send(ExportEvent::Aggregate(result));
        PublishOutcome::Published
    }

    /// Append a score to the anomaly log; flagged scores are broadcast
    pub fn record_score(&self, score: AnomalyScore) {
        let capacity = self.config.anomaly_log_capacity.max(1);
        let flagged = score.is_anomaly;
        {
            let mut inner = self.write();
            inner.anomalies.push_back(score.clone());
            while inner.anomalies.len() > capacity {
                inner.anomalies.pop_front();
            }
        }
        if flagged {
            let _ = self.events.send(ExportEvent::Anomaly(score));
        }
    }

    /// Aggregates matching the query, oldest first, at most `limit` of the newest
    pub fn aggregates(&self, query: &AggregateQuery) -> Vec<AggregateResult> {
        let inner = self.read();
        let mut out: Vec<AggregateResult> = inner
            .aggregates
            .iter()
            .filter(|(key, _)| query.key.as_deref().map(|k| k == key.as_str()).unwrap_or(true))
            .flat_map(|(_, history)| history.iter())
            .filter(|a| query.metric.as_deref().map(|m| m == a.key.metric()).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.interval
                .end_ms
                .cmp(&b.interval.end_ms)
                .then_with(|| a.window_id.cmp(&b.window_id))
        });
        tail(out, query.limit)
    }

    /// Retained aggregates of one key in publication order
    pub fn history(&self, key: &str) -> Vec<AggregateResult> {
        self.read()
            .aggregates
            .get(key)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn anomalies(&self, query: &AnomalyQuery) -> Vec<AnomalyScore> {
        let inner = self.read();
        let out: Vec<AnomalyScore> = inner
            .anomalies
            .iter()
            .filter(|s| query.metric.as_deref().map(|m| m == s.key.metric()).unwrap_or(true))
            .filter(|s| query.flagged.map(|f| f == s.is_anomaly).unwrap_or(true))
            .cloned()
            .collect();
        tail(out, query.limit)
    }

    /// Canonical keys with retained aggregates
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().aggregates.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Aggregates published since start, not counting duplicates or replacements
    pub fn published(&self) -> u64 {
        self.read().published
    }
}

fn tail<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
    }
    items
}
