//! Sample ingestion
//!
//! The collector validates incoming samples against skew bounds, buffers
//! accepted ones and hands full (or aged) batches to the router. Rejections
//! are counted per reason and never surface as fatal errors.

use crate::error::IngestionError;
use crate::models::MetricSample;
use crate::observability::PipelineMetrics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
mod tests;

/// Configuration for the collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// How far behind wall clock a sample timestamp may be (default: 1 hour)
    pub max_skew_past: Duration,
    /// How far ahead of wall clock a sample timestamp may be (default: 5 minutes)
    pub max_skew_future: Duration,
    /// Maximum buffered samples before a flush is forced (default: 1000)
    pub buffer_capacity: usize,
    /// Maximum age of a buffered batch (default: 1 second)
    pub flush_interval: Duration,
    /// Buffer occupancy above which the collector reports degraded
    pub degraded_occupancy: f64,
    /// Drop rate above which the collector reports degraded
    pub degraded_drop_rate: f64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_skew_past: Duration::from_secs(3600),
            max_skew_future: Duration::from_secs(300),
            buffer_capacity: 1000,
            flush_interval: Duration::from_secs(1),
            degraded_occupancy: 0.9,
            degraded_drop_rate: 0.1,
        }
    }
}

/// Outcome of accepting a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Buffered samples after this one was appended
    pub buffered: usize,
    /// The buffer is full or aged and should be drained now
    pub flush_due: bool,
}

/// Per-sample rejection inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSample {
    pub index: usize,
    pub reason: String,
}

/// Result of ingesting a batch envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<RejectedSample>,
    /// Accepted samples this call flushed that no partition queue would take
    #[serde(default)]
    pub dropped: usize,
    /// Why the partition queues refused them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backpressure: Option<String>,
}

/// Collector health snapshot, also fed to prometheus gauges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorHealth {
    pub buffered: usize,
    pub capacity: usize,
    pub occupancy: f64,
    pub accepted: u64,
    pub dropped: u64,
    pub dropped_by_reason: BTreeMap<String, u64>,
    pub drop_rate: f64,
    pub degraded: bool,
}

/// Validating, buffering front door of the pipeline
pub struct Collector {
    config: CollectorConfig,
    buffer: VecDeque<MetricSample>,
    accepted: u64,
    dropped: u64,
    dropped_by_reason: BTreeMap<&'static str, u64>,
    last_flush_ms: Option<i64>,
    metrics: PipelineMetrics,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            buffer: VecDeque::with_capacity(config.buffer_capacity),
            config,
            accepted: 0,
            dropped: 0,
            dropped_by_reason: BTreeMap::new(),
            last_flush_ms: None,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Validate a sample and append it to the buffer
    pub fn ingest(&mut self, sample: MetricSample, now_ms: i64) -> Result<Accepted, IngestionError> {
        if let Err(e) = self.validate(&sample, now_ms) {
            self.dropped += 1;
            *self.dropped_by_reason.entry(e.reason()).or_insert(0) += 1;
            self.metrics.inc_dropped(e.reason());
            debug!(metric = %sample.name, reason = e.reason(), "Rejected sample");
            return Err(e);
        }

        if self.buffer.is_empty() && self.last_flush_ms.is_none() {
            self.last_flush_ms = Some(now_ms);
        }
        self.buffer.push_back(sample);
        self.accepted += 1;
        self.metrics.inc_accepted();
        self.metrics.set_collector_buffer(self.buffer.len() as i64);

        Ok(Accepted {
            buffered: self.buffer.len(),
            flush_due: self.should_flush(now_ms),
        })
    }

    /// Ingest a batch, handing every due flush to `flush`
    pub fn ingest_batch<F>(&mut self, samples: Vec<MetricSample>, now_ms: i64, mut flush: F) -> IngestReport
    where
        F: FnMut(Vec<MetricSample>),
    {
        let mut report = IngestReport::default();

        for (index, sample) in samples.into_iter().enumerate() {
            match self.ingest(sample, now_ms) {
                Ok(accepted) => {
                    report.accepted += 1;
                    if accepted.flush_due {
                        flush(self.drain(now_ms));
                    }
                }
                Err(e) => {
                    report.rejected += 1;
                    report.errors.push(RejectedSample {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Whether the buffer is full or has been held longer than the flush interval
    pub fn should_flush(&self, now_ms: i64) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        if self.buffer.len() >= self.config.buffer_capacity {
            return true;
        }
        let interval_ms = self.config.flush_interval.as_millis() as i64;
        self.last_flush_ms
            .map(|last| now_ms - last >= interval_ms)
            .unwrap_or(false)
    }

    /// Take every buffered sample in arrival order
    pub fn drain(&mut self, now_ms: i64) -> Vec<MetricSample> {
        self.last_flush_ms = Some(now_ms);
        let batch: Vec<_> = self.buffer.drain(..).collect();
        self.metrics.set_collector_buffer(0);
        batch
    }

    pub fn health(&self) -> CollectorHealth {
        let capacity = self.config.buffer_capacity.max(1);
        let occupancy = self.buffer.len() as f64 / capacity as f64;
        let seen = self.accepted + self.dropped;
        let drop_rate = if seen == 0 {
            0.0
        } else {
            self.dropped as f64 / seen as f64
        };

        CollectorHealth {
            buffered: self.buffer.len(),
            capacity: self.config.buffer_capacity,
            occupancy,
            accepted: self.accepted,
            dropped: self.dropped,
            dropped_by_reason: self
                .dropped_by_reason
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            drop_rate,
            degraded: occupancy > self.config.degraded_occupancy
                || drop_rate > self.config.degraded_drop_rate,
        }
    }

    fn validate(&self, sample: &MetricSample, now_ms: i64) -> Result<(), IngestionError> {
        if sample.name.trim().is_empty() {
            return Err(IngestionError::MissingName);
        }
        if !sample.value.is_finite() {
            return Err(IngestionError::NonFiniteValue(sample.value));
        }

        let earliest_ms = now_ms - self.config.max_skew_past.as_millis() as i64;
        let latest_ms = now_ms + self.config.max_skew_future.as_millis() as i64;
        if sample.timestamp_ms < earliest_ms {
            return Err(IngestionError::TooOld {
                timestamp_ms: sample.timestamp_ms,
                earliest_ms,
            });
        }
        if sample.timestamp_ms > latest_ms {
            return Err(IngestionError::TooFarInFuture {
                timestamp_ms: sample.timestamp_ms,
                latest_ms,
            });
        }

        Ok(())
    }
}
