//! Per-partition processing core
//!
//! A [`PartitionWorker`] owns everything mutable for its partition: the
//! window engine, the detector ensemble with its baselines, the alert
//! manager and the checkpoint log. It is driven synchronously; the async
//! runtime in [`super::Pipeline`] feeds it from a stage queue.

use crate::alerting::{
    Alert, AlertEvent, AlertManager, AlertStore, AlertingConfig, Notification, Observation,
    RuleRegistry,
};
use crate::anomaly::{DetectionMode, Ensemble, EnsembleConfig};
use crate::error::{CheckpointError, PipelineError};
use crate::export::{ExportHub, PublishOutcome};
use crate::models::{AnomalyScore, MetricSample, PartitionKey};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::reliability::{CheckpointConfig, CheckpointRecord, CheckpointStore};
use crate::window::{Advance, WindowConfig, WindowEngine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A routed sample with its position in the partition's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub offset: u64,
    pub key: PartitionKey,
    pub sample: MetricSample,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    pub window: WindowConfig,
    pub ensemble: EnsembleConfig,
    pub alerting: AlertingConfig,
    /// Checkpointing is off when unset
    pub checkpoint: Option<CheckpointConfig>,
}

/// State shared by every partition
#[derive(Clone)]
pub struct WorkerShared {
    pub export: ExportHub,
    pub rules: Arc<RuleRegistry>,
    pub alerts: Arc<AlertStore>,
    pub outbound: Option<mpsc::Sender<Notification>>,
    pub logger: StructuredLogger,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub skipped_replay: u64,
    pub late: u64,
    pub windows_closed: u64,
    pub anomalies: u64,
    pub checkpoints: u64,
}

pub struct PartitionWorker {
    partition: usize,
    windows: WindowEngine,
    ensemble: Ensemble,
    alerts: AlertManager,
    export: ExportHub,
    checkpoints: Option<CheckpointStore>,
    every_offsets: u64,
    /// Offsets below this were covered by the restored checkpoint
    replay_from: Option<u64>,
    last_offset: u64,
    since_checkpoint: u64,
    stats: WorkerStats,
    metrics: PipelineMetrics,
    logger: StructuredLogger,
}

impl PartitionWorker {
    /// Build a worker, restoring offsets and window horizons from the latest checkpoint.
    ///
    /// A replayed stream is skipped up to the record's `replay_from`; samples
    /// from there on rebuild the windows that were still open, and the restored
    /// horizons keep already emitted windows closed.
    pub fn new(partition: usize, config: &WorkerConfig, shared: WorkerShared) -> Result<Self, PipelineError> {
        let mut windows = WindowEngine::new(config.window.clone());
        let ensemble = Ensemble::new(config.ensemble.clone())?;

        let mut alerts = AlertManager::new(
            config.alerting.clone(),
            shared.rules,
            shared.alerts,
            shared.logger.clone(),
        );
        if let Some(tx) = shared.outbound {
            alerts = alerts.with_outbound(tx);
        }

        let mut replay_from = None;
        let mut last_offset = 0;
        let mut every_offsets = u64::MAX;
        let checkpoints = match &config.checkpoint {
            Some(ckpt) => {
                let store = CheckpointStore::open(ckpt, partition)?;
                if let Some(record) = store.load_latest()? {
                    info!(
                        partition,
                        offset = record.offset,
                        replay_from = record.replay_from,
                        keys = record.horizons.len(),
                        "Restoring partition from checkpoint"
                    );
                    windows.restore_horizons(record.horizons);
                    replay_from = Some(record.replay_from);
                    last_offset = record.offset;
                }
                every_offsets = ckpt.every_offsets.max(1);
                Some(store)
            }
            None => None,
        };

        Ok(Self {
            partition,
            windows,
            ensemble,
            alerts,
            export: shared.export,
            checkpoints,
            every_offsets,
            replay_from,
            last_offset,
            since_checkpoint: 0,
            stats: WorkerStats::default(),
            metrics: PipelineMetrics::new(),
            logger: shared.logger,
        })
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Last offset processed (or restored from a checkpoint)
    pub fn last_offset(&self) -> u64 {
        self.last_offset
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn windows(&self) -> &WindowEngine {
        &self.windows
    }

    /// Run one sample through windowing, detection and alerting
    pub fn process(&mut self, envelope: Envelope, now_ms: i64) -> Result<(), CheckpointError> {
        if self.replay_from.map(|r| envelope.offset < r).unwrap_or(false) {
            self.stats.skipped_replay += 1;
            return Ok(());
        }
        let started = Instant::now();

        let Envelope { offset, key, sample } = envelope;
        match self.windows.observe(&key, offset, sample.timestamp_ms, sample.value, now_ms) {
            Ok(advance) => self.handle_advance(advance, now_ms),
            Err(late) => {
                self.stats.late += 1;
                self.metrics.inc_late();
                debug!(partition = self.partition, error = %late, "Late sample dropped");
            }
        }

        self.stats.processed += 1;
        self.last_offset = self.last_offset.max(offset);
        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.every_offsets {
            self.checkpoint(now_ms)?;
        }

        self.metrics
            .observe_processing_latency(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Periodic work: close idle keys' windows and fire due alert timers
    pub fn tick(&mut self, now_ms: i64) -> Vec<AlertEvent> {
        let advance = self.windows.flush_idle(now_ms);
        if !advance.is_empty() {
            self.handle_advance(advance, now_ms);
        }
        if let Some(watermark) = self.windows.watermark() {
            self.metrics
                .set_watermark_lag(self.partition, now_ms.saturating_sub(watermark));
        }
        self.alerts.tick(now_ms)
    }

    pub fn acknowledge(&mut self, alert_id: &str, now_ms: i64) -> Result<Alert, PipelineError> {
        self.alerts.acknowledge(alert_id, now_ms)
    }

    pub fn resolve(&mut self, alert_id: &str, now_ms: i64) -> Result<Alert, PipelineError> {
        self.alerts.resolve_alert(alert_id, now_ms)
    }

    /// First offset a restart has to replay: the oldest one still held by an
    /// open window or reorder buffer, else the one after the last processed
    pub fn replay_from(&self) -> u64 {
        self.windows
            .first_held_offset()
            .unwrap_or(self.last_offset.saturating_add(1))
    }

    /// Append a checkpoint record for everything processed so far
    pub fn checkpoint(&mut self, now_ms: i64) -> Result<(), CheckpointError> {
        let replay_from = self.replay_from();
        let Some(store) = self.checkpoints.as_mut() else {
            return Ok(());
        };
        let record = CheckpointRecord {
            partition: self.partition,
            offset: self.last_offset,
            replay_from,
            watermark_ms: self.windows.watermark(),
            horizons: self.windows.horizons(),
            written_at_ms: now_ms,
        };
        if let Err(e) = store.append(&record) {
            self.metrics.inc_checkpoint_failure();
            self.logger.log_checkpoint_failure(self.partition, &e.to_string());
            return Err(e);
        }
        self.since_checkpoint = 0;
        self.stats.checkpoints += 1;
        Ok(())
    }

    pub fn compact(&mut self) -> Result<bool, CheckpointError> {
        match self.checkpoints.as_mut() {
            Some(store) => store.compact(),
            None => Ok(false),
        }
    }

    /// Close every open window as degraded and write a final checkpoint
    pub fn shutdown(&mut self, now_ms: i64) -> Result<(), CheckpointError> {
        let advance = self.windows.flush_all();
        self.handle_advance(advance, now_ms);
        self.checkpoint(now_ms)?;
        info!(
            partition = self.partition,
            offset = self.last_offset,
            processed = self.stats.processed,
            "Partition worker stopped"
        );
        Ok(())
    }

    /// Give up on a failed worker: close its open windows as degraded so the
    /// loss is visible, and hand back the closure horizons for its successor
    pub fn abandon(&mut self, now_ms: i64) -> BTreeMap<String, i64> {
        let advance = self.windows.flush_all();
        let degraded = advance.closed.len();
        self.handle_advance(advance, now_ms);
        warn!(
            partition = self.partition,
            offset = self.last_offset,
            degraded,
            "Abandoning partition worker, open windows flushed as degraded"
        );
        self.windows.horizons()
    }

    /// Take over horizons from a predecessor so its flushed windows stay closed
    pub fn adopt_horizons(&mut self, horizons: BTreeMap<String, i64>) {
        self.windows.restore_horizons(horizons);
    }

    fn handle_advance(&mut self, advance: Advance, now_ms: i64) {
        for (key, released) in advance.released {
            if self.ensemble.mode_for(key.metric()) != DetectionMode::Sample {
                continue;
            }
            let active = self.alerts.is_active(&key);
            let score = self
                .ensemble
                .evaluate_sample(&key, released.timestamp_ms, released.value, active);
            self.observe_score(&score);
            self.export.record_score(score.clone());
            self.alerts.evaluate(&Observation::from_score(score), now_ms);
        }

        for closed in advance.closed {
            let result = closed.result;
            self.stats.windows_closed += 1;
            self.metrics.inc_windows_closed(result.degraded);
            if let Some(reason) = &closed.digest_error {
                self.logger.log_degraded_window(&result.window_id, reason);
            }

            if self.export.publish_aggregate(result.clone()) != PublishOutcome::Published {
                continue;
            }

            let observation = match self.ensemble.mode_for(result.key.metric()) {
                DetectionMode::Aggregate => {
                    let active = self.alerts.is_active(&result.key);
                    let score = self.ensemble.evaluate_aggregate(&result, active);
                    self.observe_score(&score);
                    self.export.record_score(score.clone());
                    Observation::from_aggregate(result, Some(score))
                }
                // Sample-mode keys were evaluated per released sample
                DetectionMode::Sample => continue,
            };
            self.alerts.evaluate(&observation, now_ms);
        }
    }

    fn observe_score(&mut self, score: &AnomalyScore) {
        for detector in &score.excluded {
            self.metrics.inc_detector_failure(detector.as_str());
        }
        if score.is_anomaly {
            self.stats.anomalies += 1;
            self.metrics.inc_anomalies();
            let detectors = score
                .detector_scores
                .iter()
                .map(|(kind, s)| format!("{}={:.3}", kind, s))
                .collect::<Vec<_>>()
                .join(",");
            self.logger
                .log_anomaly(score.key.canonical(), score.value, score.combined, &detectors);
        }
    }
}
