//! Observability infrastructure for the pipeline
//!
//! Provides:
//! - Prometheus metrics (drops, lateness, windows, anomalies, alerts, sinks, checkpoints)
//! - Structured JSON logging of significant pipeline events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for per-sample processing latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    samples_accepted: IntCounter,
    samples_dropped: IntCounterVec,
    samples_late: IntCounter,
    collector_buffer_occupancy: IntGauge,
    processing_latency_seconds: Histogram,
    windows_closed: IntCounter,
    windows_degraded: IntCounter,
    anomalies_detected: IntCounter,
    detector_failures: IntCounterVec,
    alert_transitions: IntCounterVec,
    notifications_sent: IntCounterVec,
    sink_failures: IntCounterVec,
    circuit_state: IntGaugeVec,
    backpressure_dropped: IntCounterVec,
    spilled_items: IntGaugeVec,
    checkpoint_failures: IntCounter,
    worker_restarts: IntCounterVec,
    watermark_lag_ms: IntGaugeVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            samples_accepted: register_int_counter!(
                "pipeline_samples_accepted_total",
                "Samples accepted by the collector"
            )
            .expect("Failed to register samples_accepted"),

            samples_dropped: register_int_counter_vec!(
                "pipeline_dropped_samples_total",
                "Samples rejected by the collector, by reason",
                &["reason"]
            )
            .expect("Failed to register dropped_samples"),

            samples_late: register_int_counter!(
                "pipeline_late_samples_total",
                "Samples dropped for arriving behind the watermark"
            )
            .expect("Failed to register late_samples"),

            collector_buffer_occupancy: register_int_gauge!(
                "pipeline_collector_buffer_items",
                "Samples currently buffered by the collector"
            )
            .expect("Failed to register collector_buffer_items"),

            processing_latency_seconds: register_histogram!(
                "pipeline_sample_processing_seconds",
                "Time spent processing one sample inside a partition worker",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register sample_processing_seconds"),

            windows_closed: register_int_counter!(
                "pipeline_windows_closed_total",
                "Windows closed and aggregated"
            )
            .expect("Failed to register windows_closed"),

            windows_degraded: register_int_counter!(
                "pipeline_windows_degraded_total",
                "Windows closed with a partial (degraded) result"
            )
            .expect("Failed to register windows_degraded"),

            anomalies_detected: register_int_counter!(
                "pipeline_anomalies_detected_total",
                "Evaluations the ensemble flagged as anomalous"
            )
            .expect("Failed to register anomalies_detected"),

            detector_failures: register_int_counter_vec!(
                "pipeline_detector_failures_total",
                "Detector evaluations excluded from the ensemble vote",
                &["detector"]
            )
            .expect("Failed to register detector_failures"),

            alert_transitions: register_int_counter_vec!(
                "pipeline_alert_transitions_total",
                "Alert state transitions, by target state",
                &["state"]
            )
            .expect("Failed to register alert_transitions"),

            notifications_sent: register_int_counter_vec!(
                "pipeline_notifications_sent_total",
                "Notifications delivered, by sink",
                &["sink"]
            )
            .expect("Failed to register notifications_sent"),

            sink_failures: register_int_counter_vec!(
                "pipeline_sink_failures_total",
                "Notification deliveries that failed permanently, by sink",
                &["sink"]
            )
            .expect("Failed to register sink_failures"),

            circuit_state: register_int_gauge_vec!(
                "pipeline_sink_circuit_state",
                "Circuit breaker state per sink (0 closed, 1 half-open, 2 open)",
                &["sink"]
            )
            .expect("Failed to register sink_circuit_state"),

            backpressure_dropped: register_int_counter_vec!(
                "pipeline_backpressure_dropped_total",
                "Items dropped by a stage queue's backpressure policy",
                &["stage"]
            )
            .expect("Failed to register backpressure_dropped"),

            spilled_items: register_int_gauge_vec!(
                "pipeline_spilled_items",
                "Items currently spilled to disk, by stage",
                &["stage"]
            )
            .expect("Failed to register spilled_items"),

            checkpoint_failures: register_int_counter!(
                "pipeline_checkpoint_failures_total",
                "Checkpoint writes that failed"
            )
            .expect("Failed to register checkpoint_failures"),

            worker_restarts: register_int_counter_vec!(
                "pipeline_worker_restarts_total",
                "Partition worker restarts after a fatal fault",
                &["partition"]
            )
            .expect("Failed to register worker_restarts"),

            watermark_lag_ms: register_int_gauge_vec!(
                "pipeline_watermark_lag_ms",
                "Wall clock minus partition watermark, in milliseconds",
                &["partition"]
            )
            .expect("Failed to register watermark_lag_ms"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn inc_accepted(&self) {
        self.inner().samples_accepted.inc();
    }

    pub fn inc_dropped(&self, reason: &str) {
        self.inner()
            .samples_dropped
            .with_label_values(&[reason])
            .inc();
    }

    pub fn inc_late(&self) {
        self.inner().samples_late.inc();
    }

    pub fn set_collector_buffer(&self, items: i64) {
        self.inner().collector_buffer_occupancy.set(items);
    }

    pub fn observe_processing_latency(&self, duration_secs: f64) {
        self.inner().processing_latency_seconds.observe(duration_secs);
    }

    pub fn inc_windows_closed(&self, degraded: bool) {
        self.inner().windows_closed.inc();
        if degraded {
            self.inner().windows_degraded.inc();
        }
    }

    pub fn inc_anomalies(&self) {
        self.inner().anomalies_detected.inc();
    }

    pub fn inc_detector_failure(&self, detector: &str) {
        self.inner()
            .detector_failures
            .with_label_values(&[detector])
            .inc();
    }

    pub fn inc_alert_transition(&self, state: &str) {
        self.inner()
            .alert_transitions
            .with_label_values(&[state])
            .inc();
    }

    pub fn inc_notification_sent(&self, sink: &str) {
        self.inner()
            .notifications_sent
            .with_label_values(&[sink])
            .inc();
    }

    pub fn inc_sink_failure(&self, sink: &str) {
        self.inner().sink_failures.with_label_values(&[sink]).inc();
    }

    pub fn set_circuit_state(&self, sink: &str, state: i64) {
        self.inner()
            .circuit_state
            .with_label_values(&[sink])
            .set(state);
    }

    pub fn inc_backpressure_dropped(&self, stage: &str) {
        self.inner()
            .backpressure_dropped
            .with_label_values(&[stage])
            .inc();
    }

    pub fn set_spilled(&self, stage: &str, items: i64) {
        self.inner()
            .spilled_items
            .with_label_values(&[stage])
            .set(items);
    }

    pub fn inc_checkpoint_failure(&self) {
        self.inner().checkpoint_failures.inc();
    }

    pub fn inc_worker_restart(&self, partition: usize) {
        self.inner()
            .worker_restarts
            .with_label_values(&[&partition.to_string()])
            .inc();
    }

    pub fn set_watermark_lag(&self, partition: usize, lag_ms: i64) {
        self.inner()
            .watermark_lag_ms
            .with_label_values(&[&partition.to_string()])
            .set(lag_ms);
    }
}

/// Structured logger for pipeline events
///
/// Emits one record with a stable `event` field per significant occurrence so
/// downstream log pipelines can match on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, partitions: usize) {
        info!(
            event = "pipeline_started",
            instance = %self.instance,
            version = %version,
            partitions = partitions,
            "Telemetry pipeline started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "pipeline_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Telemetry pipeline shutting down"
        );
    }

    pub fn log_anomaly(&self, key: &str, value: f64, combined: f64, detectors: &str) {
        warn!(
            event = "anomaly_detected",
            instance = %self.instance,
            key = %key,
            value = value,
            combined_score = combined,
            detectors = %detectors,
            "Anomaly detected"
        );
    }

    pub fn log_alert_transition(
        &self,
        alert_id: &str,
        rule_id: &str,
        key: &str,
        from: &str,
        to: &str,
    ) {
        info!(
            event = "alert_transition",
            instance = %self.instance,
            alert_id = %alert_id,
            rule_id = %rule_id,
            key = %key,
            from = %from,
            to = %to,
            "Alert state changed"
        );
    }

    pub fn log_degraded_window(&self, window_id: &str, reason: &str) {
        warn!(
            event = "window_degraded",
            instance = %self.instance,
            window_id = %window_id,
            reason = %reason,
            "Window closed with partial result"
        );
    }

    pub fn log_sink_failure(&self, sink: &str, alert_id: &str, error: &str) {
        warn!(
            event = "sink_failure",
            instance = %self.instance,
            sink = %sink,
            alert_id = %alert_id,
            error = %error,
            "Notification delivery failed"
        );
    }

    pub fn log_meta_alert(&self, sink: &str, reason: &str) {
        error!(
            event = "meta_alert",
            instance = %self.instance,
            sink = %sink,
            reason = %reason,
            "Notification sink is persistently failing"
        );
    }

    pub fn log_checkpoint_failure(&self, partition: usize, error: &str) {
        error!(
            event = "checkpoint_failed",
            instance = %self.instance,
            partition = partition,
            error = %error,
            "Checkpoint write failed, restarting partition from last good checkpoint"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_metrics_handles_share_registry() {
        let metrics = PipelineMetrics::new();
        let other = metrics.clone();

        metrics.inc_accepted();
        metrics.inc_dropped("non_finite");
        other.inc_windows_closed(true);
        other.set_circuit_state("pager", 2);
        metrics.observe_processing_latency(0.0001);
        metrics.set_watermark_lag(0, 1500);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("pipeline-0");
        assert_eq!(logger.instance, "pipeline-0");
    }
}
