//! Daemon configuration
//!
//! Settings come from an optional file named by `PIPELINE_CONFIG` layered
//! under `PIPELINE_*` environment variables (nested keys use `__`, e.g.
//! `PIPELINE_COLLECTOR__BUFFER_CAPACITY=5000`).

use anyhow::{Context, Result};
use pipeline_lib::alerting::{AlertingConfig, DispatcherConfig, LogSink, NotificationSink, WebhookSink};
use pipeline_lib::anomaly::{BaselinePolicy, DetectionMode, DetectorConfig, EnsembleConfig};
use pipeline_lib::collector::CollectorConfig;
use pipeline_lib::export::ExportConfig;
use pipeline_lib::pipeline::WorkerConfig;
use pipeline_lib::reliability::{CheckpointConfig, StageQueueConfig};
use pipeline_lib::window::{WindowConfig, WindowSpec, DEFAULT_COMPRESSION};
use pipeline_lib::PipelineConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Instance name used in structured logs
    pub instance: String,
    /// Port for the HTTP API, health checks and metrics
    pub api_port: u16,
    pub partitions: usize,
    pub tick_interval_ms: u64,
    pub max_restarts: u32,
    pub restart_backoff_ms: u64,
    /// JSON rules file, hot-reloaded when it changes
    pub rules_file: Option<PathBuf>,
    pub collector: CollectorSettings,
    pub window: WindowSettings,
    pub detection: DetectionSettings,
    pub alerting: AlertingConfig,
    pub dispatcher: DispatcherConfig,
    pub queue: StageQueueConfig,
    pub checkpoint: CheckpointSettings,
    pub export: ExportSettings,
    pub sinks: Vec<SinkSettings>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            instance: std::env::var("HOSTNAME").unwrap_or_else(|_| "telemetry-pipeline".to_string()),
            api_port: 8080,
            partitions: 4,
            tick_interval_ms: 1000,
            max_restarts: 5,
            restart_backoff_ms: 1000,
            rules_file: None,
            collector: CollectorSettings::default(),
            window: WindowSettings::default(),
            detection: DetectionSettings::default(),
            alerting: AlertingConfig::default(),
            dispatcher: DispatcherConfig::default(),
            queue: StageQueueConfig::default(),
            checkpoint: CheckpointSettings::default(),
            export: ExportSettings::default(),
            sinks: vec![SinkSettings::Log {
                name: "log".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub max_skew_past_secs: u64,
    pub max_skew_future_secs: u64,
    pub buffer_capacity: usize,
    pub flush_interval_ms: u64,
    pub degraded_occupancy: f64,
    pub degraded_drop_rate: f64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        let defaults = CollectorConfig::default();
        Self {
            max_skew_past_secs: defaults.max_skew_past.as_secs(),
            max_skew_future_secs: defaults.max_skew_future.as_secs(),
            buffer_capacity: defaults.buffer_capacity,
            flush_interval_ms: defaults.flush_interval.as_millis() as u64,
            degraded_occupancy: defaults.degraded_occupancy,
            degraded_drop_rate: defaults.degraded_drop_rate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowSettings {
    pub default: WindowSpec,
    pub overrides: HashMap<String, WindowSpec>,
    pub allowed_lateness_ms: i64,
    pub idle_timeout_ms: i64,
    pub digest_compression: f64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        let defaults = WindowConfig::default();
        Self {
            default: defaults.default_spec,
            overrides: HashMap::new(),
            allowed_lateness_ms: defaults.allowed_lateness_ms,
            idle_timeout_ms: defaults.idle_timeout_ms,
            digest_compression: DEFAULT_COMPRESSION,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    /// Replaces the default three-detector ensemble when set
    pub detectors: Option<Vec<DetectorConfig>>,
    pub threshold: f64,
    pub decay: f64,
    pub warmup: u64,
    pub baseline_policy: BaselinePolicy,
    pub default_mode: DetectionMode,
    pub mode_overrides: HashMap<String, DetectionMode>,
    pub tracker_points: usize,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        let defaults = EnsembleConfig::default();
        Self {
            detectors: None,
            threshold: defaults.threshold,
            decay: defaults.decay,
            warmup: defaults.warmup,
            baseline_policy: defaults.baseline_policy,
            default_mode: defaults.default_mode,
            mode_overrides: HashMap::new(),
            tracker_points: defaults.tracker_points,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    pub every_offsets: u64,
    pub compact_interval_secs: u64,
    pub fsync: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        let defaults = CheckpointConfig::default();
        Self {
            enabled: true,
            dir: defaults.dir,
            every_offsets: defaults.every_offsets,
            compact_interval_secs: defaults.compact_interval_secs,
            fsync: defaults.fsync,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    pub retention_per_key: usize,
    pub anomaly_log_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        let defaults = ExportConfig::default();
        Self {
            retention_per_key: defaults.retention_per_key,
            anomaly_log_capacity: defaults.anomaly_log_capacity,
            broadcast_capacity: defaults.broadcast_capacity,
        }
    }
}

/// A notification sink definition
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSettings {
    Log {
        name: String,
    },
    Webhook {
        name: String,
        url: String,
        #[serde(default = "default_webhook_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_webhook_timeout_ms() -> u64 {
    5000
}

impl PipelineSettings {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("PIPELINE_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let ensemble_defaults = EnsembleConfig::default();
        let d = &self.detection;

        PipelineConfig {
            partitions: self.partitions,
            collector: CollectorConfig {
                max_skew_past: Duration::from_secs(self.collector.max_skew_past_secs),
                max_skew_future: Duration::from_secs(self.collector.max_skew_future_secs),
                buffer_capacity: self.collector.buffer_capacity,
                flush_interval: Duration::from_millis(self.collector.flush_interval_ms),
                degraded_occupancy: self.collector.degraded_occupancy,
                degraded_drop_rate: self.collector.degraded_drop_rate,
            },
            worker: WorkerConfig {
                window: WindowConfig {
                    default_spec: self.window.default,
                    overrides: self.window.overrides.clone(),
                    allowed_lateness_ms: self.window.allowed_lateness_ms,
                    idle_timeout_ms: self.window.idle_timeout_ms,
                    max_event_delay_ms: (self.collector.max_skew_past_secs as i64).saturating_mul(1000),
                    digest_compression: self.window.digest_compression,
                },
                ensemble: EnsembleConfig {
                    detectors: d.detectors.clone().unwrap_or(ensemble_defaults.detectors),
                    threshold: d.threshold,
                    decay: d.decay,
                    warmup: d.warmup,
                    baseline_policy: d.baseline_policy,
                    default_mode: d.default_mode,
                    mode_overrides: d.mode_overrides.clone(),
                    tracker_points: d.tracker_points,
                },
                alerting: self.alerting.clone(),
                checkpoint: self.checkpoint.enabled.then(|| CheckpointConfig {
                    dir: self.checkpoint.dir.clone(),
                    every_offsets: self.checkpoint.every_offsets,
                    compact_interval_secs: self.checkpoint.compact_interval_secs,
                    fsync: self.checkpoint.fsync,
                }),
            },
            dispatcher: self.dispatcher.clone(),
            queue: self.queue.clone(),
            export: ExportConfig {
                retention_per_key: self.export.retention_per_key,
                anomaly_log_capacity: self.export.anomaly_log_capacity,
                broadcast_capacity: self.export.broadcast_capacity,
            },
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            max_restarts: self.max_restarts,
            restart_backoff: Duration::from_millis(self.restart_backoff_ms),
            instance: self.instance.clone(),
        }
    }

    pub fn build_sinks(&self) -> Result<Vec<Arc<dyn NotificationSink>>> {
        let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            match sink {
                SinkSettings::Log { name } => sinks.push(Arc::new(LogSink::new(name.clone()))),
                SinkSettings::Webhook {
                    name,
                    url,
                    timeout_ms,
                } => {
                    let webhook = WebhookSink::new(name.clone(), url, Duration::from_millis(*timeout_ms))
                        .with_context(|| format!("Invalid webhook sink {}", name))?;
                    sinks.push(Arc::new(webhook));
                }
            }
        }
        Ok(sinks)
    }
}
