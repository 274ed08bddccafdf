//! Error taxonomy for the pipeline
//!
//! Per-sample and per-evaluation errors are absorbed where they happen and
//! turned into counters. Only [`CheckpointError`] is treated as a fault that
//! restarts a partition worker.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed or out-of-range sample rejected by the collector
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestionError {
    #[error("metric name is missing")]
    MissingName,

    #[error("value {0} is not finite")]
    NonFiniteValue(f64),

    #[error("timestamp {timestamp_ms} is older than the allowed skew (earliest {earliest_ms})")]
    TooOld { timestamp_ms: i64, earliest_ms: i64 },

    #[error("timestamp {timestamp_ms} is too far in the future (latest {latest_ms})")]
    TooFarInFuture { timestamp_ms: i64, latest_ms: i64 },
}

impl IngestionError {
    /// Short reason used as a metric label
    pub fn reason(&self) -> &'static str {
        match self {
            IngestionError::MissingName => "missing_name",
            IngestionError::NonFiniteValue(_) => "non_finite",
            IngestionError::TooOld { .. } => "too_old",
            IngestionError::TooFarInFuture { .. } => "too_far_in_future",
        }
    }
}

/// Sample that arrived behind its key's watermark
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sample at {timestamp_ms} for {key} is behind watermark {watermark_ms}")]
pub struct LatenessError {
    pub key: String,
    pub timestamp_ms: i64,
    pub watermark_ms: i64,
}

/// Failure of a single detector for a single evaluation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectorError {
    #[error("insufficient data: need {needed}, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("baseline has no spread to score against")]
    DegenerateBaseline,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Notification delivery failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    #[error("sink {0} is not registered")]
    UnknownSink(String),

    #[error("delivery to {sink} failed: {reason}")]
    Delivery { sink: String, reason: String },

    #[error("circuit open for sink {sink}")]
    CircuitOpen { sink: String },

    #[error("delivery to {sink} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        sink: String,
        attempts: u32,
        last_error: String,
    },
}

impl SinkError {
    pub fn sink(&self) -> &str {
        match self {
            SinkError::UnknownSink(sink) => sink,
            SinkError::Delivery { sink, .. } => sink,
            SinkError::CircuitOpen { sink } => sink,
            SinkError::RetriesExhausted { sink, .. } => sink,
        }
    }
}

/// Durable-storage failure. Fatal for the affected partition.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode checkpoint record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Invalid library configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        ConfigError(message.into())
    }
}

/// Errors surfaced by the pipeline handle to its callers
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("alert {0} not found")]
    AlertNotFound(String),

    #[error("partition {0} is not running")]
    PartitionUnavailable(usize),

    #[error(transparent)]
    Transition(#[from] crate::alerting::TransitionError),

    #[error(transparent)]
    Backpressure(#[from] crate::reliability::BackpressureError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
