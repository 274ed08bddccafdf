//! Telemetry pipeline library
//!
//! This crate provides the core functionality for:
//! - Sample ingestion with skew validation and bounded buffering
//! - Stable hash partitioning
//! - Sliding and session windows with watermarks and streaming aggregates
//! - Ensemble anomaly detection with per-key baselines
//! - Alert lifecycle, escalation and notification dispatch
//! - Backpressure, checkpoints, retries and circuit breaking
//! - Health checks and observability

pub mod alerting;
pub mod anomaly;
pub mod collector;
pub mod error;
pub mod export;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod proto;
pub mod reliability;
pub mod router;
pub mod window;

pub use error::{
    CheckpointError, ConfigError, DetectorError, IngestionError, LatenessError, PipelineError,
    SinkError,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use pipeline::{Pipeline, PipelineConfig, PipelineHandle};
