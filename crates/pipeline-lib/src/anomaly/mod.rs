//! Anomaly detection ensemble
//!
//! This module provides:
//! - Statistical-threshold, trend and distributional (isolation forest) detectors
//! - Weighted-vote combination with renormalization over failed detectors
//! - Per-key baselines with a configurable freeze policy
//! - Correlation and forecasting over aggregate snapshots

pub mod analysis;
mod baseline;
mod detectors;
mod ensemble;
mod isolation;

#[cfg(test)]
mod tests;

pub use analysis::{correlate, forecast, Correlation, Forecast};
pub use baseline::{Baseline, BaselinePolicy};
pub use detectors::{
    Detector, DistributionalDetector, FeatureTracker, Features, ForestState, KeyModel,
    StatisticalDetector, TrendDetector,
};
pub use ensemble::{combine, DetectionMode, DetectorConfig, Ensemble, EnsembleConfig};
pub use isolation::{average_path_length, FeatureVector, IsolationForest};
