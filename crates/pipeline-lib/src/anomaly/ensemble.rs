//! Weighted-vote ensemble with per-key baselines

use super::baseline::BaselinePolicy;
use super::detectors::{
    Detector, DistributionalDetector, Features, KeyModel, StatisticalDetector, TrendDetector,
};
use crate::error::{ConfigError, DetectorError};
use crate::models::{AggregateResult, AnomalyScore, DetectorKind, PartitionKey, ScoreSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::trace;

/// Whether a metric is scored per closed window or per raw sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    #[default]
    Aggregate,
    Sample,
}

/// One configured detector with its vote weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorConfig {
    Statistical {
        weight: f64,
        #[serde(flatten)]
        params: StatisticalDetector,
    },
    Trend {
        weight: f64,
        #[serde(flatten)]
        params: TrendDetector,
    },
    Distributional {
        weight: f64,
        #[serde(flatten)]
        params: DistributionalDetector,
    },
}

impl DetectorConfig {
    pub fn weight(&self) -> f64 {
        match self {
            DetectorConfig::Statistical { weight, .. }
            | DetectorConfig::Trend { weight, .. }
            | DetectorConfig::Distributional { weight, .. } => *weight,
        }
    }

    fn detector(&self) -> Detector {
        match *self {
            DetectorConfig::Statistical { params, .. } => Detector::Statistical(params),
            DetectorConfig::Trend { params, .. } => Detector::Trend(params),
            DetectorConfig::Distributional { params, .. } => Detector::Distributional(params),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    pub detectors: Vec<DetectorConfig>,
    /// Combined score above which a point is anomalous
    pub threshold: f64,
    /// EWMA smoothing factor for baselines
    pub decay: f64,
    /// Exact-statistics observations before switching to EWMA
    pub warmup: u64,
    pub baseline_policy: BaselinePolicy,
    pub default_mode: DetectionMode,
    pub mode_overrides: HashMap<String, DetectionMode>,
    /// Raw points kept per key for sample-mode features
    pub tracker_points: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            detectors: vec![
                DetectorConfig::Statistical {
                    weight: 0.5,
                    params: StatisticalDetector::default(),
                },
                DetectorConfig::Trend {
                    weight: 0.25,
                    params: TrendDetector::default(),
                },
                DetectorConfig::Distributional {
                    weight: 0.25,
                    params: DistributionalDetector::default(),
                },
            ],
            threshold: 0.6,
            decay: 0.05,
            warmup: 30,
            baseline_policy: BaselinePolicy::AlwaysUpdate,
            default_mode: DetectionMode::Aggregate,
            mode_overrides: HashMap::new(),
            tracker_points: 10,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detectors.is_empty() {
            return Err(ConfigError::new("ensemble needs at least one detector"));
        }
        let mut seen = HashSet::new();
        for d in &self.detectors {
            let kind = d.detector().kind();
            if !seen.insert(kind) {
                return Err(ConfigError::new(format!("detector {} configured twice", kind)));
            }
            if !d.weight().is_finite() || d.weight() < 0.0 {
                return Err(ConfigError::new(format!("detector {} has an invalid weight", kind)));
            }
        }
        let total: f64 = self.detectors.iter().map(DetectorConfig::weight).sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::new(format!("detector weights sum to {}, expected 1", total)));
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(ConfigError::new("threshold must be in [0, 1)"));
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(ConfigError::new("decay must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Weighted average over the detectors that produced a score.
///
/// Returns `None` when no detector contributed.
pub fn combine(votes: &[(DetectorKind, f64, Result<f64, DetectorError>)]) -> Option<f64> {
    let (weighted, weight) = votes
        .iter()
        .filter_map(|(_, w, r)| r.as_ref().ok().map(|s| (s * w, *w)))
        .fold((0.0, 0.0), |(acc_s, acc_w), (s, w)| (acc_s + s, acc_w + w));

    if weight > 0.0 {
        Some(weighted / weight)
    } else {
        None
    }
}

/// Detector ensemble for one partition; owns every baseline of its keys
pub struct Ensemble {
    config: EnsembleConfig,
    detectors: Vec<(Detector, f64)>,
    disabled: HashSet<DetectorKind>,
    models: HashMap<PartitionKey, KeyModel>,
}

impl Ensemble {
    pub fn new(config: EnsembleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let detectors = config
            .detectors
            .iter()
            .map(|d| (d.detector(), d.weight()))
            .collect();

        Ok(Self {
            config,
            detectors,
            disabled: HashSet::new(),
            models: HashMap::new(),
        })
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn mode_for(&self, metric: &str) -> DetectionMode {
        self.config
            .mode_overrides
            .get(metric)
            .copied()
            .unwrap_or(self.config.default_mode)
    }

    /// Take a detector out of (or back into) the vote
    pub fn set_enabled(&mut self, kind: DetectorKind, enabled: bool) {
        if enabled {
            self.disabled.remove(&kind);
        } else {
            self.disabled.insert(kind);
        }
    }

    pub fn model(&self, key: &PartitionKey) -> Option<&KeyModel> {
        self.models.get(key)
    }

    /// Score a closed window. `alert_active` reports whether an alert on the key is pending or firing.
    pub fn evaluate_aggregate(&mut self, aggregate: &AggregateResult, alert_active: bool) -> AnomalyScore {
        let features = Features {
            timestamp_ms: aggregate.interval.end_ms,
            value: aggregate.mean,
            slope: aggregate.trend_slope,
            spread: aggregate.spread(),
            count: aggregate.count,
        };
        let source = ScoreSource::Aggregate {
            window_id: aggregate.window_id.clone(),
        };
        self.evaluate(&aggregate.key, features, source, alert_active)
    }

    /// Score one raw sample released by the window engine
    pub fn evaluate_sample(
        &mut self,
        key: &PartitionKey,
        timestamp_ms: i64,
        value: f64,
        alert_active: bool,
    ) -> AnomalyScore {
        let tracker_points = self.config.tracker_points;
        let model = self
            .models
            .entry(key.clone())
            .or_insert_with(|| KeyModel::new(tracker_points, key.stable_hash()));
        let features = model.tracker.observe(timestamp_ms, value);
        self.evaluate(key, features, ScoreSource::Sample, alert_active)
    }

    fn evaluate(
        &mut self,
        key: &PartitionKey,
        features: Features,
        source: ScoreSource,
        alert_active: bool,
    ) -> AnomalyScore {
        let tracker_points = self.config.tracker_points;
        let model = self
            .models
            .entry(key.clone())
            .or_insert_with(|| KeyModel::new(tracker_points, key.stable_hash()));

        let mut votes = Vec::with_capacity(self.detectors.len());
        for (detector, weight) in &self.detectors {
            if self.disabled.contains(&detector.kind()) {
                continue;
            }
            votes.push((detector.kind(), *weight, detector.score(&features, model)));
        }

        let mut detector_scores = BTreeMap::new();
        let mut excluded = Vec::new();
        for (kind, _, result) in &votes {
            match result {
                Ok(score) => {
                    detector_scores.insert(*kind, *score);
                }
                Err(e) => {
                    trace!(key = %key, detector = %kind, error = %e, "Detector excluded");
                    excluded.push(*kind);
                }
            }
        }

        let combined = combine(&votes);
        let is_anomaly = combined.map(|c| c > self.config.threshold).unwrap_or(false);

        let history = self
            .detectors
            .iter()
            .find_map(|(d, _)| match d {
                Detector::Distributional(p) => Some(p.history),
                _ => None,
            })
            .unwrap_or(0);
        if history > 0 {
            model.forest.record(features.vector(), history);
        }

        if self.config.baseline_policy.should_update(alert_active, is_anomaly) {
            model
                .baseline
                .update(features.value, features.timestamp_ms, self.config.decay, self.config.warmup);
        }

        AnomalyScore {
            key: key.clone(),
            timestamp_ms: features.timestamp_ms,
            source,
            value: features.value,
            detector_scores,
            excluded,
            combined: combined.unwrap_or(0.0),
            is_anomaly,
        }
    }
}
