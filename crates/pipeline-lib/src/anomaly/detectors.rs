//! The fixed set of detectors the ensemble can be assembled from

use super::baseline::Baseline;
use super::isolation::{FeatureVector, IsolationForest};
use crate::error::DetectorError;
use crate::models::DetectorKind;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What a detector sees for one evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Features {
    pub timestamp_ms: i64,
    pub value: f64,
    /// Rate of change in value units per second
    pub slope: f64,
    /// Dispersion around the value (p95 − p50, or recent stddev for raw samples)
    pub spread: f64,
    /// Observations behind `slope`
    pub count: u64,
}

impl Features {
    pub fn vector(&self) -> FeatureVector {
        [self.value, self.slope, self.spread]
    }
}

/// Recent raw points of a key, used to derive features for sample-mode scoring
#[derive(Debug, Clone)]
pub struct FeatureTracker {
    capacity: usize,
    points: VecDeque<(i64, f64)>,
}

impl FeatureTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            points: VecDeque::with_capacity(capacity.max(2)),
        }
    }

    pub fn observe(&mut self, timestamp_ms: i64, value: f64) -> Features {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back((timestamp_ms, value));

        let n = self.points.len() as f64;
        let t0 = self.points[0].0;
        let (mut st, mut sv, mut stt, mut stv) = (0.0, 0.0, 0.0, 0.0);
        for &(ts, v) in &self.points {
            let t = (ts - t0) as f64 / 1000.0;
            st += t;
            sv += v;
            stt += t * t;
            stv += t * v;
        }
        let denom = n * stt - st * st;
        let slope = if self.points.len() < 2 || denom.abs() < f64::EPSILON {
            0.0
        } else {
            (n * stv - st * sv) / denom
        };

        let mean = sv / n;
        let spread = if self.points.len() < 2 {
            0.0
        } else {
            let ss: f64 = self.points.iter().map(|&(_, v)| (v - mean).powi(2)).sum();
            (ss / (n - 1.0)).sqrt()
        };

        Features {
            timestamp_ms,
            value,
            slope,
            spread,
            count: self.points.len() as u64,
        }
    }
}

/// Rolling feature history and the forest built from it
#[derive(Debug, Clone)]
pub struct ForestState {
    history: VecDeque<FeatureVector>,
    forest: Option<IsolationForest>,
    since_build: usize,
    builds: u64,
    seed: u64,
}

impl ForestState {
    pub fn new(seed: u64) -> Self {
        Self {
            history: VecDeque::new(),
            forest: None,
            since_build: 0,
            builds: 0,
            seed,
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn record(&mut self, point: FeatureVector, capacity: usize) {
        if point.iter().all(|v| v.is_finite()) {
            if self.history.len() >= capacity {
                self.history.pop_front();
            }
            self.history.push_back(point);
            self.since_build += 1;
        }
    }
}

/// Per-key state detectors read from
#[derive(Debug, Clone)]
pub struct KeyModel {
    pub baseline: Baseline,
    pub tracker: FeatureTracker,
    pub forest: ForestState,
}

impl KeyModel {
    pub fn new(tracker_points: usize, seed: u64) -> Self {
        Self {
            baseline: Baseline::new(),
            tracker: FeatureTracker::new(tracker_points),
            forest: ForestState::new(seed),
        }
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Z-score against the baseline, squashed so `z = k` scores 0.5
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticalDetector {
    pub k: f64,
    /// Baseline observations required before scoring
    pub warmup: u64,
}

impl Default for StatisticalDetector {
    fn default() -> Self {
        Self { k: 2.5, warmup: 10 }
    }
}

impl StatisticalDetector {
    pub fn score(&self, features: &Features, baseline: &Baseline) -> Result<f64, DetectorError> {
        if !baseline.is_warm(self.warmup) {
            return Err(DetectorError::InsufficientData {
                needed: self.warmup as usize,
                available: baseline.observations as usize,
            });
        }
        let stddev = baseline.stddev();
        if stddev < 1e-9 {
            return Err(DetectorError::DegenerateBaseline);
        }

        let z = (features.value - baseline.mean).abs() / stddev;
        Ok(logistic(2.0 * (z - self.k)))
    }
}

/// Slope magnitude relative to a rate-of-change limit, weighted by confidence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendDetector {
    /// Rate of change (value units per second) that scores 0.5 at full confidence
    pub max_rate: f64,
    /// Observations needed for full confidence
    pub min_samples: u64,
}

impl Default for TrendDetector {
    fn default() -> Self {
        Self {
            max_rate: 1.0,
            min_samples: 5,
        }
    }
}

impl TrendDetector {
    pub fn score(&self, features: &Features) -> Result<f64, DetectorError> {
        if self.max_rate <= 0.0 || !self.max_rate.is_finite() {
            return Err(DetectorError::InvalidInput("max_rate must be positive".into()));
        }
        if features.count < 2 {
            return Err(DetectorError::InsufficientData {
                needed: 2,
                available: features.count as usize,
            });
        }
        if !features.slope.is_finite() {
            return Err(DetectorError::InvalidInput("slope is not finite".into()));
        }

        let r = features.slope.abs() / self.max_rate;
        let confidence = (features.count as f64 / self.min_samples.max(1) as f64).min(1.0);
        Ok(confidence * r * r / (1.0 + r * r))
    }
}

/// Isolation-style outlier scoring of `[value, slope, spread]` against recent history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionalDetector {
    /// Feature vectors kept per key
    pub history: usize,
    pub trees: usize,
    pub sample_size: usize,
    /// History required before scoring
    pub min_history: usize,
    /// New vectors between forest rebuilds
    pub rebuild_every: usize,
}

impl Default for DistributionalDetector {
    fn default() -> Self {
        Self {
            history: 256,
            trees: 50,
            sample_size: 128,
            min_history: 32,
            rebuild_every: 32,
        }
    }
}

impl DistributionalDetector {
    pub fn score(&self, features: &Features, state: &mut ForestState) -> Result<f64, DetectorError> {
        if state.history.len() < self.min_history.max(2) {
            return Err(DetectorError::InsufficientData {
                needed: self.min_history,
                available: state.history.len(),
            });
        }
        let point = features.vector();
        if point.iter().any(|v| !v.is_finite()) {
            return Err(DetectorError::InvalidInput("feature vector is not finite".into()));
        }

        if state.forest.is_none() || state.since_build >= self.rebuild_every {
            let points: Vec<FeatureVector> = state.history.iter().copied().collect();
            let mut rng = StdRng::seed_from_u64(state.seed ^ state.builds);
            state.forest = Some(IsolationForest::build(&points, self.trees, self.sample_size, &mut rng));
            state.builds += 1;
            state.since_build = 0;
        }

        let forest = state
            .forest
            .as_ref()
            .ok_or_else(|| DetectorError::InvalidInput("forest unavailable".into()))?;
        let s = forest.score(&point);
        Ok(((s - 0.5) / 0.5).clamp(0.0, 1.0))
    }
}

/// A configured detector. The set is closed and fixed at configuration time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Detector {
    Statistical(StatisticalDetector),
    Trend(TrendDetector),
    Distributional(DistributionalDetector),
}

impl Detector {
    pub fn kind(&self) -> DetectorKind {
        match self {
            Detector::Statistical(_) => DetectorKind::Statistical,
            Detector::Trend(_) => DetectorKind::Trend,
            Detector::Distributional(_) => DetectorKind::Distributional,
        }
    }

    /// Score in [0, 1], or the reason this detector sits out this evaluation
    pub fn score(&self, features: &Features, model: &mut KeyModel) -> Result<f64, DetectorError> {
        let score = match self {
            Detector::Statistical(d) => d.score(features, &model.baseline),
            Detector::Trend(d) => d.score(features),
            Detector::Distributional(d) => d.score(features, &mut model.forest),
        }?;

        if score.is_finite() {
            Ok(score.clamp(0.0, 1.0))
        } else {
            Err(DetectorError::InvalidInput(format!("{} produced a non-finite score", self.kind())))
        }
    }
}
