//! Per-key rolling baseline

use serde::{Deserialize, Serialize};

/// When the baseline is allowed to absorb new observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselinePolicy {
    /// Update after every evaluation, flagged or not
    #[default]
    AlwaysUpdate,
    /// Hold the baseline while an alert on the key is pending or firing
    FreezeWhileFiring,
    /// Skip updates for points the ensemble flagged
    FreezeOnAnomaly,
}

impl BaselinePolicy {
    pub fn should_update(&self, alert_active: bool, flagged: bool) -> bool {
        match self {
            BaselinePolicy::AlwaysUpdate => true,
            BaselinePolicy::FreezeWhileFiring => !alert_active,
            BaselinePolicy::FreezeOnAnomaly => !flagged,
        }
    }
}

/// Rolling "normal" reference for a key.
///
/// The first `warmup` observations use Welford's exact mean/variance so the
/// baseline starts from a sound estimate, after which it switches to
/// exponentially weighted updates with smoothing factor `decay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub variance: f64,
    pub observations: u64,
    pub last_update_ms: i64,
    #[serde(skip)]
    m2: f64,
}

impl Default for Baseline {
    fn default() -> Self {
        Self::new()
    }
}

impl Baseline {
    pub fn new() -> Self {
        Self {
            mean: 0.0,
            variance: 0.0,
            observations: 0,
            last_update_ms: 0,
            m2: 0.0,
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    pub fn is_warm(&self, warmup: u64) -> bool {
        self.observations >= warmup.max(2)
    }

    pub fn update(&mut self, value: f64, timestamp_ms: i64, decay: f64, warmup: u64) {
        if !value.is_finite() {
            return;
        }

        self.observations += 1;
        self.last_update_ms = timestamp_ms;

        if self.observations <= warmup.max(2) {
            let delta = value - self.mean;
            self.mean += delta / self.observations as f64;
            self.m2 += delta * (value - self.mean);
            if self.observations > 1 {
                self.variance = self.m2 / (self.observations - 1) as f64;
            }
            return;
        }

        let delta = value - self.mean;
        self.mean += decay * delta;
        self.variance = (1.0 - decay) * (self.variance + decay * delta * delta);
    }
}
