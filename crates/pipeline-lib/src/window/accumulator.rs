//! Incremental per-window statistics

use super::digest::{DigestError, TDigest};
use crate::models::{AggregateResult, PartitionKey, WindowInterval, WindowKind};

/// O(1)-per-sample window accumulator.
///
/// Mean and variance use Welford's update, the trend slope is a streaming
/// least-squares fit over `(seconds since first sample, value)`, and
/// percentiles come from a t-digest. A digest failure is remembered and the
/// window is reported degraded instead of failing the pipeline.
#[derive(Debug, Clone)]
pub struct Accumulator {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    origin_ms: Option<i64>,
    sum_t: f64,
    sum_tt: f64,
    sum_v: f64,
    sum_tv: f64,
    digest: TDigest,
    digest_error: Option<DigestError>,
}

impl Accumulator {
    pub fn new(compression: f64) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            origin_ms: None,
            sum_t: 0.0,
            sum_tt: 0.0,
            sum_v: 0.0,
            sum_tv: 0.0,
            digest: TDigest::new(compression),
            digest_error: None,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn add(&mut self, timestamp_ms: i64, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let origin = *self.origin_ms.get_or_insert(timestamp_ms);
        let t = (timestamp_ms - origin) as f64 / 1000.0;
        self.sum_t += t;
        self.sum_tt += t * t;
        self.sum_v += value;
        self.sum_tv += t * value;

        if self.digest_error.is_none() {
            if let Err(e) = self.digest.add(value) {
                self.digest_error = Some(e);
            }
        }
    }

    /// Least-squares slope in value units per second; zero without time spread
    pub fn slope(&self) -> f64 {
        let n = self.count as f64;
        let denom = n * self.sum_tt - self.sum_t * self.sum_t;
        if self.count < 2 || denom.abs() < f64::EPSILON {
            return 0.0;
        }
        let slope = (n * self.sum_tv - self.sum_t * self.sum_v) / denom;
        if slope.is_finite() {
            slope
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// Produce the window's result. `force_degraded` marks windows closed early.
    pub fn finish(
        mut self,
        key: &PartitionKey,
        kind: WindowKind,
        interval: WindowInterval,
        force_degraded: bool,
    ) -> (AggregateResult, Option<DigestError>) {
        let percentiles = match self.digest_error.take() {
            Some(e) => Err(e),
            None if self.count == 0 => Err(DigestError::Empty),
            None => self.digest.percentiles(),
        };
        let (percentiles, error) = match percentiles {
            Ok(p) => (Some(p), None),
            Err(e) => (None, Some(e)),
        };

        let empty = self.count == 0;
        let result = AggregateResult {
            window_id: AggregateResult::window_id_for(key, kind, &interval),
            key: key.clone(),
            kind,
            interval,
            count: self.count,
            mean: self.mean,
            min: if empty { 0.0 } else { self.min },
            max: if empty { 0.0 } else { self.max },
            stddev: self.stddev(),
            percentiles,
            trend_slope: self.slope(),
            degraded: force_degraded || error.is_some(),
        };
        (result, error)
    }
}
