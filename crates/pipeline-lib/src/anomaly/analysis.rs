//! Correlation and forecasting over aggregate snapshots
//!
//! Pure functions: callers pass owned or borrowed snapshots of exported
//! aggregates, nothing here holds references back into the pipeline.

use crate::models::AggregateResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Minimum aligned windows for a correlation to be reported
pub const MIN_ALIGNED_WINDOWS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    /// Pearson coefficient of window means, in [-1, 1]
    pub coefficient: f64,
    pub aligned_windows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub at_ms: i64,
    pub predicted: f64,
    /// Fitted change per second
    pub slope: f64,
    pub r_squared: f64,
    pub based_on: usize,
}

/// Pearson correlation of two keys' window means, aligned by identical interval
pub fn correlate(a: &[AggregateResult], b: &[AggregateResult]) -> Option<Correlation> {
    let by_interval: BTreeMap<(i64, i64), f64> = a
        .iter()
        .map(|r| ((r.interval.start_ms, r.interval.end_ms), r.mean))
        .collect();

    let pairs: Vec<(f64, f64)> = b
        .iter()
        .filter_map(|r| {
            by_interval
                .get(&(r.interval.start_ms, r.interval.end_ms))
                .map(|x| (*x, r.mean))
        })
        .collect();

    if pairs.len() < MIN_ALIGNED_WINDOWS {
        return None;
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }

    let denom = (var_x * var_y).sqrt();
    if denom < f64::EPSILON || !denom.is_finite() {
        return None;
    }

    Some(Correlation {
        coefficient: (cov / denom).clamp(-1.0, 1.0),
        aligned_windows: pairs.len(),
    })
}

/// Least-squares extrapolation of window means `horizon_secs` past the latest window end
pub fn forecast(history: &[AggregateResult], horizon_secs: f64) -> Option<Forecast> {
    if history.len() < 2 || !horizon_secs.is_finite() {
        return None;
    }

    let origin = history.iter().map(|r| r.interval.end_ms).min()?;
    let latest = history.iter().map(|r| r.interval.end_ms).max()?;
    let points: Vec<(f64, f64)> = history
        .iter()
        .map(|r| ((r.interval.end_ms - origin) as f64 / 1000.0, r.mean))
        .collect();

    let n = points.len() as f64;
    let mean_t = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_v = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut stt, mut stv, mut svv) = (0.0, 0.0, 0.0);
    for (t, v) in &points {
        stt += (t - mean_t).powi(2);
        stv += (t - mean_t) * (v - mean_v);
        svv += (v - mean_v).powi(2);
    }
    if stt < f64::EPSILON {
        return None;
    }

    let slope = stv / stt;
    let intercept = mean_v - slope * mean_t;
    let r_squared = if svv < f64::EPSILON {
        1.0
    } else {
        (stv * stv) / (stt * svv)
    };

    let at_ms = latest + (horizon_secs * 1000.0) as i64;
    let t = (at_ms - origin) as f64 / 1000.0;

    Some(Forecast {
        at_ms,
        predicted: intercept + slope * t,
        slope,
        r_squared,
        based_on: points.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PartitionKey, WindowInterval, WindowKind};

    fn window(metric: &str, start_ms: i64, mean: f64) -> AggregateResult {
        let key = PartitionKey::new(metric, Default::default());
        let interval = WindowInterval {
            start_ms,
            end_ms: start_ms + 10_000,
        };
        AggregateResult {
            window_id: AggregateResult::window_id_for(&key, WindowKind::Sliding, &interval),
            key,
            kind: WindowKind::Sliding,
            interval,
            count: 10,
            mean,
            min: mean,
            max: mean,
            stddev: 0.0,
            percentiles: None,
            trend_slope: 0.0,
            degraded: false,
        }
    }

    #[test]
    fn test_correlation_of_linked_series() {
        let a: Vec<_> = (0..10).map(|i| window("cpu", i * 10_000, i as f64)).collect();
        let b: Vec<_> = (0..10).map(|i| window("latency", i * 10_000, 3.0 * i as f64 + 1.0)).collect();
        let c: Vec<_> = (0..10).map(|i| window("free", i * 10_000, -(i as f64))).collect();

        assert!((correlate(&a, &b).unwrap().coefficient - 1.0).abs() < 1e-9);
        assert!((correlate(&a, &c).unwrap().coefficient + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_needs_aligned_windows() {
        let a: Vec<_> = (0..5).map(|i| window("cpu", i * 10_000, i as f64)).collect();
        let b: Vec<_> = (0..5).map(|i| window("mem", 5_000 + i * 10_000, i as f64)).collect();
        assert!(correlate(&a, &b).is_none());
    }

    #[test]
    fn test_forecast_extrapolates_linear_growth() {
        // +2 per window of 10s => 0.2 per second
        let history: Vec<_> = (0..6).map(|i| window("disk", i * 10_000, 50.0 + 2.0 * i as f64)).collect();
        let f = forecast(&history, 60.0).unwrap();

        assert!((f.slope - 0.2).abs() < 1e-9);
        assert!((f.predicted - 72.0).abs() < 1e-9);
        assert!((f.r_squared - 1.0).abs() < 1e-9);
        assert_eq!(f.at_ms, 60_000 + 60_000);
    }

    #[test]
    fn test_forecast_needs_two_distinct_points() {
        assert!(forecast(&[window("disk", 0, 1.0)], 10.0).is_none());
    }
}
