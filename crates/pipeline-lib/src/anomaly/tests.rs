//! Ensemble behaviour tests

use super::*;
use crate::error::DetectorError;
use crate::models::{
    AggregateResult, DetectorKind, PartitionKey, Percentiles, WindowInterval, WindowKind,
};

/// Deterministic series with mean 100 and standard deviation 5
fn normal(i: i64) -> f64 {
    100.0 + 5.0 * std::f64::consts::SQRT_2 * (1.3 * i as f64).sin()
}

fn sample_mode_config(policy: BaselinePolicy) -> EnsembleConfig {
    EnsembleConfig {
        detectors: vec![
            DetectorConfig::Statistical {
                weight: 0.5,
                params: StatisticalDetector::default(),
            },
            DetectorConfig::Trend {
                weight: 0.25,
                params: TrendDetector {
                    max_rate: 10.0,
                    min_samples: 5,
                },
            },
            DetectorConfig::Distributional {
                weight: 0.25,
                params: DistributionalDetector::default(),
            },
        ],
        default_mode: DetectionMode::Sample,
        baseline_policy: policy,
        ..Default::default()
    }
}

fn key() -> PartitionKey {
    PartitionKey::new("latency", Default::default())
}

mod combination_tests {
    use super::*;

    #[test]
    fn test_failed_detector_is_excluded_and_weights_renormalized() {
        let votes = vec![
            (DetectorKind::Statistical, 0.5, Ok(0.8)),
            (
                DetectorKind::Trend,
                0.25,
                Err(DetectorError::InsufficientData {
                    needed: 5,
                    available: 1,
                }),
            ),
            (DetectorKind::Distributional, 0.25, Ok(0.4)),
        ];
        let combined = combine(&votes).unwrap();
        assert!((combined - (0.5 * 0.8 + 0.25 * 0.4) / 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_all_detectors_failing_yields_no_score() {
        let votes = vec![(DetectorKind::Statistical, 1.0, Err(DetectorError::DegenerateBaseline))];
        assert_eq!(combine(&votes), None);

        let mut ensemble = Ensemble::new(sample_mode_config(BaselinePolicy::AlwaysUpdate)).unwrap();
        let score = ensemble.evaluate_sample(&key(), 0, 1.0, false);
        assert_eq!(score.combined, 0.0);
        assert!(!score.is_anomaly);
        assert_eq!(score.excluded.len(), 3);
    }

    #[test]
    fn test_disabled_detector_renormalizes_remaining_weights() {
        let mut ensemble = Ensemble::new(sample_mode_config(BaselinePolicy::AlwaysUpdate)).unwrap();
        ensemble.set_enabled(DetectorKind::Distributional, false);

        let mut last = None;
        for i in 0..100 {
            last = Some(ensemble.evaluate_sample(&key(), i * 1000, normal(i), false));
        }
        let score = last.unwrap();
        assert!(!score.detector_scores.contains_key(&DetectorKind::Distributional));
        assert!(!score.excluded.contains(&DetectorKind::Distributional));

        let s = score.detector_scores[&DetectorKind::Statistical];
        let t = score.detector_scores[&DetectorKind::Trend];
        assert!((score.combined - (0.5 * s + 0.25 * t) / 0.75).abs() < 1e-12);
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EnsembleConfig::default().validate().is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = EnsembleConfig::default();
        if let DetectorConfig::Statistical { weight, .. } = &mut config.detectors[0] {
            *weight = 0.7;
        }
        assert!(Ensemble::new(config).is_err());
    }

    #[test]
    fn test_duplicate_detectors_rejected() {
        let config = EnsembleConfig {
            detectors: vec![
                DetectorConfig::Trend {
                    weight: 0.5,
                    params: TrendDetector::default(),
                },
                DetectorConfig::Trend {
                    weight: 0.5,
                    params: TrendDetector::default(),
                },
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_detector_config_json() {
        let json = r#"[{"type":"statistical","weight":0.6,"k":3.0},{"type":"trend","weight":0.4}]"#;
        let detectors: Vec<DetectorConfig> = serde_json::from_str(json).unwrap();
        assert_eq!(
            detectors[0],
            DetectorConfig::Statistical {
                weight: 0.6,
                params: StatisticalDetector { k: 3.0, warmup: 10 },
            }
        );
        assert_eq!(detectors[1].weight(), 0.4);
    }
}

mod scenario_tests {
    use super::*;

    #[test]
    fn test_spike_after_steady_stream_is_flagged() {
        let mut ensemble = Ensemble::new(sample_mode_config(BaselinePolicy::FreezeWhileFiring)).unwrap();
        let k = key();

        let mut false_positives = 0;
        for i in 0..1000 {
            let score = ensemble.evaluate_sample(&k, i * 1000, normal(i), false);
            if score.is_anomaly {
                false_positives += 1;
            }
        }
        assert_eq!(false_positives, 0);

        let baseline = ensemble.model(&k).unwrap().baseline.clone();
        assert!((baseline.mean - 100.0).abs() < 2.0);
        assert!((baseline.stddev() - 5.0).abs() < 1.0);

        let mut alert_active = false;
        for i in 1000..1005 {
            let score = ensemble.evaluate_sample(&k, i * 1000, 400.0, alert_active);
            assert!(score.combined > 0.6, "sample {} combined {}", i, score.combined);
            assert!(score.is_anomaly);
            alert_active = true;
        }

        // Frozen while the alert is active after the first spike
        let after = &ensemble.model(&k).unwrap().baseline;
        assert_eq!(after.observations, baseline.observations + 1);
    }

    #[test]
    fn test_freeze_on_anomaly_keeps_baseline() {
        let mut ensemble = Ensemble::new(sample_mode_config(BaselinePolicy::FreezeOnAnomaly)).unwrap();
        let k = key();
        for i in 0..200 {
            ensemble.evaluate_sample(&k, i * 1000, normal(i), false);
        }
        let before = ensemble.model(&k).unwrap().baseline.clone();

        let score = ensemble.evaluate_sample(&k, 200_000, 1_000.0, false);
        assert!(score.is_anomaly);
        assert_eq!(ensemble.model(&k).unwrap().baseline, before);
    }

    #[test]
    fn test_always_update_absorbs_spike() {
        let mut ensemble = Ensemble::new(sample_mode_config(BaselinePolicy::AlwaysUpdate)).unwrap();
        let k = key();
        for i in 0..200 {
            ensemble.evaluate_sample(&k, i * 1000, normal(i), false);
        }
        let before = ensemble.model(&k).unwrap().baseline.mean;
        ensemble.evaluate_sample(&k, 200_000, 1_000.0, true);
        assert!(ensemble.model(&k).unwrap().baseline.mean > before + 10.0);
    }

    #[test]
    fn test_aggregate_mode_scores_window_means() {
        let mut ensemble = Ensemble::new(EnsembleConfig::default()).unwrap();
        let k = key();
        assert_eq!(ensemble.mode_for("latency"), DetectionMode::Aggregate);

        let window = |i: i64, mean: f64| {
            let interval = WindowInterval {
                start_ms: i * 30_000,
                end_ms: i * 30_000 + 300_000,
            };
            AggregateResult {
                window_id: AggregateResult::window_id_for(&k, WindowKind::Sliding, &interval),
                key: k.clone(),
                kind: WindowKind::Sliding,
                interval,
                count: 300,
                mean,
                min: mean - 10.0,
                max: mean + 10.0,
                stddev: 5.0,
                percentiles: Some(Percentiles {
                    p50: mean,
                    p75: mean + 3.0,
                    p95: mean + 8.0,
                    p99: mean + 11.0,
                }),
                trend_slope: 0.0,
                degraded: false,
            }
        };

        for i in 0..100 {
            let score = ensemble.evaluate_aggregate(&window(i, normal(i)), false);
            assert!(!score.is_anomaly);
        }
        let spike = window(100, 400.0);
        let score = ensemble.evaluate_aggregate(&spike, false);
        assert!(score.is_anomaly, "combined {}", score.combined);
        assert!(matches!(score.source, crate::models::ScoreSource::Aggregate { ref window_id } if *window_id == spike.window_id));
    }
}
