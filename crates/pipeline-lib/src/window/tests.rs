//! Tests for the window engine

use super::*;
use crate::models::{AggregateResult, PartitionKey, WindowKind};

fn sliding_config(size_ms: i64, slide_ms: i64, lateness_ms: i64) -> WindowConfig {
    WindowConfig {
        default_spec: WindowSpec::Sliding { size_ms, slide_ms },
        allowed_lateness_ms: lateness_ms,
        ..Default::default()
    }
}

fn key(metric: &str) -> PartitionKey {
    PartitionKey::new(metric, Default::default())
}

fn feed(engine: &mut WindowEngine, key: &PartitionKey, samples: &[(i64, f64)]) -> Advance {
    let mut out = Advance::default();
    for (i, (ts, v)) in samples.iter().enumerate() {
        if let Ok(adv) = engine.observe(key, i as u64 + 1, *ts, *v, 0) {
            out.released.extend(adv.released);
            out.closed.extend(adv.closed);
        }
    }
    out
}

fn results(advance: &Advance) -> Vec<AggregateResult> {
    advance.closed.iter().map(|c| c.result.clone()).collect()
}

mod ordering_tests {
    use super::*;

    #[test]
    fn test_out_of_order_samples_are_released_in_order() {
        let mut engine = WindowEngine::new(sliding_config(10_000, 5_000, 5_000));
        let k = key("latency");
        let out = feed(
            &mut engine,
            &k,
            &[(1000, 1.0), (3000, 3.0), (2000, 2.0), (8000, 8.0), (7000, 7.0), (20_000, 20.0)],
        );

        let released: Vec<i64> = out.released.iter().map(|(_, s)| s.timestamp_ms).collect();
        assert_eq!(released, vec![1000, 2000, 3000, 7000, 8000]);
    }

    #[test]
    fn test_released_order_is_non_decreasing_for_every_key() {
        let mut engine = WindowEngine::new(sliding_config(10_000, 5_000, 3_000));
        let keys = [key("a"), key("b")];
        let mut last = [i64::MIN; 2];

        for i in 0..500i64 {
            let k = (i % 2) as usize;
            // Jitter of up to 2.5s backwards, inside the lateness bound
            let ts = i * 1000 - ((i * 7919) % 2500);
            if let Ok(adv) = engine.observe(&keys[k], i as u64 + 1, ts, i as f64, 0) {
                for (released_key, sample) in adv.released {
                    let idx = if released_key == keys[0] { 0 } else { 1 };
                    assert!(sample.timestamp_ms >= last[idx]);
                    last[idx] = sample.timestamp_ms;
                }
            }
        }
        assert_eq!(engine.late_samples(), 0);
    }

    #[test]
    fn test_sample_behind_watermark_is_late() {
        let mut engine = WindowEngine::new(sliding_config(10_000, 5_000, 5_000));
        let k = key("latency");
        feed(&mut engine, &k, &[(20_000, 1.0)]);

        let err = engine.observe(&k, 2, 10_000, 1.0, 0).unwrap_err();
        assert_eq!(err.watermark_ms, 15_000);
        assert_eq!(engine.late_samples(), 1);

        // At the watermark is still on time
        assert!(engine.observe(&k, 3, 15_000, 1.0, 0).is_ok());
    }

    #[test]
    fn test_keys_have_independent_watermarks() {
        let mut engine = WindowEngine::new(sliding_config(10_000, 5_000, 0));
        feed(&mut engine, &key("fast"), &[(100_000, 1.0)]);
        assert!(engine.observe(&key("slow"), 2, 1_000, 1.0, 0).is_ok());
        assert_eq!(engine.watermark(), Some(100_000));
        assert_eq!(engine.key_watermark(&key("slow")), Some(1_000));
    }
}

mod closing_tests {
    use super::*;

    #[test]
    fn test_windows_close_at_watermark() {
        let mut engine = WindowEngine::new(sliding_config(10_000, 5_000, 5_000));
        let k = key("latency");
        let out = feed(
            &mut engine,
            &k,
            &[(1000, 1.0), (3000, 3.0), (2000, 2.0), (8000, 8.0), (7000, 7.0), (20_000, 20.0)],
        );

        let closed = results(&out);
        assert_eq!(closed.len(), 3);
        assert_eq!((closed[0].interval.start_ms, closed[0].count), (-5000, 3));
        assert!((closed[0].mean - 2.0).abs() < 1e-12);
        assert_eq!((closed[1].interval.start_ms, closed[1].count), (0, 5));
        assert!((closed[1].mean - 4.2).abs() < 1e-12);
        assert_eq!((closed[2].interval.start_ms, closed[2].count), (5000, 2));
        assert!(closed.iter().all(|r| !r.degraded && r.kind == WindowKind::Sliding));
        assert_eq!(engine.horizons()[k.canonical()], 15_000);
    }

    #[test]
    fn test_session_windows_by_override() {
        let mut config = sliding_config(10_000, 5_000, 0);
        config
            .overrides
            .insert("clicks".to_string(), WindowSpec::Session { gap_ms: 1_000 });
        let mut engine = WindowEngine::new(config);

        let out = feed(&mut engine, &key("clicks"), &[(0, 1.0), (500, 2.0), (3000, 5.0)]);
        let closed = results(&out);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].kind, WindowKind::Session);
        assert_eq!(closed[0].interval.start_ms, 0);
        assert_eq!(closed[0].interval.end_ms, 1_500);
        assert_eq!(closed[0].count, 2);
        assert_eq!(engine.open_windows(), 1);
    }

    #[test]
    fn test_idle_keys_close_from_wall_clock() {
        let mut config = sliding_config(10_000, 5_000, 5_000);
        config.idle_timeout_ms = 60_000;
        config.max_event_delay_ms = 0;
        let mut engine = WindowEngine::new(config);
        let k = key("quiet");

        engine.observe(&k, 1, 1_000, 4.0, 1_000).unwrap();
        assert!(engine.flush_idle(30_000).is_empty());

        let out = engine.flush_idle(61_000);
        assert_eq!(out.released.len(), 1);
        assert_eq!(out.closed.len(), 2);
        assert_eq!(engine.open_windows(), 0);
    }

    #[test]
    fn test_idle_flush_keeps_delayed_producer_on_time() {
        let mut config = sliding_config(10_000, 10_000, 5_000);
        config.idle_timeout_ms = 60_000;
        let mut engine = WindowEngine::new(config);
        let k = key("delayed");

        // Every sample arrives two minutes after its event time, in order
        engine.observe(&k, 1, 0, 1.0, 120_000).unwrap();
        assert!(engine.flush_idle(180_000).is_empty());
        assert!(engine.observe(&k, 2, 90_000, 2.0, 210_000).is_ok());
        assert_eq!(engine.late_samples(), 0);

        // Past the delay bound the quiet key still closes its windows
        let out = engine.flush_idle(3_700_000);
        let closed = results(&out);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].interval.start_ms, 90_000);
        assert!(!closed[0].degraded);
        assert_eq!(engine.open_windows(), 0);
    }

    #[test]
    fn test_flush_all_closes_everything_degraded() {
        let mut engine = WindowEngine::new(sliding_config(10_000, 5_000, 5_000));
        let k = key("latency");
        feed(&mut engine, &k, &[(1000, 1.0), (20_000, 20.0)]);

        let out = engine.flush_all();
        assert_eq!(out.released.len(), 1);
        let closed = results(&out);
        assert_eq!(closed.len(), 2);
        assert!(closed.iter().all(|r| r.degraded));
        assert_eq!(engine.open_windows(), 0);
    }

    #[test]
    fn test_digest_failure_closes_degraded_without_blocking() {
        let mut engine = WindowEngine::new(WindowConfig {
            digest_compression: 10.0,
            ..sliding_config(1_000, 1_000, 0)
        });
        let k = key("pathological");
        let mut samples: Vec<(i64, f64)> = (0..50)
            .map(|i| (i, if i % 2 == 0 { f64::MAX } else { -f64::MAX }))
            .collect();
        samples.push((5_000, 1.0));

        let out = feed(&mut engine, &k, &samples);
        assert_eq!(out.closed.len(), 1);
        assert!(out.closed[0].result.degraded);
        assert!(out.closed[0].result.percentiles.is_none());
        assert!(out.closed[0].digest_error.is_some());
    }
}

mod offset_tests {
    use super::*;

    #[test]
    fn test_first_held_offset_follows_open_windows_and_reorder_buffer() {
        let mut engine = WindowEngine::new(sliding_config(10_000, 10_000, 5_000));
        let k = key("latency");
        assert_eq!(engine.first_held_offset(), None);

        engine.observe(&k, 1, 1_000, 1.0, 0).unwrap();
        engine.observe(&k, 2, 12_000, 2.0, 0).unwrap();
        // Offset 1 sits in the open window [0, 10000), offset 2 in the reorder buffer
        assert_eq!(engine.first_held_offset(), Some(1));

        let advance = engine.observe(&k, 3, 16_000, 3.0, 0).unwrap();
        assert_eq!(advance.closed.len(), 1);
        assert_eq!(engine.first_held_offset(), Some(2));

        engine.flush_all();
        assert_eq!(engine.first_held_offset(), None);
    }

    #[test]
    fn test_late_samples_hold_no_offset() {
        let mut engine = WindowEngine::new(sliding_config(10_000, 10_000, 0));
        let k = key("latency");
        engine.observe(&k, 7, 50_000, 1.0, 0).unwrap();
        assert!(engine.observe(&k, 8, 10_000, 1.0, 0).is_err());
        assert_eq!(engine.first_held_offset(), Some(7));
    }
}

mod idempotence_tests {
    use super::*;

    fn stream() -> Vec<(i64, f64)> {
        (0..=30).map(|i| (i * 1000, ((i * 37) % 11) as f64)).collect()
    }

    #[test]
    fn test_recomputation_is_identical() {
        let k = key("latency");
        let mut a = WindowEngine::new(sliding_config(10_000, 5_000, 0));
        let mut b = WindowEngine::new(sliding_config(10_000, 5_000, 0));

        let ra = results(&feed(&mut a, &k, &stream()));
        let rb = results(&feed(&mut b, &k, &stream()));
        assert_eq!(ra.len(), rb.len());
        for (x, y) in ra.iter().zip(rb.iter()) {
            assert!(x.approx_eq(y, 1e-9));
        }
    }

    #[test]
    fn test_restored_horizons_suppress_reemission() {
        let k = key("latency");
        let samples = stream();

        let mut original = WindowEngine::new(sliding_config(10_000, 5_000, 0));
        let first = results(&feed(&mut original, &k, &samples[..=15]));
        let horizons = original.horizons();
        let rest = results(&feed(&mut original, &k, &samples[16..]));
        assert_eq!(horizons[k.canonical()], 15_000);
        assert_eq!(first.len() + rest.len(), 6);

        let mut restarted = WindowEngine::new(sliding_config(10_000, 5_000, 0));
        restarted.restore_horizons(horizons);
        let replayed = results(&feed(&mut restarted, &k, &samples));

        assert!(replayed.iter().all(|r| r.interval.end_ms > 15_000));
        assert_eq!(replayed.len(), rest.len());
        for (x, y) in replayed.iter().zip(rest.iter()) {
            assert!(x.approx_eq(y, 1e-9));
        }
    }
}

mod config_tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(WindowSpec::default().validate().is_ok());
        assert!(WindowSpec::Sliding { size_ms: 0, slide_ms: 1 }.validate().is_err());
        assert!(WindowSpec::Sliding { size_ms: 10, slide_ms: 20 }.validate().is_err());
        assert!(WindowSpec::Session { gap_ms: 0 }.validate().is_err());
    }

    #[test]
    fn test_spec_json_shape() {
        let spec: WindowSpec = serde_json::from_str(r#"{"kind":"session","gap_ms":30000}"#).unwrap();
        assert_eq!(spec, WindowSpec::Session { gap_ms: 30_000 });
    }
}
