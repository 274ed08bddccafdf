//! Tests for the collector

use super::*;

const NOW: i64 = 1_700_000_000_000;

fn collector(capacity: usize) -> Collector {
    Collector::new(CollectorConfig {
        buffer_capacity: capacity,
        max_skew_past: Duration::from_secs(60),
        max_skew_future: Duration::from_secs(10),
        flush_interval: Duration::from_secs(1),
        ..Default::default()
    })
}

mod validation_tests {
    use super::*;

    #[test]
    fn test_accepts_sample_within_bounds() {
        let mut c = collector(10);
        let accepted = c.ingest(MetricSample::new("cpu", NOW - 1000, 0.5), NOW).unwrap();
        assert_eq!(accepted.buffered, 1);
        assert!(!accepted.flush_due);
    }

    #[test]
    fn test_rejects_missing_name() {
        let mut c = collector(10);
        let err = c.ingest(MetricSample::new("  ", NOW, 1.0), NOW).unwrap_err();
        assert_eq!(err, IngestionError::MissingName);
    }

    #[test]
    fn test_rejects_non_finite_values() {
        let mut c = collector(10);
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                c.ingest(MetricSample::new("cpu", NOW, value), NOW),
                Err(IngestionError::NonFiniteValue(_))
            ));
        }
        assert_eq!(c.health().dropped, 3);
        assert_eq!(c.health().dropped_by_reason["non_finite"], 3);
    }

    #[test]
    fn test_rejects_timestamps_outside_skew() {
        let mut c = collector(10);
        assert!(matches!(
            c.ingest(MetricSample::new("cpu", NOW - 61_000, 1.0), NOW),
            Err(IngestionError::TooOld { .. })
        ));
        assert!(matches!(
            c.ingest(MetricSample::new("cpu", NOW + 11_000, 1.0), NOW),
            Err(IngestionError::TooFarInFuture { .. })
        ));
        // Bounds are inclusive
        assert!(c.ingest(MetricSample::new("cpu", NOW - 60_000, 1.0), NOW).is_ok());
        assert!(c.ingest(MetricSample::new("cpu", NOW + 10_000, 1.0), NOW).is_ok());
    }

    #[test]
    fn test_every_buffered_sample_is_finite_and_in_bounds() {
        let mut c = collector(1000);
        let values = [1.0, f64::NAN, 2.0, f64::INFINITY, 3.0];
        let offsets = [0, -120_000, 5_000, 0, 60_000];

        for (v, off) in values.iter().zip(offsets.iter()) {
            let _ = c.ingest(MetricSample::new("m", NOW + off, *v), NOW);
        }

        let batch = c.drain(NOW);
        assert_eq!(batch.len(), 2);
        for s in batch {
            assert!(s.value.is_finite());
            assert!(s.timestamp_ms >= NOW - 60_000 && s.timestamp_ms <= NOW + 10_000);
        }
    }
}

mod buffering_tests {
    use super::*;

    #[test]
    fn test_flush_due_when_full() {
        let mut c = collector(3);
        c.ingest(MetricSample::new("a", NOW, 1.0), NOW).unwrap();
        c.ingest(MetricSample::new("a", NOW, 2.0), NOW).unwrap();
        let third = c.ingest(MetricSample::new("a", NOW, 3.0), NOW).unwrap();
        assert!(third.flush_due);

        let batch = c.drain(NOW);
        assert_eq!(batch.iter().map(|s| s.value).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);
        assert_eq!(c.health().buffered, 0);
    }

    #[test]
    fn test_flush_due_after_interval() {
        let mut c = collector(100);
        c.ingest(MetricSample::new("a", NOW, 1.0), NOW).unwrap();
        assert!(!c.should_flush(NOW + 500));
        assert!(c.should_flush(NOW + 1000));
    }

    #[test]
    fn test_ingest_batch_reports_and_flushes() {
        let mut c = collector(2);
        let samples = vec![
            MetricSample::new("a", NOW, 1.0),
            MetricSample::new("", NOW, 1.0),
            MetricSample::new("a", NOW, 2.0),
            MetricSample::new("a", NOW, 3.0),
        ];

        let mut flushed = Vec::new();
        let report = c.ingest_batch(samples, NOW, |batch| flushed.push(batch));

        assert_eq!(report.accepted, 3);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.errors[0].index, 1);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].len(), 2);
        assert_eq!(c.health().buffered, 1);
    }
}

mod health_tests {
    use super::*;

    #[test]
    fn test_health_reports_drop_rate() {
        let mut c = collector(10);
        c.ingest(MetricSample::new("a", NOW, 1.0), NOW).unwrap();
        let _ = c.ingest(MetricSample::new("a", NOW, f64::NAN), NOW);

        let health = c.health();
        assert_eq!(health.accepted, 1);
        assert_eq!(health.dropped, 1);
        assert!((health.drop_rate - 0.5).abs() < 1e-9);
        assert!(health.degraded);
    }

    #[test]
    fn test_fresh_collector_is_healthy() {
        let health = collector(10).health();
        assert_eq!(health.drop_rate, 0.0);
        assert!(!health.degraded);
    }
}
