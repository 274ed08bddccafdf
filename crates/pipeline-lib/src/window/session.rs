//! Session window tracking

use super::Accumulator;
use crate::models::{AggregateResult, PartitionKey, WindowInterval, WindowKind};

#[derive(Debug, Clone)]
struct OpenSession {
    first_ms: i64,
    last_ms: i64,
    first_offset: u64,
    acc: Accumulator,
}

/// At most one open session per key; samples are fed in timestamp order
#[derive(Debug, Clone)]
pub(crate) struct SessionWindow {
    gap_ms: i64,
    compression: f64,
    current: Option<OpenSession>,
}

impl SessionWindow {
    pub(crate) fn new(gap_ms: i64, compression: f64) -> Self {
        Self {
            gap_ms,
            compression,
            current: None,
        }
    }

    /// Add an in-order sample, closing the previous session if the gap was exceeded
    pub(crate) fn add(
        &mut self,
        key: &PartitionKey,
        offset: u64,
        timestamp_ms: i64,
        value: f64,
        out: &mut Vec<(AggregateResult, Option<String>)>,
    ) {
        if let Some(session) = &self.current {
            if timestamp_ms >= session.last_ms + self.gap_ms {
                self.close(key, false, out);
            }
        }

        let compression = self.compression;
        let session = self.current.get_or_insert_with(|| OpenSession {
            first_ms: timestamp_ms,
            last_ms: timestamp_ms,
            first_offset: offset,
            acc: Accumulator::new(compression),
        });
        session.last_ms = session.last_ms.max(timestamp_ms);
        session.first_offset = session.first_offset.min(offset);
        session.acc.add(timestamp_ms, value);
    }

    /// Close the open session once `last + gap` is at or below the watermark
    pub(crate) fn close_until(
        &mut self,
        key: &PartitionKey,
        watermark_ms: i64,
        out: &mut Vec<(AggregateResult, Option<String>)>,
    ) {
        let expired = self
            .current
            .as_ref()
            .map(|s| s.last_ms + self.gap_ms <= watermark_ms)
            .unwrap_or(false);
        if expired {
            self.close(key, false, out);
        }
    }

    pub(crate) fn close(
        &mut self,
        key: &PartitionKey,
        degraded: bool,
        out: &mut Vec<(AggregateResult, Option<String>)>,
    ) {
        if let Some(session) = self.current.take() {
            let interval = WindowInterval {
                start_ms: session.first_ms,
                end_ms: session.last_ms + self.gap_ms,
            };
            let (result, error) = session.acc.finish(key, WindowKind::Session, interval, degraded);
            out.push((result, error.map(|e| e.to_string())));
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn first_offset(&self) -> Option<u64> {
        self.current.as_ref().map(|s| s.first_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_splits_sessions() {
        let key = PartitionKey::new("clicks", Default::default());
        let mut session = SessionWindow::new(1_000, 100.0);
        let mut out = Vec::new();

        session.add(&key, 1, 0, 1.0, &mut out);
        session.add(&key, 2, 900, 1.0, &mut out);
        session.add(&key, 3, 1_800, 1.0, &mut out);
        assert!(out.is_empty());
        assert_eq!(session.first_offset(), Some(1));

        session.add(&key, 4, 2_800, 1.0, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.interval.start_ms, 0);
        assert_eq!(out[0].0.interval.end_ms, 2_800);
        assert_eq!(out[0].0.count, 3);
        assert!(session.is_open());
        assert_eq!(session.first_offset(), Some(4));
    }

    #[test]
    fn test_watermark_closes_idle_session() {
        let key = PartitionKey::new("clicks", Default::default());
        let mut session = SessionWindow::new(1_000, 100.0);
        let mut out = Vec::new();

        session.add(&key, 1, 100, 5.0, &mut out);
        session.close_until(&key, 1_099, &mut out);
        assert!(out.is_empty());
        session.close_until(&key, 1_100, &mut out);
        assert_eq!(out.len(), 1);
        assert!(!session.is_open());
    }
}
