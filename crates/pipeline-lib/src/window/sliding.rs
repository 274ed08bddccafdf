//! Sliding window assignment

use super::Accumulator;
use crate::models::{AggregateResult, PartitionKey, WindowInterval, WindowKind};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct OpenWindow {
    acc: Accumulator,
    /// Lowest stream offset folded into this window
    first_offset: u64,
}

/// Open sliding windows for one key, indexed by start
#[derive(Debug, Clone)]
pub(crate) struct SlidingWindows {
    size_ms: i64,
    slide_ms: i64,
    compression: f64,
    open: BTreeMap<i64, OpenWindow>,
}

impl SlidingWindows {
    pub(crate) fn new(size_ms: i64, slide_ms: i64, compression: f64) -> Self {
        Self {
            size_ms,
            slide_ms,
            compression,
            open: BTreeMap::new(),
        }
    }

    /// Starts of every window containing `timestamp_ms`, newest first
    pub(crate) fn starts_for(&self, timestamp_ms: i64) -> impl Iterator<Item = i64> + '_ {
        let newest = timestamp_ms.div_euclid(self.slide_ms) * self.slide_ms;
        (0..)
            .map(move |i| newest - i * self.slide_ms)
            .take_while(move |start| start + self.size_ms > timestamp_ms)
    }

    /// Add a sample to every open window it belongs to whose end lies past `horizon_ms`
    pub(crate) fn add(&mut self, offset: u64, timestamp_ms: i64, value: f64, horizon_ms: i64) {
        let starts: Vec<i64> = self
            .starts_for(timestamp_ms)
            .filter(|start| start + self.size_ms > horizon_ms)
            .collect();
        for start in starts {
            let window = self.open.entry(start).or_insert_with(|| OpenWindow {
                acc: Accumulator::new(self.compression),
                first_offset: offset,
            });
            window.first_offset = window.first_offset.min(offset);
            window.acc.add(timestamp_ms, value);
        }
    }

    /// Close windows ending at or before the watermark, oldest first
    pub(crate) fn close_until(
        &mut self,
        key: &PartitionKey,
        watermark_ms: i64,
        degraded: bool,
        out: &mut Vec<(AggregateResult, Option<String>)>,
    ) {
        while let Some((&start, _)) = self.open.first_key_value() {
            if start + self.size_ms > watermark_ms {
                break;
            }
            if let Some(window) = self.open.remove(&start) {
                out.push(self.finish(key, start, window.acc, degraded));
            }
        }
    }

    /// Close every open window regardless of the watermark
    pub(crate) fn close_all(&mut self, key: &PartitionKey, out: &mut Vec<(AggregateResult, Option<String>)>) {
        let open = std::mem::take(&mut self.open);
        for (start, window) in open {
            out.push(self.finish(key, start, window.acc, true));
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Lowest offset held by any open window
    pub(crate) fn first_offset(&self) -> Option<u64> {
        self.open.values().map(|w| w.first_offset).min()
    }

    fn finish(
        &self,
        key: &PartitionKey,
        start: i64,
        acc: Accumulator,
        degraded: bool,
    ) -> (AggregateResult, Option<String>) {
        let interval = WindowInterval {
            start_ms: start,
            end_ms: start + self.size_ms,
        };
        let (result, error) = acc.finish(key, WindowKind::Sliding, interval, degraded);
        (result, error.map(|e| e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_joins_size_over_slide_windows() {
        let windows = SlidingWindows::new(300_000, 30_000, 100.0);
        let starts: Vec<_> = windows.starts_for(1_000_000).collect();
        assert_eq!(starts.len(), 10);
        assert_eq!(starts[0], 990_000);
        assert!(starts.iter().all(|s| s % 30_000 == 0));
        assert!(starts.iter().all(|s| *s <= 1_000_000 && s + 300_000 > 1_000_000));
    }

    #[test]
    fn test_boundary_sample_starts_new_window() {
        let windows = SlidingWindows::new(10_000, 5_000, 100.0);
        let starts: Vec<_> = windows.starts_for(10_000).collect();
        assert_eq!(starts, vec![10_000, 5_000]);
    }

    #[test]
    fn test_negative_timestamps_align() {
        let windows = SlidingWindows::new(10, 5, 100.0);
        let starts: Vec<_> = windows.starts_for(-3).collect();
        assert_eq!(starts, vec![-5, -10]);
    }

    #[test]
    fn test_close_respects_watermark_and_horizon() {
        let key = PartitionKey::new("m", Default::default());
        let mut windows = SlidingWindows::new(10, 5, 100.0);
        windows.add(1, 7, 1.0, i64::MIN);
        windows.add(2, 12, 2.0, 10);
        assert_eq!(windows.open_count(), 3);
        assert_eq!(windows.first_offset(), Some(1));

        let mut out = Vec::new();
        windows.close_until(&key, 10, false, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.interval.start_ms, 0);
        assert_eq!(out[0].0.count, 1);
        assert_eq!(windows.first_offset(), Some(1));

        windows.close_until(&key, 15, false, &mut out);
        assert_eq!(windows.first_offset(), Some(2));
    }
}
