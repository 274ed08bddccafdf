//! Per-key watermarking, reordering and window lifecycle

use super::session::SessionWindow;
use super::sliding::SlidingWindows;
use super::{WindowConfig, WindowSpec};
use crate::error::LatenessError;
use crate::models::{AggregateResult, PartitionKey};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use tracing::debug;

/// A sample handed to the windows, in per-key timestamp order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReleasedSample {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// A window that just closed
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedWindow {
    pub result: AggregateResult,
    /// Why the percentile summary failed, when it did
    pub digest_error: Option<String>,
}

/// Everything one call moved forward for a key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Advance {
    pub released: Vec<(PartitionKey, ReleasedSample)>,
    pub closed: Vec<ClosedWindow>,
}

impl Advance {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.closed.is_empty()
    }

    fn extend(&mut self, other: Advance) {
        self.released.extend(other.released);
        self.closed.extend(other.closed);
    }
}

#[derive(Debug, Clone)]
struct Pending {
    timestamp_ms: i64,
    seq: u64,
    offset: u64,
    value: f64,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp_ms, self.seq).cmp(&(other.timestamp_ms, other.seq))
    }
}

#[derive(Debug, Clone)]
enum Assigner {
    Sliding(SlidingWindows),
    Session(SessionWindow),
}

#[derive(Debug, Clone)]
struct KeyState {
    key: PartitionKey,
    assigner: Assigner,
    reorder: BinaryHeap<Reverse<Pending>>,
    max_seen_ms: Option<i64>,
    watermark_ms: i64,
    /// Largest end of any window already emitted for this key
    closed_through_ms: i64,
    last_arrival_wall_ms: i64,
}

impl KeyState {
    fn new(key: PartitionKey, spec: WindowSpec, compression: f64, closed_through_ms: i64) -> Self {
        let assigner = match spec {
            WindowSpec::Sliding { size_ms, slide_ms } => {
                Assigner::Sliding(SlidingWindows::new(size_ms, slide_ms, compression))
            }
            WindowSpec::Session { gap_ms } => Assigner::Session(SessionWindow::new(gap_ms, compression)),
        };

        Self {
            key,
            assigner,
            reorder: BinaryHeap::new(),
            max_seen_ms: None,
            watermark_ms: i64::MIN,
            closed_through_ms,
            last_arrival_wall_ms: i64::MIN,
        }
    }

    /// Release buffered samples at or below `limit_ms`, then close due windows
    fn advance(&mut self, limit_ms: i64, drain_all: bool) -> Advance {
        let mut out = Advance::default();
        let mut closed = Vec::new();

        while let Some(Reverse(next)) = self.reorder.peek() {
            if !drain_all && next.timestamp_ms > limit_ms {
                break;
            }
            let Some(Reverse(pending)) = self.reorder.pop() else {
                break;
            };

            match &mut self.assigner {
                Assigner::Sliding(windows) => {
                    windows.add(pending.offset, pending.timestamp_ms, pending.value, self.closed_through_ms);
                }
                Assigner::Session(session) => {
                    // Replayed input already covered by an emitted session
                    if pending.timestamp_ms < self.closed_through_ms {
                        continue;
                    }
                    session.add(&self.key, pending.offset, pending.timestamp_ms, pending.value, &mut closed);
                }
            }
            out.released.push((
                self.key.clone(),
                ReleasedSample {
                    timestamp_ms: pending.timestamp_ms,
                    value: pending.value,
                },
            ));
        }

        match (&mut self.assigner, drain_all) {
            (Assigner::Sliding(windows), true) => windows.close_all(&self.key, &mut closed),
            (Assigner::Sliding(windows), false) => {
                windows.close_until(&self.key, limit_ms, false, &mut closed)
            }
            (Assigner::Session(session), true) => session.close(&self.key, true, &mut closed),
            (Assigner::Session(session), false) => {
                session.close_until(&self.key, limit_ms, &mut closed)
            }
        }

        for (result, digest_error) in closed {
            self.closed_through_ms = self.closed_through_ms.max(result.interval.end_ms);
            out.closed.push(ClosedWindow {
                result,
                digest_error,
            });
        }

        out
    }

    fn open_windows(&self) -> usize {
        match &self.assigner {
            Assigner::Sliding(windows) => windows.open_count(),
            Assigner::Session(session) => usize::from(session.is_open()),
        }
    }

    /// Lowest offset still buffered or folded into an open window
    fn first_held_offset(&self) -> Option<u64> {
        let buffered = self.reorder.iter().map(|Reverse(p)| p.offset).min();
        let windowed = match &self.assigner {
            Assigner::Sliding(windows) => windows.first_offset(),
            Assigner::Session(session) => session.first_offset(),
        };
        buffered.into_iter().chain(windowed).min()
    }
}

/// Window engine for one partition.
///
/// Each key keeps its own watermark (`max observed timestamp − allowed
/// lateness`) and a reorder buffer; samples reach the windows only once they
/// are at or below the watermark, so every key sees a non-decreasing
/// timestamp sequence. Samples arriving below the watermark are rejected as
/// late.
///
/// The engine also tracks the stream offsets of everything it still holds, so a
/// checkpoint can name the first offset a restart has to replay.
pub struct WindowEngine {
    config: WindowConfig,
    keys: HashMap<PartitionKey, KeyState>,
    restored_horizons: BTreeMap<String, i64>,
    seq: u64,
    late_samples: u64,
}

impl WindowEngine {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            keys: HashMap::new(),
            restored_horizons: BTreeMap::new(),
            seq: 0,
            late_samples: 0,
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Accept the sample at stream `offset` for `key`, observed at wall-clock `now_ms`
    pub fn observe(
        &mut self,
        key: &PartitionKey,
        offset: u64,
        timestamp_ms: i64,
        value: f64,
        now_ms: i64,
    ) -> Result<Advance, LatenessError> {
        let lateness = self.config.allowed_lateness_ms;
        let state = self.state_for(key);

        if timestamp_ms < state.watermark_ms {
            let watermark_ms = state.watermark_ms;
            self.late_samples += 1;
            debug!(key = %key, timestamp_ms, watermark_ms, "Dropping late sample");
            return Err(LatenessError {
                key: key.canonical().to_string(),
                timestamp_ms,
                watermark_ms,
            });
        }

        self.seq += 1;
        let seq = self.seq;
        let state = self.state_for(key);
        state.reorder.push(Reverse(Pending {
            timestamp_ms,
            seq,
            offset,
            value,
        }));
        state.last_arrival_wall_ms = now_ms;
        let max_seen = state.max_seen_ms.map_or(timestamp_ms, |m| m.max(timestamp_ms));
        state.max_seen_ms = Some(max_seen);
        state.watermark_ms = state.watermark_ms.max(max_seen.saturating_sub(lateness));

        let watermark = state.watermark_ms;
        Ok(state.advance(watermark, false))
    }

    /// Advance watermarks of keys idle for `idle_timeout` from wall clock.
    ///
    /// The wall-clock watermark trails `now` by the larger of the allowed
    /// lateness and `max_event_delay`, so a quiet key never starts rejecting
    /// samples that are still inside the accepted past skew.
    pub fn flush_idle(&mut self, now_ms: i64) -> Advance {
        let idle = self.config.idle_timeout_ms;
        let trail = self
            .config
            .allowed_lateness_ms
            .max(self.config.max_event_delay_ms);
        let wall_watermark = now_ms.saturating_sub(trail);
        let mut out = Advance::default();

        for state in self.keys.values_mut() {
            if now_ms.saturating_sub(state.last_arrival_wall_ms) < idle {
                continue;
            }
            if wall_watermark > state.watermark_ms {
                state.watermark_ms = wall_watermark;
            }
            let watermark = state.watermark_ms;
            out.extend(state.advance(watermark, false));
        }

        out
    }

    /// Release everything and close every open window as degraded
    pub fn flush_all(&mut self) -> Advance {
        let mut out = Advance::default();
        for state in self.keys.values_mut() {
            out.extend(state.advance(i64::MAX, true));
        }
        out
    }

    /// Largest closed window end per key, by canonical key text
    pub fn horizons(&self) -> BTreeMap<String, i64> {
        let mut horizons = self.restored_horizons.clone();
        for state in self.keys.values() {
            if state.closed_through_ms > i64::MIN {
                horizons.insert(state.key.canonical().to_string(), state.closed_through_ms);
            }
        }
        horizons
    }

    /// Restore horizons from a checkpoint so emitted windows are never reopened.
    /// Horizons already known are only moved forward.
    pub fn restore_horizons(&mut self, horizons: BTreeMap<String, i64>) {
        for state in self.keys.values_mut() {
            if let Some(h) = horizons.get(state.key.canonical()) {
                state.closed_through_ms = state.closed_through_ms.max(*h);
            }
        }
        for (key, horizon) in horizons {
            let known = self.restored_horizons.entry(key).or_insert(horizon);
            *known = (*known).max(horizon);
        }
    }

    /// Highest key watermark in the partition
    pub fn watermark(&self) -> Option<i64> {
        self.keys
            .values()
            .map(|s| s.watermark_ms)
            .filter(|w| *w > i64::MIN)
            .max()
    }

    pub fn key_watermark(&self, key: &PartitionKey) -> Option<i64> {
        self.keys
            .get(key)
            .map(|s| s.watermark_ms)
            .filter(|w| *w > i64::MIN)
    }

    /// First offset a replay must start from to rebuild every open window
    /// and reorder buffer; `None` when nothing is held
    pub fn first_held_offset(&self) -> Option<u64> {
        self.keys.values().filter_map(KeyState::first_held_offset).min()
    }

    pub fn late_samples(&self) -> u64 {
        self.late_samples
    }

    pub fn open_windows(&self) -> usize {
        self.keys.values().map(KeyState::open_windows).sum()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    fn state_for(&mut self, key: &PartitionKey) -> &mut KeyState {
        let config = &self.config;
        let restored = &self.restored_horizons;
        self.keys.entry(key.clone()).or_insert_with(|| {
            let horizon = restored.get(key.canonical()).copied().unwrap_or(i64::MIN);
            KeyState::new(
                key.clone(),
                config.spec_for(key.metric()),
                config.digest_compression,
                horizon,
            )
        })
    }
}
