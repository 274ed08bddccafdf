//! Bounded queue between pipeline stages with an explicit overflow policy

use super::spill::SpillQueue;
use crate::observability::PipelineMetrics;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What a full queue does with the next item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for space, failing the push after `timeout_ms`
    Block { timeout_ms: u64 },
    /// Evict the oldest queued item
    DropOldest,
    /// Overflow to a disk queue under `dir`
    BufferWithSpill { dir: PathBuf },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Block { timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageQueueConfig {
    pub capacity: usize,
    #[serde(flatten)]
    pub policy: BackpressurePolicy,
}

impl Default for StageQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            policy: BackpressurePolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackpressureError {
    #[error("stage {stage} stayed full for {timeout:?}")]
    Timeout { stage: String, timeout: Duration },

    #[error("stage {stage} is closed")]
    Closed { stage: String },

    #[error("spill for stage {stage} failed: {source}")]
    Spill {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackpressureError {
    /// Metric label for samples lost to this error
    pub fn reason(&self) -> &'static str {
        match self {
            BackpressureError::Timeout { .. } => "backpressure_timeout",
            BackpressureError::Closed { .. } => "queue_closed",
            BackpressureError::Spill { .. } => "spill_failed",
        }
    }
}

/// How a push was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldest,
    Spilled,
}

struct QueueState<T> {
    items: VecDeque<T>,
    spill: Option<SpillQueue<T>>,
    closed: bool,
    dropped: u64,
}

struct Shared<T> {
    name: String,
    capacity: usize,
    policy: BackpressurePolicy,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
    metrics: PipelineMetrics,
}

/// Multi-producer queue feeding one consumer stage
pub struct StageQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for StageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Serialize + DeserializeOwned + Send> StageQueue<T> {
    pub fn new(name: impl Into<String>, config: StageQueueConfig) -> Result<Self, BackpressureError> {
        let name = name.into();
        let spill = match &config.policy {
            BackpressurePolicy::BufferWithSpill { dir } => {
                Some(SpillQueue::open(dir, &name).map_err(|source| BackpressureError::Spill {
                    stage: name.clone(),
                    source,
                })?)
            }
            _ => None,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                capacity: config.capacity.max(1),
                policy: config.policy,
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    spill,
                    closed: false,
                    dropped: 0,
                }),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                metrics: PipelineMetrics::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn push(&self, item: T) -> Result<PushOutcome, BackpressureError> {
        match &self.shared.policy {
            BackpressurePolicy::Block { timeout_ms } => {
                let timeout = Duration::from_millis(*timeout_ms);
                let deadline = tokio::time::Instant::now() + timeout;
                let mut item = Some(item);
                loop {
                    {
                        let mut state = self.lock();
                        if state.closed {
                            return Err(self.closed());
                        }
                        if state.items.len() < self.shared.capacity {
                            if let Some(item) = item.take() {
                                state.items.push_back(item);
                            }
                            drop(state);
                            self.shared.not_empty.notify_one();
                            return Ok(PushOutcome::Queued);
                        }
                    }
                    if tokio::time::timeout_at(deadline, self.shared.not_full.notified())
                        .await
                        .is_err()
                    {
                        debug!(stage = %self.shared.name, "Push timed out on full stage");
                        return Err(BackpressureError::Timeout {
                            stage: self.shared.name.clone(),
                            timeout,
                        });
                    }
                }
            }
            BackpressurePolicy::DropOldest => {
                let outcome = {
                    let mut state = self.lock();
                    if state.closed {
                        return Err(self.closed());
                    }
                    let mut outcome = PushOutcome::Queued;
                    while state.items.len() >= self.shared.capacity {
                        state.items.pop_front();
                        state.dropped += 1;
                        self.shared.metrics.inc_backpressure_dropped(&self.shared.name);
                        outcome = PushOutcome::DroppedOldest;
                    }
                    state.items.push_back(item);
                    outcome
                };
                self.shared.not_empty.notify_one();
                Ok(outcome)
            }
            BackpressurePolicy::BufferWithSpill { .. } => {
                let outcome = {
                    let mut state = self.lock();
                    if state.closed {
                        return Err(self.closed());
                    }
                    let spilling = state.spill.as_ref().map(|s| !s.is_empty()).unwrap_or(false);
                    if !spilling && state.items.len() < self.shared.capacity {
                        state.items.push_back(item);
                        PushOutcome::Queued
                    } else {
                        // Once anything is on disk, new items queue behind it
                        let spilled = match state.spill.as_mut() {
                            Some(spill) => {
                                spill.push(&item).map_err(|source| BackpressureError::Spill {
                                    stage: self.shared.name.clone(),
                                    source,
                                })?;
                                spill.len()
                            }
                            None => 0,
                        };
                        self.shared.metrics.set_spilled(&self.shared.name, spilled as i64);
                        PushOutcome::Spilled
                    }
                };
                self.shared.not_empty.notify_one();
                Ok(outcome)
            }
        }
    }

    /// Next item, oldest first. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.lock().closed {
                return self.try_pop();
            }
            self.shared.not_empty.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = {
            let mut state = self.lock();
            if state.items.is_empty() {
                self.refill(&mut state);
            }
            let item = state.items.pop_front();
            if item.is_some() && state.items.len() < self.shared.capacity / 2 {
                self.refill(&mut state);
            }
            item
        };
        if item.is_some() {
            self.shared.not_full.notify_one();
        }
        item
    }

    fn refill(&self, state: &mut QueueState<T>) {
        let room = self.shared.capacity.saturating_sub(state.items.len());
        let Some(spill) = state.spill.as_mut() else {
            return;
        };
        if spill.is_empty() || room == 0 {
            return;
        }
        match spill.pop_batch(room) {
            Ok(batch) => {
                let remaining = spill.len();
                state.items.extend(batch);
                self.shared.metrics.set_spilled(&self.shared.name, remaining as i64);
            }
            Err(e) => warn!(stage = %self.shared.name, error = %e, "Failed to read spilled items"),
        }
    }

    /// Stop accepting pushes; queued items can still be popped
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.not_empty.notify_waiters();
        self.shared.not_empty.notify_one();
        self.shared.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Items held in memory plus on disk
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.items.len() + state.spill.as_ref().map(SpillQueue::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spilled(&self) -> usize {
        self.lock().spill.as_ref().map(SpillQueue::len).unwrap_or(0)
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Visit items waiting on disk, oldest first, without consuming them
    pub fn scan_spilled(&self, visit: impl FnMut(T)) {
        let state = self.lock();
        if let Some(spill) = state.spill.as_ref() {
            if let Err(e) = spill.scan(visit) {
                warn!(stage = %self.shared.name, error = %e, "Failed to scan spilled items");
            }
        }
    }

    fn closed(&self) -> BackpressureError {
        BackpressureError::Closed {
            stage: self.shared.name.clone(),
        }
    }
}
