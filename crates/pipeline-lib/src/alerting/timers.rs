//! Deadline queue for alert timers

use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// The rule's `for` duration has elapsed since the alert went pending
    PendingElapsed,
    /// Escalate to step `level` of the rule's escalation chain
    Escalation { level: usize },
    AckTimeout,
    /// Deliver a firing notification held back by cooldown
    DeferredNotify,
    /// Resolved alert returns to Inactive
    Retention,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    pub alert_id: String,
    pub kind: TimerKind,
    /// Alert epoch at scheduling time
    pub epoch: u64,
    pub due_ms: i64,
}

#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    due_ms: i64,
    seq: u64,
    timer: Timer,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on (due, insertion order)
        other
            .due_ms
            .cmp(&self.due_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, timer: Timer) {
        self.seq += 1;
        self.heap.push(Scheduled {
            due_ms: timer.due_ms,
            seq: self.seq,
            timer,
        });
    }

    /// Remove and return every timer due at or before `now_ms`, earliest first
    pub fn pop_due(&mut self, now_ms: i64) -> Vec<Timer> {
        let mut due = Vec::new();
        while self.heap.peek().map(|s| s.due_ms <= now_ms).unwrap_or(false) {
            if let Some(s) = self.heap.pop() {
                due.push(s.timer);
            }
        }
        due
    }

    pub fn next_due(&self) -> Option<i64> {
        self.heap.peek().map(|s| s.due_ms)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(id: &str, due_ms: i64) -> Timer {
        Timer {
            alert_id: id.to_string(),
            kind: TimerKind::AckTimeout,
            epoch: 0,
            due_ms,
        }
    }

    #[test]
    fn test_pop_due_in_deadline_then_insertion_order() {
        let mut q = TimerQueue::new();
        q.schedule(timer("c", 300));
        q.schedule(timer("a", 100));
        q.schedule(timer("b", 100));
        q.schedule(timer("d", 500));

        let due: Vec<_> = q.pop_due(300).into_iter().map(|t| t.alert_id).collect();
        assert_eq!(due, vec!["a", "b", "c"]);
        assert_eq!(q.next_due(), Some(500));
        assert!(q.pop_due(499).is_empty());
    }
}
