//! Per-sink circuit breaker
//!
//! Closed until `failure_threshold` consecutive failures, then Open: calls are
//! rejected without touching the sink. After `recovery_timeout` a single trial
//! call is let through (HalfOpen); its outcome closes or reopens the circuit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Failures further apart than this do not count as consecutive
    pub failure_window_secs: u64,
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            recovery_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Call rejected because the circuit is open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Time left until a trial call is allowed
    pub retry_in: Duration,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.config.recovery_timeout_secs)
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Ask permission for one call at `now`
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Rejected> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let ready_at = opened_at + self.recovery_timeout();
                if now >= ready_at {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(Rejected {
                        retry_in: ready_at - now,
                    })
                }
            }
            CircuitState::HalfOpen if self.trial_in_flight => Err(Rejected {
                retry_in: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                self.trial_in_flight = true;
                Ok(())
            }
        }
    }

    pub fn try_acquire(&mut self) -> Result<(), Rejected> {
        self.try_acquire_at(Instant::now())
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure = None;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        let window = Duration::from_secs(self.config.failure_window_secs);
        let stale = self
            .last_failure
            .map(|last| now.saturating_duration_since(last) > window)
            .unwrap_or(false);
        if stale {
            self.consecutive_failures = 0;
        }
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        self.trial_in_flight = false;

        let trip = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.config.failure_threshold.max(1),
            CircuitState::Open => false,
        };
        if trip {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            failure_window_secs: 60,
            recovery_timeout_secs: 30,
        })
    }

    #[test]
    fn test_opens_after_exactly_n_failures() {
        let mut cb = breaker(3);
        let t0 = Instant::now();

        for i in 0..2 {
            assert!(cb.try_acquire_at(t0).is_ok());
            cb.record_failure_at(t0 + Duration::from_secs(i));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(cb.try_acquire_at(t0).is_ok());
        cb.record_failure_at(t0 + Duration::from_secs(2));
        assert_eq!(cb.state(), CircuitState::Open);

        // Rejected immediately while open
        let rejected = cb.try_acquire_at(t0 + Duration::from_secs(3)).unwrap_err();
        assert_eq!(rejected.retry_in, Duration::from_secs(29));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = breaker(3);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        cb.record_success();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let mut cb = breaker(2);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        cb.record_failure_at(t0 + Duration::from_secs(120));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 1);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let mut cb = breaker(1);
        let t0 = Instant::now();
        cb.record_failure_at(t0);
        assert_eq!(cb.state(), CircuitState::Open);

        let later = t0 + Duration::from_secs(30);
        assert!(cb.try_acquire_at(later).is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire_at(later).is_err());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire_at(later).is_ok());
    }

    #[test]
    fn test_failed_trial_reopens() {
        let mut cb = breaker(1);
        let t0 = Instant::now();
        cb.record_failure_at(t0);

        let trial = t0 + Duration::from_secs(31);
        assert!(cb.try_acquire_at(trial).is_ok());
        cb.record_failure_at(trial);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire_at(trial + Duration::from_secs(29)).is_err());
        assert!(cb.try_acquire_at(trial + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_gauge_encoding() {
        assert_eq!(CircuitState::Closed.as_gauge(), 0);
        assert_eq!(CircuitState::HalfOpen.as_gauge(), 1);
        assert_eq!(CircuitState::Open.as_gauge(), 2);
    }
}
