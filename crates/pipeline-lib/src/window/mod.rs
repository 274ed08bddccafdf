//! Windowing and aggregation
//!
//! Turns each key's sample stream into closed, aggregated intervals:
//! - Sliding windows aligned to multiples of the slide
//! - Session windows bounded by an inactivity gap
//! - Per-key watermark with a reorder buffer for bounded out-of-order input
//! - Streaming count/mean/variance, min/max, trend slope and t-digest percentiles

mod accumulator;
mod digest;
mod engine;
mod session;
mod sliding;

#[cfg(test)]
mod tests;

pub use accumulator::Accumulator;
pub use digest::{DigestError, TDigest, DEFAULT_COMPRESSION};
pub use engine::{Advance, ClosedWindow, ReleasedSample, WindowEngine};

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Window shape for a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowSpec {
    Sliding { size_ms: i64, slide_ms: i64 },
    Session { gap_ms: i64 },
}

impl WindowSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            WindowSpec::Sliding { size_ms, slide_ms } => {
                if size_ms <= 0 || slide_ms <= 0 {
                    return Err(ConfigError::new("sliding window size and slide must be positive"));
                }
                if slide_ms > size_ms {
                    return Err(ConfigError::new("sliding window slide must not exceed its size"));
                }
            }
            WindowSpec::Session { gap_ms } => {
                if gap_ms <= 0 {
                    return Err(ConfigError::new("session gap must be positive"));
                }
            }
        }
        Ok(())
    }
}

impl Default for WindowSpec {
    fn default() -> Self {
        WindowSpec::Sliding {
            size_ms: 300_000,
            slide_ms: 30_000,
        }
    }
}

/// Configuration for the window engine
#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub default_spec: WindowSpec,
    /// Per-metric window shapes
    pub overrides: HashMap<String, WindowSpec>,
    /// Watermark trails the max observed timestamp by this much (ms)
    pub allowed_lateness_ms: i64,
    /// Keys without arrivals this long get their watermark advanced from wall clock (ms)
    pub idle_timeout_ms: i64,
    /// Idle flushes keep the watermark at least this far behind wall clock (ms);
    /// set to the collector's accepted past skew
    pub max_event_delay_ms: i64,
    pub digest_compression: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            default_spec: WindowSpec::default(),
            overrides: HashMap::new(),
            allowed_lateness_ms: 5_000,
            idle_timeout_ms: 60_000,
            max_event_delay_ms: 3_600_000,
            digest_compression: DEFAULT_COMPRESSION,
        }
    }
}

impl WindowConfig {
    pub fn spec_for(&self, metric: &str) -> WindowSpec {
        self.overrides
            .get(metric)
            .copied()
            .unwrap_or(self.default_spec)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_spec.validate()?;
        for spec in self.overrides.values() {
            spec.validate()?;
        }
        if self.allowed_lateness_ms < 0 {
            return Err(ConfigError::new("allowed lateness must not be negative"));
        }
        if self.max_event_delay_ms < 0 {
            return Err(ConfigError::new("max event delay must not be negative"));
        }
        Ok(())
    }
}
