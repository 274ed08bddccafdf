//! Bounded-memory quantile summary (t-digest)
//!
//! Values are buffered and periodically merged into sorted centroids whose
//! weight is capped by a scale function that is tight at the tails, so
//! memory stays O(compression) regardless of stream length.

use crate::models::Percentiles;
use std::cmp::Ordering;
use thiserror::Error;

pub const DEFAULT_COMPRESSION: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DigestError {
    #[error("digest is empty")]
    Empty,

    #[error("non-finite value {0} cannot be summarized")]
    NonFinite(f64),

    #[error("centroid mean overflowed while merging")]
    Overflow,

    #[error("quantile {0} is outside [0, 1]")]
    InvalidQuantile(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

impl Centroid {
    fn absorb(&mut self, other: &Centroid) {
        let total = self.weight + other.weight;
        self.mean += (other.mean - self.mean) * other.weight / total;
        self.weight = total;
    }
}

#[derive(Debug, Clone)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: u64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION)
    }
}

impl TDigest {
    /// Create a digest; non-positive compression falls back to the default
    pub fn new(compression: f64) -> Self {
        let compression = if compression.is_finite() && compression > 0.0 {
            compression
        } else {
            DEFAULT_COMPRESSION
        };

        Self {
            compression,
            centroids: Vec::new(),
            buffer: Vec::new(),
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Number of centroids after merging the pending buffer
    pub fn centroid_count(&mut self) -> Result<usize, DigestError> {
        self.flush()?;
        Ok(self.centroids.len())
    }

    pub fn add(&mut self, value: f64) -> Result<(), DigestError> {
        if !value.is_finite() {
            return Err(DigestError::NonFinite(value));
        }

        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.buffer.push(value);
        self.count += 1;

        if self.buffer.len() >= (self.compression * 2.0) as usize {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DigestError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut all = std::mem::take(&mut self.centroids);
        all.extend(self.buffer.drain(..).map(|mean| Centroid { mean, weight: 1.0 }));
        all.sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap_or(Ordering::Equal));

        let total = self.count as f64;
        let mut merged = Vec::with_capacity(all.len().min(self.compression as usize * 4));
        let mut weight_so_far = 0.0;
        let mut iter = all.into_iter();
        let Some(mut current) = iter.next() else {
            return Ok(());
        };

        for next in iter {
            let proposed = current.weight + next.weight;
            let q = (weight_so_far + proposed / 2.0) / total;
            if proposed <= self.weight_limit(q) {
                current.absorb(&next);
                if !current.mean.is_finite() {
                    return Err(DigestError::Overflow);
                }
            } else {
                weight_so_far += current.weight;
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);

        self.centroids = merged;
        Ok(())
    }

    fn weight_limit(&self, q: f64) -> f64 {
        let q = q.clamp(0.0001, 0.9999);
        (self.compression * (q * (1.0 - q)).sqrt() * 4.0).max(1.0)
    }

    pub fn quantile(&mut self, q: f64) -> Result<f64, DigestError> {
        if !(0.0..=1.0).contains(&q) {
            return Err(DigestError::InvalidQuantile(q));
        }
        self.flush()?;

        let n = self.centroids.len();
        if n == 0 {
            return Err(DigestError::Empty);
        }
        if q == 0.0 {
            return Ok(self.min);
        }
        if q == 1.0 {
            return Ok(self.max);
        }

        let target = q * self.count as f64;
        let mut idx = n - 1;
        let mut lower = self.count as f64 - self.centroids[n - 1].weight;
        let mut cumulative = 0.0;
        for (i, c) in self.centroids.iter().enumerate() {
            if target <= cumulative + c.weight {
                idx = i;
                lower = cumulative;
                break;
            }
            cumulative += c.weight;
        }

        let c = self.centroids[idx];
        let frac = ((target - lower) / c.weight).clamp(0.0, 1.0);
        let (lo, hi) = if n == 1 {
            (self.min, self.max)
        } else if idx == 0 {
            (self.min, (c.mean + self.centroids[1].mean) / 2.0)
        } else if idx == n - 1 {
            ((self.centroids[n - 2].mean + c.mean) / 2.0, self.max)
        } else {
            (
                (self.centroids[idx - 1].mean + c.mean) / 2.0,
                (c.mean + self.centroids[idx + 1].mean) / 2.0,
            )
        };

        let estimate = lo + frac * (hi - lo);
        if !estimate.is_finite() {
            return Err(DigestError::Overflow);
        }
        Ok(estimate.clamp(self.min, self.max))
    }

    pub fn percentiles(&mut self) -> Result<Percentiles, DigestError> {
        Ok(Percentiles {
            p50: self.quantile(0.50)?,
            p75: self.quantile(0.75)?,
            p95: self.quantile(0.95)?,
            p99: self.quantile(0.99)?,
        })
    }
}
