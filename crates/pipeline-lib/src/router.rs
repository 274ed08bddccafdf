//! Static hash partitioning
//!
//! Every sample is mapped to a [`PartitionKey`] and the key to one of N
//! partitions by `stable_hash % N`. N is fixed for the lifetime of the
//! process; there is no rebalancing.

use crate::models::{MetricSample, PartitionKey};

#[derive(Debug, Clone)]
pub struct Router {
    partitions: usize,
}

impl Router {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    /// Canonical routing key of a sample
    pub fn route(&self, sample: &MetricSample) -> PartitionKey {
        PartitionKey::from_sample(sample)
    }

    pub fn partition_for(&self, key: &PartitionKey) -> usize {
        (key.stable_hash() % self.partitions as u64) as usize
    }

    /// Split a batch by partition while keeping arrival order within each partition
    pub fn split(&self, samples: Vec<MetricSample>) -> Vec<Vec<(PartitionKey, MetricSample)>> {
        let mut out: Vec<Vec<_>> = (0..self.partitions).map(|_| Vec::new()).collect();
        for sample in samples {
            let key = self.route(&sample);
            let partition = self.partition_for(&key);
            out[partition].push((key, sample));
        }
        out
    }
}
