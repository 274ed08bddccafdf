//! Isolation forest over small fixed-size feature vectors

use rand::rngs::StdRng;
use rand::seq::index::sample as sample_indices;
use rand::Rng;

pub const FEATURES: usize = 3;
pub type FeatureVector = [f64; FEATURES];

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful BST search over `n` points
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        dim: usize,
        value: f64,
        lower: FeatureVector,
        upper: FeatureVector,
        left: Box<Node>,
        right: Box<Node>,
    },
}

#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    /// Build `trees` trees, each from a random subsample of `points`
    pub fn build(points: &[FeatureVector], trees: usize, sample_size: usize, rng: &mut StdRng) -> Self {
        let sample_size = sample_size.min(points.len()).max(1);
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let trees = (0..trees.max(1))
            .map(|_| {
                let subsample: Vec<FeatureVector> = if points.is_empty() {
                    Vec::new()
                } else {
                    sample_indices(rng, points.len(), sample_size)
                        .into_iter()
                        .map(|i| points[i])
                        .collect()
                };
                grow(&subsample, 0, max_depth, rng)
            })
            .collect();

        Self { trees, sample_size }
    }

    /// Anomaly score `2^(-E[h(x)] / c(n))`; near 1 is anomalous, near 0.5 or below is normal
    pub fn score(&self, point: &FeatureVector) -> f64 {
        let mean_path: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, point, 0))
            .sum::<f64>()
            / self.trees.len() as f64;

        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / c)
    }
}

fn bounds(points: &[FeatureVector]) -> (FeatureVector, FeatureVector) {
    let mut lower = [f64::INFINITY; FEATURES];
    let mut upper = [f64::NEG_INFINITY; FEATURES];
    for p in points {
        for d in 0..FEATURES {
            lower[d] = lower[d].min(p[d]);
            upper[d] = upper[d].max(p[d]);
        }
    }
    (lower, upper)
}

fn grow(points: &[FeatureVector], depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
    if points.len() <= 1 || depth >= max_depth {
        return Node::Leaf { size: points.len() };
    }

    let (lower, upper) = bounds(points);
    let splittable: Vec<usize> = (0..FEATURES).filter(|&d| upper[d] > lower[d]).collect();
    if splittable.is_empty() {
        return Node::Leaf { size: points.len() };
    }

    let dim = splittable[rng.gen_range(0..splittable.len())];
    let value = rng.gen_range(lower[dim]..upper[dim]);
    let (left, right): (Vec<FeatureVector>, Vec<FeatureVector>) =
        points.iter().copied().partition(|p| p[dim] < value);

    Node::Split {
        dim,
        value,
        lower,
        upper,
        left: Box::new(grow(&left, depth + 1, max_depth, rng)),
        right: Box::new(grow(&right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, point: &FeatureVector, depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            dim,
            value,
            lower,
            upper,
            left,
            right,
        } => {
            // Outside everything this node saw: isolated right here
            let outside = (0..FEATURES).any(|d| point[d] < lower[d] || point[d] > upper[d]);
            if outside {
                return depth as f64;
            }
            if point[*dim] < *value {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}
