//! One-dimensional isolation forest.
//!
//! Trees split on uniformly drawn thresholds until every point is isolated or
//! the depth limit is hit. Points that are easy to isolate (short average path)
//! score close to 1, ordinary points around 0.5 or below. The decision
//! threshold is taken from the training scores so that roughly
//! `contamination` of the training set sits above it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Subsample size per tree.
const MAX_SAMPLES: usize = 256;
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Copy)]
pub struct ForestParams {
    pub trees: usize,
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self { trees: 100, contamination: 0.1, seed: 42 }
    }
}

#[derive(Debug)]
enum Node {
    Leaf { size: usize, min: f64, max: f64 },
    Split { threshold: f64, left: Box<Node>, right: Box<Node> },
}

#[derive(Debug)]
pub struct IsolationForest {
    params: ForestParams,
    trees: Vec<Node>,
    sample_size: usize,
    threshold: f64,
}

impl IsolationForest {
    pub fn new(params: ForestParams) -> Self {
        Self { params, trees: Vec::new(), sample_size: 0, threshold: f64::INFINITY }
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    /// Rebuilds every tree from `data`. The RNG is reseeded on each fit, so the
    /// same data always produces the same forest.
    pub fn fit(&mut self, data: &[f64]) {
        self.trees.clear();
        if data.is_empty() {
            return;
        }

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let sample_size = data.len().min(MAX_SAMPLES);
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        for _ in 0..self.params.trees.max(1) {
            let picked: Vec<f64> = rand::seq::index::sample(&mut rng, data.len(), sample_size)
                .into_iter()
                .map(|i| data[i])
                .collect();
            self.trees.push(grow(picked, 0, max_depth, &mut rng));
        }
        self.sample_size = sample_size;

        let mut scores: Vec<f64> = data.iter().map(|&x| self.score(x)).collect();
        scores.sort_by(f64::total_cmp);
        self.threshold = quantile(&scores, 1.0 - self.params.contamination);
    }

    /// Anomaly score in (0, 1]; higher means easier to isolate.
    pub fn score(&self, x: f64) -> f64 {
        let norm = average_path_length(self.sample_size);
        if self.trees.is_empty() || norm <= 0.0 {
            return 0.5;
        }
        let total: f64 = self.trees.iter().map(|tree| path_length(tree, x, 0)).sum();
        let mean = total / self.trees.len() as f64;
        2f64.powf(-mean / norm)
    }

    pub fn is_anomaly(&self, x: f64) -> bool {
        self.is_fitted() && self.score(x) > self.threshold
    }
}

fn grow(values: Vec<f64>, depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    // a span that overflows to infinity cannot be sampled from
    if depth >= max_depth || values.len() <= 1 || min >= max || !(max - min).is_finite() {
        return Node::Leaf { size: values.len(), min, max };
    }

    // threshold lies in [min, max), so both sides are non-empty
    let threshold = rng.random_range(min..max);
    let (left, right): (Vec<f64>, Vec<f64>) = values.into_iter().partition(|&v| v <= threshold);
    Node::Split {
        threshold,
        left: Box::new(grow(left, depth + 1, max_depth, rng)),
        right: Box::new(grow(right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, x: f64, depth: usize) -> f64 {
    match node {
        // outside the leaf's range the query is already isolated here
        Node::Leaf { size, min, max } => {
            if x < *min || x > *max {
                depth as f64
            } else {
                depth as f64 + average_path_length(*size)
            }
        }
        Node::Split { threshold, left, right } => {
            if x <= *threshold {
                path_length(left, x, depth + 1)
            } else {
                path_length(right, x, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful search in a BST of `n` nodes.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// Linear-interpolated quantile of an ascending slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::INFINITY;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfitted_forest_flags_nothing() {
        let forest = IsolationForest::new(ForestParams::default());
        assert!(!forest.is_anomaly(1_000.0));
    }

    #[test]
    fn test_constant_training_flags_outlier_only() {
        let mut forest = IsolationForest::new(ForestParams::default());
        forest.fit(&[10.0; 50]);
        assert!(!forest.is_anomaly(10.0));
        assert!(forest.is_anomaly(99.0));
        assert!(forest.is_anomaly(9.5));
    }

    #[test]
    fn test_spike_in_noisy_series() {
        let data: Vec<f64> = (0..60).map(|i| 10.0 + (i % 5) as f64 * 0.5).collect();
        let mut forest = IsolationForest::new(ForestParams::default());
        forest.fit(&data);
        assert!(forest.is_anomaly(95.0));
        assert!(forest.score(95.0) > forest.score(11.0));
    }

    #[test]
    fn test_contamination_bounds_training_flags() {
        let data: Vec<f64> = (0..100).map(|i| (i as f64 * 7.3) % 100.0).collect();
        let mut forest = IsolationForest::new(ForestParams::default());
        forest.fit(&data);
        let flagged = data.iter().filter(|&&x| forest.is_anomaly(x)).count();
        assert!(flagged <= 10, "flagged {flagged} of 100");
    }

    #[test]
    fn test_fit_is_reproducible() {
        let data: Vec<f64> = (0..80).map(|i| ((i * 37) % 23) as f64).collect();
        let mut a = IsolationForest::new(ForestParams::default());
        let mut b = IsolationForest::new(ForestParams::default());
        a.fit(&data);
        b.fit(&data);
        for x in [0.0, 11.0, 22.0, 40.0] {
            assert_eq!(a.score(x), b.score(x));
        }
    }

    #[test]
    fn test_extreme_span_does_not_panic() {
        let mut data = vec![10.0; 60];
        data.push(-1.7e308);
        data.push(1.7e308);
        let mut forest = IsolationForest::new(ForestParams::default());
        forest.fit(&data);
        assert!(forest.is_fitted());
        assert!(forest.score(10.0).is_finite());
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!(average_path_length(256) > average_path_length(50));
    }
}
