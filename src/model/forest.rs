//! Hand-rolled Isolation Forest.
//!
//! No published Rust isolation-forest crate fits this pipeline's exact
//! scoring contract, so the forest, its scaler, and its persistence format
//! are all hand-rolled rather than delegated to a model crate.
//!
//! Reference: Liu, Ting, Zhou, "Isolation Forest" (ICDM 2008). Score
//! normalization follows the paper's `2^(-E[h(x)]/c(n))`; the sign and
//! offset convention (positive = normal, negative = anomaly) mirrors
//! scikit-learn's `IsolationForest.decision_function`, computed here as a
//! contamination-quantile offset subtracted from the paper's raw score.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

fn harmonic(n: usize) -> f64 {
    if n == 0 {
        0.0
    } else {
        (n as f64).ln() + EULER_GAMMA
    }
}

/// Average path length of an unbuilt subtree of `n` points, from the paper's
/// BST-analogy normalization constant.
fn c_factor(n: usize) -> f64 {
    if n > 1 {
        2.0 * harmonic(n - 1) - 2.0 * (n - 1) as f64 / n as f64
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsolationNode {
    Leaf { size: usize },
    Split {
        feature: usize,
        value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
}

impl IsolationNode {
    fn build(
        rows: &[&[f64; 12]],
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> Self {
        if rows.len() <= 1 || depth >= height_limit {
            return IsolationNode::Leaf { size: rows.len() };
        }

        // Try a handful of features for one with non-degenerate range
        // before giving up and treating this node as a leaf.
        for _ in 0..12 {
            let feature = rng.gen_range(0..12);
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for row in rows {
                let v = row[feature];
                if v < min {
                    min = v;
                }
                if v > max {
                    max = v;
                }
            }
            if max <= min {
                continue;
            }

            let split = rng.gen_range(min..max);
            let (left, right): (Vec<&[f64; 12]>, Vec<&[f64; 12]>) =
                rows.iter().partition(|row| row[feature] < split);

            if left.is_empty() || right.is_empty() {
                continue;
            }

            return IsolationNode::Split {
                feature,
                value: split,
                left: Box::new(Self::build(&left, depth + 1, height_limit, rng)),
                right: Box::new(Self::build(&right, depth + 1, height_limit, rng)),
            };
        }

        IsolationNode::Leaf { size: rows.len() }
    }

    fn path_length(&self, x: &[f64; 12], depth: usize) -> f64 {
        match self {
            IsolationNode::Leaf { size } => depth as f64 + c_factor(*size),
            IsolationNode::Split {
                feature,
                value,
                left,
                right,
            } => {
                if x[*feature] < *value {
                    left.path_length(x, depth + 1)
                } else {
                    right.path_length(x, depth + 1)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_estimators: usize,
    pub contamination: f64,
    pub random_state: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            contamination: 0.05,
            random_state: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    config: ForestConfig,
    trees: Vec<IsolationNode>,
    /// Subsample size each tree was grown from; the normalization constant
    /// `c(n)` uses this value, not the full training set size.
    sample_size: usize,
    /// Contamination-quantile offset subtracted from the raw paper score so
    /// `decision_function` crosses zero at the configured contamination rate.
    offset: f64,
}

impl IsolationForest {
    /// Fit a forest on already-scaled training vectors.
    pub fn fit(data: &[[f64; 12]], config: ForestConfig) -> Self {
        let n = data.len().max(1);
        let sample_size = n.min(256);
        let height_limit = (sample_size as f64).log2().ceil().max(1.0) as usize;

        let mut rng = StdRng::seed_from_u64(config.random_state);
        let mut indices: Vec<usize> = (0..n).collect();

        let trees: Vec<IsolationNode> = (0..config.n_estimators)
            .map(|_| {
                indices.shuffle(&mut rng);
                let sample: Vec<&[f64; 12]> = indices[..sample_size]
                    .iter()
                    .map(|&i| &data[i])
                    .collect();
                IsolationNode::build(&sample, 0, height_limit, &mut rng)
            })
            .collect();

        let mut forest = Self {
            config,
            trees,
            sample_size,
            offset: 0.0,
        };

        let mut raw_scores: Vec<f64> = data.iter().map(|x| forest.raw_score(x)).collect();
        raw_scores.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((config.contamination * raw_scores.len() as f64).floor() as usize)
            .min(raw_scores.len().saturating_sub(1));
        forest.offset = raw_scores.get(idx).copied().unwrap_or(0.0);

        forest
    }

    /// `2^(-E[h(x)]/c(n))` normalized to sklearn's sign convention: negative
    /// is anomalous, before the contamination offset is applied.
    fn raw_score(&self, x: &[f64; 12]) -> f64 {
        let avg_path: f64 = self.trees.iter().map(|t| t.path_length(x, 0)).sum::<f64>()
            / self.trees.len().max(1) as f64;
        let s = 2f64.powf(-avg_path / c_factor(self.sample_size).max(1e-9));
        -s
    }

    /// Signed anomaly score: negative means anomalous, positive normal, with
    /// `contamination` fraction of the training distribution falling below
    /// zero.
    pub fn decision_function(&self, x: &[f64; 12]) -> f64 {
        self.raw_score(x) - self.offset
    }

    pub fn predict(&self, x: &[f64; 12]) -> i32 {
        if self.decision_function(x) < 0.0 {
            -1
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal_cluster() -> Vec<[f64; 12]> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..200)
            .map(|_| {
                let mut row = [0.0f64; 12];
                for v in row.iter_mut() {
                    *v = rng.gen_range(0.0..1.0);
                }
                row
            })
            .collect()
    }

    #[test]
    fn far_outlier_scores_more_anomalous_than_cluster_center() {
        let data = normal_cluster();
        let forest = IsolationForest::fit(&data, ForestConfig::default());

        let center = [0.5f64; 12];
        let outlier = [500.0f64; 12];

        assert!(forest.decision_function(&outlier) < forest.decision_function(&center));
    }

    #[test]
    fn contamination_fraction_of_training_set_is_flagged() {
        let data = normal_cluster();
        let config = ForestConfig {
            contamination: 0.05,
            ..ForestConfig::default()
        };
        let forest = IsolationForest::fit(&data, config);

        let anomalies = data
            .iter()
            .filter(|x| forest.predict(x) == -1)
            .count();
        let ratio = anomalies as f64 / data.len() as f64;
        assert!(ratio < 0.2, "anomaly ratio too high: {ratio}");
    }
}
