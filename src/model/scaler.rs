//! Per-feature standardization (zero-mean, unit-variance).
//!
//! Mirrors `sklearn.preprocessing.StandardScaler`: population standard
//! deviation (ddof=0), so the scaler and forest see a distribution with
//! variance 1.0 exactly when replayed against the training set.

use serde::{Deserialize, Serialize};

use crate::features::FEATURE_NAMES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: [f64; 12],
    pub stds: [f64; 12],
}

impl StandardScaler {
    /// Fit a scaler from a batch of feature vectors. An all-constant column
    /// (std == 0) is left unscaled rather than dividing by zero.
    pub fn fit(data: &[[f64; 12]]) -> Self {
        let n = data.len().max(1) as f64;
        let mut means = [0.0f64; 12];
        for row in data {
            for i in 0..12 {
                means[i] += row[i];
            }
        }
        for m in means.iter_mut() {
            *m /= n;
        }

        let mut variances = [0.0f64; 12];
        for row in data {
            for i in 0..12 {
                let d = row[i] - means[i];
                variances[i] += d * d;
            }
        }
        let mut stds = [0.0f64; 12];
        for i in 0..12 {
            stds[i] = (variances[i] / n).sqrt();
        }

        Self { means, stds }
    }

    pub fn transform(&self, vector: &[f64; 12]) -> [f64; 12] {
        let mut out = [0.0f64; 12];
        for i in 0..12 {
            out[i] = if self.stds[i] > 0.0 {
                (vector[i] - self.means[i]) / self.stds[i]
            } else {
                0.0
            };
        }
        out
    }

    /// Feature means/stds keyed by name, for `training_stats` reporting.
    pub fn means_by_name(&self) -> std::collections::HashMap<String, f64> {
        FEATURE_NAMES
            .iter()
            .zip(self.means.iter())
            .map(|(n, v)| (n.to_string(), *v))
            .collect()
    }

    pub fn stds_by_name(&self) -> std::collections::HashMap<String, f64> {
        FEATURE_NAMES
            .iter()
            .zip(self.stds.iter())
            .map(|(n, v)| (n.to_string(), *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_produces_zero_mean_unit_variance() {
        let data = vec![
            [1.0; 12],
            [2.0; 12],
            [3.0; 12],
        ];
        let scaler = StandardScaler::fit(&data);
        assert!((scaler.means[0] - 2.0).abs() < 1e-9);

        let transformed: Vec<[f64; 12]> = data.iter().map(|v| scaler.transform(v)).collect();
        let mean: f64 = transformed.iter().map(|r| r[0]).sum::<f64>() / 3.0;
        assert!(mean.abs() < 1e-9);
    }

    #[test]
    fn constant_column_does_not_divide_by_zero() {
        let data = vec![[5.0; 12], [5.0; 12]];
        let scaler = StandardScaler::fit(&data);
        let transformed = scaler.transform(&[5.0; 12]);
        assert_eq!(transformed[0], 0.0);
    }
}
