//! Anomaly Detector: Isolation Forest + scaler + security override rules,
//! tied together behind train/predict/persistence operations.

pub mod forest;
pub mod persistence;
pub mod rules;
pub mod scaler;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::features::{BuildFeatures, FEATURE_NAMES};
use forest::{ForestConfig, IsolationForest};
use persistence::{ModelMetadata, TrainingStats, METADATA_VERSION};
use rules::{check_security_rules, generate_reasons, top_contributing_features, AnomalyReason};
use scaler::StandardScaler;

/// Result of scoring a single build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub build_id: String,
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    pub prediction: i32,
    pub confidence: f64,
    pub anomaly_reasons: Vec<AnomalyReason>,
    pub top_contributing_features: Vec<rules::FeatureContribution>,
    pub model_version: String,
    pub processed_at: DateTime<Utc>,
}

/// A single training record, projected from CSV or a CLI-built dataframe.
/// `label` drives the "only normal samples" filter; `None`
/// is treated as an implicitly-normal unlabeled sample.
#[derive(Debug, Clone)]
pub struct TrainingRecord {
    pub features: HashMap<String, f64>,
    pub label: Option<String>,
}

/// Config knobs for forest construction, env-driven.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DetectorConfig {
    pub n_estimators: usize,
    pub contamination: f64,
    pub random_state: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            contamination: 0.05,
            random_state: 42,
        }
    }
}

/// The live model instance a Detector Worker holds. `train`/`retrain`
/// replace `forest`/`scaler`/`metadata` together — callers must never
/// observe a forest paired with a stale scaler.
pub struct AnomalyDetector {
    config: DetectorConfig,
    model_path: PathBuf,
    forest: Option<IsolationForest>,
    scaler: Option<StandardScaler>,
    metadata: Option<ModelMetadata>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig, model_path: PathBuf) -> Self {
        Self {
            config,
            model_path,
            forest: None,
            scaler: None,
            metadata: None,
        }
    }

    /// Load a persisted model if present. Not an error if absent — the
    /// worker lazily trains on first message instead.
    pub fn load_if_present(&mut self) -> Result<bool> {
        match persistence::load(&self.model_path)? {
            Some((forest, scaler, metadata)) => {
                self.forest = Some(forest);
                self.scaler = Some(scaler);
                self.metadata = Some(metadata);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.forest.is_some() && self.scaler.is_some()
    }

    pub fn model_version(&self) -> String {
        self.metadata
            .as_ref()
            .map(|m| m.version.clone())
            .unwrap_or_else(|| "untrained".to_string())
    }

    pub fn training_stats(&self) -> Option<&TrainingStats> {
        self.metadata.as_ref().map(|m| &m.training_stats)
    }

    /// Train (or retrain) from in-memory records, keeping only `label ==
    /// "normal"` rows when any record carries a label, imputing missing
    /// feature columns with the column median, then persisting atomically.
    pub fn train(&mut self, records: &[TrainingRecord]) -> Result<TrainingStats> {
        if records.is_empty() {
            return Err(PipelineError::training_data("no training records supplied"));
        }

        let any_labeled = records.iter().any(|r| r.label.is_some());
        let filtered: Vec<&TrainingRecord> = if any_labeled {
            records
                .iter()
                .filter(|r| r.label.as_deref() == Some("normal"))
                .collect()
        } else {
            records.iter().collect()
        };

        if filtered.is_empty() {
            return Err(PipelineError::training_data(
                "no samples labeled 'normal' in training data",
            ));
        }

        let data = impute_and_vectorize(&filtered);

        let scaler = StandardScaler::fit(&data);
        let scaled: Vec<[f64; 12]> = data.iter().map(|v| scaler.transform(v)).collect();

        let forest_config = ForestConfig {
            n_estimators: self.config.n_estimators,
            contamination: self.config.contamination,
            random_state: self.config.random_state,
        };
        let forest = IsolationForest::fit(&scaled, forest_config);

        let predictions: Vec<i32> = scaled.iter().map(|x| forest.predict(x)).collect();
        let scores: Vec<f64> = scaled.iter().map(|x| forest.decision_function(x)).collect();
        let n_anomalies = predictions.iter().filter(|&&p| p == -1).count();
        let score_mean = mean(&scores);
        let score_std = std_dev(&scores, score_mean);

        let training_stats = TrainingStats {
            n_samples: data.len(),
            anomaly_ratio: n_anomalies as f64 / data.len() as f64,
            feature_means: scaler.means_by_name(),
            feature_stds: scaler.stds_by_name(),
            score_mean,
            score_std,
        };

        let metadata = ModelMetadata {
            version: METADATA_VERSION.to_string(),
            trained_at: Utc::now(),
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            training_stats: training_stats.clone(),
            config: forest_config,
        };

        persistence::save(&self.model_path, &forest, &scaler, &metadata)?;

        self.forest = Some(forest);
        self.scaler = Some(scaler);
        self.metadata = Some(metadata);

        Ok(training_stats)
    }

    pub fn train_from_csv(&mut self, csv_path: &Path) -> Result<TrainingStats> {
        if !csv_path.exists() {
            return Err(PipelineError::training_data(format!(
                "training data not found: {}",
                csv_path.display()
            )));
        }

        let mut reader = csv::Reader::from_path(csv_path)
            .map_err(|e| PipelineError::training_data(e.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|e| PipelineError::training_data(e.to_string()))?
            .clone();

        let mut records = Vec::new();
        for result in reader.records() {
            let row = result.map_err(|e| PipelineError::training_data(e.to_string()))?;
            let mut features = HashMap::new();
            let mut label = None;
            for (header, value) in headers.iter().zip(row.iter()) {
                if header == "label" {
                    label = Some(value.to_string());
                } else if let Ok(parsed) = value.parse::<f64>() {
                    features.insert(header.to_string(), parsed);
                }
            }
            records.push(TrainingRecord { features, label });
        }

        self.train(&records)
    }

    /// Score a build's feature vector. The `raw_features` map backs the
    /// override rules (evaluated on the un-scaled dict).
    pub fn predict(&self, features: &BuildFeatures, save_build_id: &str) -> Result<AnomalyResult> {
        let forest = self
            .forest
            .as_ref()
            .ok_or_else(|| PipelineError::ModelNotTrained("model has not been trained".into()))?;
        let scaler = self.scaler.as_ref().expect("forest and scaler load together");

        let vector = features.to_feature_vector();
        let scaled = scaler.transform(&vector);

        let prediction = forest.predict(&scaled);
        let mut anomaly_score = forest.decision_function(&scaled);
        let mut is_anomaly = prediction == -1;
        let confidence = score_to_confidence(anomaly_score);

        let override_reasons = check_security_rules(features);
        let overridden = !override_reasons.is_empty();
        if overridden {
            is_anomaly = true;
            if anomaly_score > 0.0 {
                anomaly_score = -0.05;
            }
        }

        let mut reasons = generate_reasons(features, is_anomaly);
        if overridden {
            let mut combined = override_reasons;
            combined.append(&mut reasons);
            reasons = combined;
        }

        let (means, stds) = match &self.metadata {
            Some(meta) => (
                meta.training_stats.feature_means.clone(),
                meta.training_stats.feature_stds.clone(),
            ),
            None => (HashMap::new(), HashMap::new()),
        };
        let top_features = top_contributing_features(features, &means, &stds);

        Ok(AnomalyResult {
            build_id: save_build_id.to_string(),
            is_anomaly,
            anomaly_score,
            prediction: if is_anomaly { -1 } else { 1 },
            confidence,
            anomaly_reasons: reasons,
            top_contributing_features: top_features,
            model_version: self.model_version(),
            processed_at: Utc::now(),
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}

/// `clamp(0.5 - raw_score, 0, 1)`, so more-anomalous (more negative score)
/// yields higher confidence.
fn score_to_confidence(raw_score: f64) -> f64 {
    (0.5 - raw_score).clamp(0.0, 1.0)
}

fn impute_and_vectorize(records: &[&TrainingRecord]) -> Vec<[f64; 12]> {
    let medians: HashMap<&str, f64> = FEATURE_NAMES
        .iter()
        .map(|&name| {
            let mut values: Vec<f64> = records
                .iter()
                .filter_map(|r| r.features.get(name).copied())
                .collect();
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let median = if values.is_empty() {
                0.0
            } else {
                values[values.len() / 2]
            };
            (name, median)
        })
        .collect();

    records
        .iter()
        .map(|r| {
            let mut row = [0.0f64; 12];
            for (i, &name) in FEATURE_NAMES.iter().enumerate() {
                row[i] = r
                    .features
                    .get(name)
                    .copied()
                    .unwrap_or_else(|| medians[name]);
            }
            row
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64], mean_value: f64) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        let variance = values.iter().map(|v| (v - mean_value).powi(2)).sum::<f64>() / values.len() as f64;
        variance.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(duration: f64, suspicious: f64) -> TrainingRecord {
        let mut features = HashMap::new();
        features.insert("duration_seconds".to_string(), duration);
        features.insert("suspicious_pattern_count".to_string(), suspicious);
        TrainingRecord {
            features,
            label: None,
        }
    }

    #[test]
    fn predict_before_training_is_rejected() {
        let dir = tempdir().unwrap();
        let detector = AnomalyDetector::new(DetectorConfig::default(), dir.path().join("model"));
        let features = sample_features();
        assert!(matches!(
            detector.predict(&features, "b1"),
            Err(PipelineError::ModelNotTrained(_))
        ));
    }

    #[test]
    fn train_then_predict_round_trips_after_reload() {
        let dir = tempdir().unwrap();
        let model_path = dir.path().join("model");

        let records: Vec<TrainingRecord> = (0..50).map(|i| record(100.0 + i as f64, 0.0)).collect();
        let mut detector = AnomalyDetector::new(DetectorConfig::default(), model_path.clone());
        detector.train(&records).unwrap();

        let features = sample_features();
        let before = detector.predict(&features, "b1").unwrap();

        let mut reloaded = AnomalyDetector::new(DetectorConfig::default(), model_path);
        assert!(reloaded.load_if_present().unwrap());
        let after = reloaded.predict(&features, "b1").unwrap();

        assert!((before.anomaly_score - after.anomaly_score).abs() < 1e-9);
        assert_eq!(before.prediction, after.prediction);
    }

    #[test]
    fn suspicious_pattern_forces_anomaly_regardless_of_score() {
        let dir = tempdir().unwrap();
        let records: Vec<TrainingRecord> = (0..50).map(|i| record(100.0 + i as f64, 0.0)).collect();
        let mut detector = AnomalyDetector::new(DetectorConfig::default(), dir.path().join("model"));
        detector.train(&records).unwrap();

        let mut features = sample_features();
        features.suspicious_pattern_count = 1;
        let result = detector.predict(&features, "b1").unwrap();

        assert!(result.is_anomaly);
        assert!(result.anomaly_score <= 0.0);
    }

    fn sample_features() -> BuildFeatures {
        BuildFeatures {
            build_id: "b1".into(),
            repo_name: "acme/widgets".into(),
            branch: "main".into(),
            commit_sha: "abc".into(),
            duration_seconds: 120.0,
            log_line_count: 100,
            char_density: 40.0,
            error_count: 0,
            warning_count: 0,
            step_count: 5,
            unique_templates: 20,
            template_entropy: 2.0,
            suspicious_pattern_count: 0,
            external_ip_count: 0,
            external_url_count: 0,
            base64_pattern_count: 0,
            provider: "github".into(),
            processed_at: Utc::now(),
        }
    }
}
