//! On-disk model artifact: `(forest, scaler, metadata)` as three sibling
//! JSON files, written atomically (temp file + rename) so a crash mid-save
//! never leaves a half-written model on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::model::forest::{ForestConfig, IsolationForest};
use crate::model::scaler::StandardScaler;

/// Current on-disk metadata schema version. Bumped whenever the forest or
/// scaler serialization shape changes incompatibly.
pub const METADATA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStats {
    pub n_samples: usize,
    pub anomaly_ratio: f64,
    pub feature_means: HashMap<String, f64>,
    pub feature_stds: HashMap<String, f64>,
    pub score_mean: f64,
    pub score_std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub version: String,
    pub trained_at: DateTime<Utc>,
    pub feature_names: Vec<String>,
    pub training_stats: TrainingStats,
    pub config: ForestConfig,
}

/// Paths to the three sidecar files derived from a single base path, e.g.
/// `model` → `model.forest.json`, `model.scaler.json`, `model.meta.json`.
pub struct ArtifactPaths {
    pub forest: PathBuf,
    pub scaler: PathBuf,
    pub meta: PathBuf,
}

impl ArtifactPaths {
    pub fn from_base(base: &Path) -> Self {
        Self {
            forest: with_suffix(base, "forest.json"),
            scaler: with_suffix(base, "scaler.json"),
            meta: with_suffix(base, "meta.json"),
        }
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push('.');
    name.push_str(suffix);
    base.with_file_name(name)
}

/// Write `value` to `path` as pretty JSON via a temp-file-then-rename swap,
/// so readers never observe a partially-written file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json")
    ));
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Atomically persist the forest/scaler/metadata triple under `base`.
pub fn save(
    base: &Path,
    forest: &IsolationForest,
    scaler: &StandardScaler,
    metadata: &ModelMetadata,
) -> Result<()> {
    let paths = ArtifactPaths::from_base(base);
    atomic_write_json(&paths.forest, forest)?;
    atomic_write_json(&paths.scaler, scaler)?;
    atomic_write_json(&paths.meta, metadata)?;
    Ok(())
}

/// Load the forest/scaler/metadata triple from `base`, refusing a
/// metadata version this build doesn't recognize. Returns `Ok(None)` if no
/// artifact exists yet (not an error — lazy bootstrap handles this).
pub fn load(
    base: &Path,
) -> Result<Option<(IsolationForest, StandardScaler, ModelMetadata)>> {
    let paths = ArtifactPaths::from_base(base);
    if !paths.meta.exists() || !paths.forest.exists() || !paths.scaler.exists() {
        return Ok(None);
    }

    let metadata: ModelMetadata = read_json(&paths.meta)?;
    if metadata.version != METADATA_VERSION {
        return Err(PipelineError::ModelVersionMismatch {
            on_disk: metadata.version,
            expected: METADATA_VERSION.to_string(),
        });
    }

    let forest: IsolationForest = read_json(&paths.forest)?;
    let scaler: StandardScaler = read_json(&paths.scaler)?;
    Ok(Some((forest, scaler, metadata)))
}

/// Copy the current artifact triple into `backups_dir` under a timestamped
/// file set, for the `POST /model/backup` operation.
pub fn backup(base: &Path, backups_dir: &Path, timestamp: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(backups_dir)?;
    let paths = ArtifactPaths::from_base(base);
    let backup_base = backups_dir.join(format!(
        "{}-{timestamp}",
        base.file_name().unwrap_or_default().to_string_lossy()
    ));
    let backup_paths = ArtifactPaths::from_base(&backup_base);

    std::fs::copy(&paths.forest, &backup_paths.forest)?;
    std::fs::copy(&paths.scaler, &backup_paths.scaler)?;
    std::fs::copy(&paths.meta, &backup_paths.meta)?;

    Ok(backup_base)
}

/// List model metadata sidecars in `model_dir`, for `GET /model/versions`.
pub fn list_versions(model_dir: &Path) -> Result<Vec<ModelMetadata>> {
    let mut out = Vec::new();
    if !model_dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(model_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.to_string_lossy().ends_with(".meta.json") {
            if let Ok(meta) = read_json::<ModelMetadata>(&path) {
                out.push(meta);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::forest::ForestConfig;
    use tempfile::tempdir;

    fn sample_metadata() -> ModelMetadata {
        ModelMetadata {
            version: METADATA_VERSION.to_string(),
            trained_at: Utc::now(),
            feature_names: vec!["duration_seconds".to_string()],
            training_stats: TrainingStats {
                n_samples: 10,
                anomaly_ratio: 0.05,
                feature_means: HashMap::new(),
                feature_stds: HashMap::new(),
                score_mean: 0.0,
                score_std: 0.0,
            },
            config: ForestConfig::default(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("model");

        let data = vec![[1.0; 12], [2.0; 12], [3.0; 12]];
        let forest = IsolationForest::fit(&data, ForestConfig::default());
        let scaler = StandardScaler::fit(&data);
        let metadata = sample_metadata();

        save(&base, &forest, &scaler, &metadata).unwrap();
        let (loaded_forest, _scaler, loaded_meta) = load(&base).unwrap().unwrap();

        assert_eq!(loaded_meta.version, METADATA_VERSION);
        let probe = [1.0; 12];
        assert_eq!(
            forest.decision_function(&probe),
            loaded_forest.decision_function(&probe)
        );
    }

    #[test]
    fn missing_artifact_returns_none() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("missing");
        assert!(load(&base).unwrap().is_none());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("model");

        let data = vec![[1.0; 12]];
        let forest = IsolationForest::fit(&data, ForestConfig::default());
        let scaler = StandardScaler::fit(&data);
        let mut metadata = sample_metadata();
        metadata.version = "0.0.1".to_string();

        save(&base, &forest, &scaler, &metadata).unwrap();
        assert!(matches!(
            load(&base),
            Err(PipelineError::ModelVersionMismatch { .. })
        ));
    }
}
