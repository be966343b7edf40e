//! Route handlers, grouped the way `examples/original_source/services/
//! anomaly-detector/src/api.py` lays out its Flask/FastAPI routes: health,
//! model lifecycle, prediction, and results/stats/timeseries/queue
//! introspection.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::features::{BuildFeatures, FEATURE_NAMES};
use crate::model::{AnomalyResult, TrainingRecord};

use super::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/model/info", get(model_info))
        .route("/model/train", post(model_train))
        .route("/model/upload", post(model_upload))
        .route("/model/retrain-from-normal", post(model_retrain_from_normal))
        .route("/model/versions", get(model_versions))
        .route("/model/backup", post(model_backup))
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        .route("/results", get(get_results))
        .route("/results/:build_id", get(get_result_by_id))
        .route("/stats", get(get_stats))
        .route("/timeseries", get(get_timeseries))
        .route("/queue/info", get(queue_info))
        .route("/queue/process", post(queue_process))
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.into() })))
}

// ---- /health, /status, /model/info ----------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let model_loaded = state.detector.model().read().await.is_trained();
    Json(json!({
        "status": "ok",
        "model_loaded": model_loaded,
        "version": crate::VERSION,
        "git_hash": crate::GIT_HASH,
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let model = state.detector.model().read().await;
    let queue = state
        .detector
        .queue_info()
        .await
        .map_err(|e| err(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    Ok(Json(json!({
        "model": {
            "is_trained": model.is_trained(),
            "model_version": model.model_version(),
        },
        "queues": {
            "raw_logs": queue.0,
            "features": queue.1,
        },
        "parser_counts": state.parser.counts(),
        "detector_counts": state.detector.counts(),
    })))
}

async fn model_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let model = state.detector.model().read().await;
    Json(json!({
        "is_trained": model.is_trained(),
        "model_version": model.model_version(),
        "feature_names": FEATURE_NAMES,
        "config": model.config(),
        "training_stats": model.training_stats(),
    }))
}

// ---- /model/train, /model/upload, /model/retrain-from-normal ---------

#[derive(Debug, Deserialize)]
struct TrainRequest {
    csv_path: Option<String>,
}

async fn model_train(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TrainRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let path = match request.csv_path {
        Some(p) => std::path::PathBuf::from(p),
        None => return Err(err(StatusCode::BAD_REQUEST, "csv_path not provided and no default configured")),
    };
    if !path.exists() {
        return Err(err(StatusCode::NOT_FOUND, format!("{} not found", path.display())));
    }

    let mut model = state.detector.model().write().await;
    let stats = model
        .train_from_csv(&path)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({ "training_stats": stats })))
}

async fn model_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut csv_bytes: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| err(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        if field.name() == Some("file") {
            csv_bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| err(StatusCode::BAD_REQUEST, e.to_string()))?
                    .to_vec(),
            );
        }
    }

    let bytes = csv_bytes.ok_or_else(|| err(StatusCode::BAD_REQUEST, "no `file` field in multipart body"))?;

    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let headers = reader
        .headers()
        .map_err(|e| err(StatusCode::BAD_REQUEST, e.to_string()))?
        .clone();

    let provided: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let required: Vec<&str> = FEATURE_NAMES.to_vec();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| !provided.iter().any(|p| p == name))
        .collect();
    if !missing.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "required": required, "provided": provided, "missing": missing })),
        ));
    }

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result.map_err(|e| err(StatusCode::BAD_REQUEST, e.to_string()))?;
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

    let mut model = state.detector.model().write().await;
    let stats = model
        .train(&records)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({ "training_stats": stats })))
}

#[derive(Debug, Deserialize)]
struct RetrainRequest {
    min_samples: Option<usize>,
    hours: Option<i32>,
}

async fn model_retrain_from_normal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RetrainRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let min_samples = request.min_samples.unwrap_or(100);
    let hours = request.hours.unwrap_or(168);

    let raw_features = state
        .detector
        .timeseries()
        .get_normal_builds_for_training(hours)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if raw_features.len() < min_samples {
        return Err(err(
            StatusCode::BAD_REQUEST,
            format!(
                "insufficient history: found {} normal builds, need at least {min_samples}",
                raw_features.len()
            ),
        ));
    }

    let records: Vec<TrainingRecord> = raw_features
        .iter()
        .filter_map(|v| {
            let features: HashMap<String, f64> = FEATURE_NAMES
                .iter()
                .filter_map(|&name| v.get(name).and_then(Value::as_f64).map(|val| (name.to_string(), val)))
                .collect();
            if features.is_empty() {
                None
            } else {
                Some(TrainingRecord { features, label: None })
            }
        })
        .collect();

    let mut model = state.detector.model().write().await;
    let stats = model
        .train(&records)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({ "training_stats": stats })))
}

async fn model_versions(State(state): State<Arc<AppState>>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let versions = crate::model::persistence::list_versions(&state.model_dir)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "versions": versions })))
}

async fn model_backup(State(state): State<Arc<AppState>>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let model = state.detector.model().read().await;
    if !model.is_trained() {
        return Err(err(StatusCode::BAD_REQUEST, "model is not trained, nothing to back up"));
    }
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let backup_path = crate::model::persistence::backup(model.model_path(), &state.backups_dir, &timestamp)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "backup_path": backup_path.to_string_lossy() })))
}

// ---- /predict, /predict/batch -----------------------------------------

/// The numeric + identifying feature fields a caller supplies for a scoring
/// request; `build_id` and `processed_at` are filled in by the handler.
#[derive(Debug, Deserialize)]
struct PredictFeaturesInput {
    #[serde(default)]
    repo_name: String,
    #[serde(default)]
    branch: String,
    #[serde(default)]
    commit_sha: String,
    duration_seconds: f64,
    log_line_count: u32,
    char_density: f64,
    error_count: u32,
    warning_count: u32,
    step_count: u32,
    unique_templates: u32,
    template_entropy: f64,
    suspicious_pattern_count: u32,
    external_ip_count: u32,
    external_url_count: u32,
    base64_pattern_count: u32,
    #[serde(default)]
    provider: String,
}

impl PredictFeaturesInput {
    fn into_features(self, build_id: String) -> BuildFeatures {
        BuildFeatures {
            build_id,
            repo_name: self.repo_name,
            branch: self.branch,
            commit_sha: self.commit_sha,
            duration_seconds: self.duration_seconds,
            log_line_count: self.log_line_count,
            char_density: self.char_density,
            error_count: self.error_count,
            warning_count: self.warning_count,
            step_count: self.step_count,
            unique_templates: self.unique_templates,
            template_entropy: self.template_entropy,
            suspicious_pattern_count: self.suspicious_pattern_count,
            external_ip_count: self.external_ip_count,
            external_url_count: self.external_url_count,
            base64_pattern_count: self.base64_pattern_count,
            provider: self.provider,
            processed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    build_id: String,
    features: PredictFeaturesInput,
    #[serde(default = "default_true")]
    save: bool,
}

fn default_true() -> bool {
    true
}

async fn predict(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<AnomalyResult>, (StatusCode, Json<Value>)> {
    let model = state.detector.model().read().await;
    if !model.is_trained() {
        return Err(err(StatusCode::SERVICE_UNAVAILABLE, "model is not trained"));
    }

    let features = request.features.into_features(request.build_id.clone());
    let result = model
        .predict(&features, &request.build_id)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if request.save {
        let raw_features = serde_json::to_value(&features)
            .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        state
            .detector
            .timeseries()
            .save_anomaly_result(&result, &raw_features)
            .await
            .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    }

    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct PredictBatchItem {
    build_id: String,
    features: PredictFeaturesInput,
}

#[derive(Debug, Deserialize)]
struct PredictBatchRequest {
    builds: Vec<PredictBatchItem>,
}

async fn predict_batch(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PredictBatchRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let model = state.detector.model().read().await;
    if !model.is_trained() {
        return Err(err(StatusCode::SERVICE_UNAVAILABLE, "model is not trained"));
    }

    let mut results = Vec::with_capacity(request.builds.len());
    let mut anomalies = 0;
    for item in request.builds {
        let features = item.features.into_features(item.build_id.clone());
        let result = model
            .predict(&features, &item.build_id)
            .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        if result.is_anomaly {
            anomalies += 1;
        }
        results.push(result);
    }

    Ok(Json(json!({
        "total": results.len(),
        "anomalies": anomalies,
        "results": results,
    })))
}

// ---- /results, /results/:build_id, /stats, /timeseries -----------------

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    limit: Option<i64>,
    anomalies_only: Option<bool>,
}

async fn get_results(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let results = state
        .detector
        .timeseries()
        .get_results(query.limit.unwrap_or(100), query.anomalies_only.unwrap_or(false))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "results": results })))
}

async fn get_result_by_id(
    State(state): State<Arc<AppState>>,
    Path(build_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let result = state
        .detector
        .timeseries()
        .get_result_by_build_id(&build_id)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    match result {
        Some(r) => Ok(Json(json!(r))),
        None => Err(err(StatusCode::NOT_FOUND, format!("no result for build {build_id}"))),
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    hours: Option<i32>,
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let stats = state
        .detector
        .timeseries()
        .get_stats(query.hours.unwrap_or(24))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!(stats)))
}

#[derive(Debug, Deserialize)]
struct TimeseriesQuery {
    hours: Option<i32>,
    interval: Option<String>,
}

async fn get_timeseries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimeseriesQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let interval = query.interval.unwrap_or_else(|| "1 hour".to_string());
    let buckets = state
        .detector
        .timeseries()
        .get_timeseries(query.hours.unwrap_or(24), &interval)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "buckets": buckets })))
}

// ---- /queue/info, /queue/process ---------------------------------------

async fn queue_info(State(state): State<Arc<AppState>>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let (raw_logs, features) = state
        .detector
        .queue_info()
        .await
        .map_err(|e| err(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(json!({ "raw_logs": raw_logs, "features": features })))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CountSpec {
    Count(usize),
    All(String),
}

#[derive(Debug, Deserialize)]
struct QueueProcessRequest {
    count: CountSpec,
}

#[derive(Debug, Serialize)]
struct QueueProcessResponse {
    raw_logs_processed: usize,
    features_processed: usize,
}

async fn queue_process(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueueProcessRequest>,
) -> Result<Json<QueueProcessResponse>, (StatusCode, Json<Value>)> {
    let raw_logs_processed = match &request.count {
        CountSpec::All(_) => state
            .parser
            .process_all_pending()
            .await
            .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
        CountSpec::Count(n) => {
            let mut done = 0;
            for _ in 0..*n {
                if !state
                    .parser
                    .process_one()
                    .await
                    .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
                {
                    break;
                }
                done += 1;
            }
            done
        }
    };

    let features_processed = match &request.count {
        CountSpec::All(_) => state
            .detector
            .process_all_pending()
            .await
            .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?,
        CountSpec::Count(n) => {
            let mut done = 0;
            for _ in 0..*n {
                if !state
                    .detector
                    .process_one()
                    .await
                    .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
                {
                    break;
                }
                done += 1;
            }
            done
        }
    };

    Ok(Json(QueueProcessResponse {
        raw_logs_processed,
        features_processed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_spec_parses_numeric_and_all() {
        let numeric: CountSpec = serde_json::from_str("5").unwrap();
        assert!(matches!(numeric, CountSpec::Count(5)));

        let all: CountSpec = serde_json::from_str("\"all\"").unwrap();
        assert!(matches!(all, CountSpec::All(s) if s == "all"));
    }
}
