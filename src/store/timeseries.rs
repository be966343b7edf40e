//! Timeseries store (PostgreSQL/TimescaleDB via `sqlx`): `build_metrics` and
//! `anomaly_results`, time-partitioned, backing `/results*`, `/stats`, and
//! `/timeseries`.
//!
//! Query checking is runtime (`sqlx::query`, not the `query!` macro) since
//! the schema is managed by this crate's own migration statements at
//! startup rather than a `DATABASE_URL`-backed compile-time check.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::Result;
use crate::features::BuildFeatures;
use crate::model::AnomalyResult;

pub struct TimeseriesStore {
    pool: PgPool,
}

impl TimeseriesStore {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await?;
        let store = Self { pool };
        store.ensure_tables().await?;
        Ok(store)
    }

    /// Create tables/indexes if absent, matching the column list and
    /// indexes the query layer below relies on. Idempotent — safe to call on every
    /// worker startup.
    async fn ensure_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS build_metrics (
                id BIGSERIAL PRIMARY KEY,
                build_id VARCHAR(255) NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                repo_name VARCHAR(255),
                branch VARCHAR(255),
                commit_sha VARCHAR(64),
                provider VARCHAR(32),
                feature_vector JSONB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anomaly_results (
                id BIGSERIAL,
                build_id VARCHAR(255) NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                is_anomaly BOOLEAN NOT NULL,
                anomaly_score DOUBLE PRECISION NOT NULL,
                prediction INTEGER NOT NULL,
                confidence DOUBLE PRECISION NOT NULL DEFAULT 0.0,
                anomaly_reasons JSONB,
                top_features JSONB,
                model_version VARCHAR(50),
                raw_features JSONB,
                PRIMARY KEY (id, timestamp)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_anomaly_results_build_id ON anomaly_results (build_id);",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_anomaly_results_is_anomaly ON anomaly_results (is_anomaly) WHERE is_anomaly = TRUE;",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a `build_metrics` row for the Parser Worker's step 4
    /// each time a build is parsed.
    pub async fn insert_build_metrics(&self, features: &BuildFeatures) -> Result<()> {
        let vector = serde_json::to_value(features.to_feature_vector())?;
        sqlx::query(
            "INSERT INTO build_metrics (build_id, repo_name, branch, commit_sha, provider, feature_vector) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&features.build_id)
        .bind(&features.repo_name)
        .bind(&features.branch)
        .bind(&features.commit_sha)
        .bind(&features.provider)
        .bind(vector)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert an `AnomalyResult` row plus the raw feature dict that fed it,
    /// so `get_normal_builds_for_training` can rebuild a training set later.
    /// Inserting twice for the same `build_id` is allowed —
    /// this is an insert, never an upsert.
    pub async fn save_anomaly_result(
        &self,
        result: &AnomalyResult,
        raw_features: &Value,
    ) -> Result<i64> {
        let reasons = serde_json::to_value(&result.anomaly_reasons)?;
        let top_features = serde_json::to_value(&result.top_contributing_features)?;

        let row = sqlx::query(
            r#"
            INSERT INTO anomaly_results (
                build_id, timestamp, is_anomaly, anomaly_score, prediction,
                confidence, anomaly_reasons, top_features, model_version, raw_features
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(&result.build_id)
        .bind(result.processed_at)
        .bind(result.is_anomaly)
        .bind(result.anomaly_score)
        .bind(result.prediction)
        .bind(result.confidence)
        .bind(reasons)
        .bind(top_features)
        .bind(&result.model_version)
        .bind(raw_features)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    pub async fn get_results(&self, limit: i64, anomalies_only: bool) -> Result<Vec<StoredResult>> {
        let rows = if anomalies_only {
            sqlx::query_as::<_, StoredResult>(
                "SELECT id, build_id, timestamp, is_anomaly, anomaly_score, prediction, confidence, anomaly_reasons, top_features, model_version FROM anomaly_results WHERE is_anomaly = TRUE ORDER BY timestamp DESC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, StoredResult>(
                "SELECT id, build_id, timestamp, is_anomaly, anomaly_score, prediction, confidence, anomaly_reasons, top_features, model_version FROM anomaly_results ORDER BY timestamp DESC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows)
    }

    /// Latest-by-timestamp result for a build (the point-query
    /// tie-break rule).
    pub async fn get_result_by_build_id(&self, build_id: &str) -> Result<Option<StoredResult>> {
        let row = sqlx::query_as::<_, StoredResult>(
            "SELECT id, build_id, timestamp, is_anomaly, anomaly_score, prediction, confidence, anomaly_reasons, top_features, model_version FROM anomaly_results WHERE build_id = $1 ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(build_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn get_stats(&self, hours: i32) -> Result<Stats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total_builds,
                COUNT(*) FILTER (WHERE is_anomaly = TRUE) as total_anomalies,
                AVG(anomaly_score) as avg_score,
                MIN(anomaly_score) as min_score,
                MAX(anomaly_score) as max_score,
                AVG(confidence) as avg_confidence
            FROM anomaly_results
            WHERE timestamp > NOW() - ($1 || ' hours')::interval
            "#,
        )
        .bind(hours.to_string())
        .fetch_one(&self.pool)
        .await?;

        let total_builds: i64 = row.try_get("total_builds")?;
        let total_anomalies: i64 = row.try_get("total_anomalies")?;
        let anomaly_rate = if total_builds > 0 {
            total_anomalies as f64 / total_builds as f64
        } else {
            0.0
        };

        Ok(Stats {
            total_builds,
            total_anomalies,
            anomaly_rate,
            avg_score: row.try_get::<Option<f64>, _>("avg_score")?.unwrap_or(0.0),
            min_score: row.try_get::<Option<f64>, _>("min_score")?.unwrap_or(0.0),
            max_score: row.try_get::<Option<f64>, _>("max_score")?.unwrap_or(0.0),
            avg_confidence: row
                .try_get::<Option<f64>, _>("avg_confidence")?
                .unwrap_or(0.0),
        })
    }

    /// Time-bucketed counts/scores for `/timeseries`. `interval` is a
    /// Postgres interval literal (e.g. `"1 hour"`).
    pub async fn get_timeseries(&self, hours: i32, interval: &str) -> Result<Vec<TimeseriesBucket>> {
        let rows = sqlx::query(
            r#"
            SELECT
                date_bin($2::interval, timestamp, TIMESTAMPTZ 'epoch') as bucket,
                COUNT(*) as total_builds,
                COUNT(*) FILTER (WHERE is_anomaly = TRUE) as anomalies,
                AVG(anomaly_score) as avg_score
            FROM anomaly_results
            WHERE timestamp > NOW() - ($1 || ' hours')::interval
            GROUP BY bucket
            ORDER BY bucket
            "#,
        )
        .bind(hours.to_string())
        .bind(interval)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TimeseriesBucket {
                    time: row.try_get("bucket")?,
                    total_builds: row.try_get("total_builds")?,
                    anomalies: row.try_get("anomalies")?,
                    avg_score: row.try_get::<Option<f64>, _>("avg_score")?.unwrap_or(0.0),
                })
            })
            .collect()
    }

    /// Normal-labeled historical builds within `hours`, for the retrain-
    /// from-normal maintenance operation.
    pub async fn get_normal_builds_for_training(&self, hours: i32) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            r#"
            SELECT raw_features
            FROM anomaly_results
            WHERE is_anomaly = FALSE
              AND raw_features IS NOT NULL
              AND timestamp > NOW() - ($1 || ' hours')::interval
            ORDER BY timestamp DESC
            "#,
        )
        .bind(hours.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(row.try_get::<Value, _>("raw_features")?))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredResult {
    pub id: i64,
    pub build_id: String,
    pub timestamp: DateTime<Utc>,
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    pub prediction: i32,
    pub confidence: f64,
    pub anomaly_reasons: Option<Value>,
    pub top_features: Option<Value>,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub total_builds: i64,
    pub total_anomalies: i64,
    pub anomaly_rate: f64,
    pub avg_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeseriesBucket {
    pub time: DateTime<Utc>,
    pub total_builds: i64,
    pub anomalies: i64,
    pub avg_score: f64,
}
