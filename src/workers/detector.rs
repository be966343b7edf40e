//! Detector Worker: `features` → Isolation Forest scoring → persisted
//! `AnomalyResult`. Holds the single in-memory model
//! instance behind a read/write guard so outstanding predictions never
//! observe a half-loaded model.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::model::{AnomalyDetector, DetectorConfig};
use crate::queue::{next_delivery, QueueClient, QueueInfo};
use crate::store::TimeseriesStore;
use crate::workers::parser::WorkerCounts;

pub struct DetectorWorker {
    queue: QueueClient,
    timeseries: TimeseriesStore,
    model: RwLock<AnomalyDetector>,
    training_data_path: Option<PathBuf>,
    raw_logs_queue: String,
    features_queue: String,
    processed: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
}

impl DetectorWorker {
    pub fn new(
        queue: QueueClient,
        timeseries: TimeseriesStore,
        config: DetectorConfig,
        model_path: PathBuf,
        training_data_path: Option<PathBuf>,
        raw_logs_queue: String,
        features_queue: String,
    ) -> Self {
        Self {
            queue,
            timeseries,
            model: RwLock::new(AnomalyDetector::new(config, model_path)),
            training_data_path,
            raw_logs_queue,
            features_queue,
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }

    pub fn counts(&self) -> WorkerCounts {
        WorkerCounts {
            processed: self.processed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }

    /// Connect to the broker and lazily bootstrap the model. Takes `&mut
    /// self`; callers run this once before wrapping the worker in an `Arc`
    /// to share with the HTTP API.
    pub async fn connect(&mut self) -> Result<()> {
        self.queue.connect(&self.features_queue).await?;
        self.bootstrap_model().await?;
        Ok(())
    }

    /// Process `features` forever. Shareable behind `Arc` once connected.
    pub async fn serve(&self) -> Result<()> {
        let mut consumer = self
            .queue
            .consume(&self.features_queue, "detector-worker")
            .await?;

        loop {
            match next_delivery(&mut consumer).await {
                Some(Ok(delivery)) => {
                    self.finish_delivery(delivery.delivery_tag, &delivery.data)
                        .await?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }

    /// Bootstrap the model without establishing the queue connection —
    /// used by API-only mode, which never consumes `features`.
    pub async fn bootstrap_model_only(&self) -> Result<()> {
        self.bootstrap_model().await
    }

    pub async fn process_one(&self) -> Result<bool> {
        match self.queue.get_one(&self.features_queue).await? {
            Some(msg) => {
                self.finish_delivery(msg.delivery.delivery_tag, &msg.delivery.data)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn process_all_pending(&self) -> Result<usize> {
        let mut count = 0;
        while self.process_one().await? {
            count += 1;
        }
        Ok(count)
    }

    /// Load a model from disk if present; otherwise, if a training CSV is
    /// configured, train from it so the worker never serves cold.
    async fn bootstrap_model(&self) -> Result<()> {
        let already_loaded = {
            let mut guard = self.model.write().await;
            guard.load_if_present()?
        };
        if already_loaded {
            info!("loaded persisted model");
            return Ok(());
        }

        if let Some(path) = self.training_data_path.clone() {
            let mut guard = self.model.write().await;
            let stats = guard.train_from_csv(&path)?;
            info!(n_samples = stats.n_samples, "bootstrapped model from training CSV");
        } else {
            warn!("no persisted model and no training data configured; serving untrained until first train call");
        }
        Ok(())
    }

    async fn finish_delivery(&self, delivery_tag: u64, body: &[u8]) -> Result<()> {
        match self.handle_message(body).await {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.queue.ack(delivery_tag).await
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient failure in detector worker, requeueing");
                self.requeued.fetch_add(1, Ordering::Relaxed);
                self.queue.nack(delivery_tag, true).await
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed features message");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.queue.ack(delivery_tag).await
            }
        }
    }

    async fn handle_message(&self, body: &[u8]) -> Result<()> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| PipelineError::malformed(format!("invalid JSON: {e}")))?;

        let features_value = payload
            .get("features")
            .cloned()
            .ok_or_else(|| PipelineError::malformed("features message missing `features`"))?;
        let features: crate::features::BuildFeatures = serde_json::from_value(features_value)
            .map_err(|e| PipelineError::malformed(format!("invalid feature dict: {e}")))?;

        let raw_features = serde_json::to_value(&features)?;
        let build_id = features.build_id.clone();

        let result = {
            let guard = self.model.read().await;
            guard.predict(&features, &build_id)?
        };

        self.timeseries
            .save_anomaly_result(&result, &raw_features)
            .await?;

        info!(
            build_id = %build_id,
            is_anomaly = result.is_anomaly,
            score = result.anomaly_score,
            "scored build"
        );
        Ok(())
    }

    pub fn model(&self) -> &RwLock<AnomalyDetector> {
        &self.model
    }

    pub fn timeseries(&self) -> &TimeseriesStore {
        &self.timeseries
    }

    /// Passive introspection of either queue, for `GET /queue/info`.
    pub async fn queue_info(&self) -> Result<(QueueInfo, QueueInfo)> {
        let raw_logs = self.queue.queue_info(&self.raw_logs_queue).await?;
        let features = self.queue.queue_info(&self.features_queue).await?;
        Ok((raw_logs, features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_not_trained_is_classified_as_not_transient() {
        let err = PipelineError::ModelNotTrained("no model".into());
        assert!(!err.is_transient());
    }
}
