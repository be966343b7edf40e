//! Parser Worker: `raw_logs` → Drain + feature extraction → `features`
//! queue.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::drain::{DrainConfig, DrainParser};
use crate::error::{PipelineError, Result};
use crate::features::{FeatureExtractor, RawBuild, SuspiciousPatternConfig};
use crate::queue::{next_delivery, QueueClient};
use crate::store::{DocumentStore, TimeseriesStore};

/// Snapshot of messages handled since process start, for `GET /status`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct WorkerCounts {
    pub processed: u64,
    pub dropped: u64,
    pub requeued: u64,
}

pub struct ParserWorker {
    queue: QueueClient,
    docs: DocumentStore,
    timeseries: TimeseriesStore,
    drain: Mutex<DrainParser>,
    extractor: FeatureExtractor,
    raw_logs_queue: String,
    features_queue: String,
    processed: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
}

impl ParserWorker {
    pub fn new(
        queue: QueueClient,
        docs: DocumentStore,
        timeseries: TimeseriesStore,
        drain_config: DrainConfig,
        suspicious_config: SuspiciousPatternConfig,
        raw_logs_queue: String,
        features_queue: String,
    ) -> Self {
        Self {
            queue,
            docs,
            timeseries,
            drain: Mutex::new(DrainParser::new(drain_config)),
            extractor: FeatureExtractor::new(suspicious_config),
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

    /// Connect to the broker and declare the consume side. Takes `&mut
    /// self` because connection setup needs exclusive access; callers run
    /// this once before wrapping the worker in an `Arc` to share with the
    /// HTTP API (everything else here is already `&self`).
    pub async fn connect(&mut self) -> Result<()> {
        self.queue.connect(&self.raw_logs_queue).await
    }

    /// Process `raw_logs` forever. Shareable behind `Arc` once connected —
    /// every delivery is handled through the `&self` ack/nack path.
    pub async fn serve(&self) -> Result<()> {
        let mut consumer = self
            .queue
            .consume(&self.raw_logs_queue, "parser-worker")
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

    /// Manually drain a single pending message (backs `POST /queue/process`).
    /// Returns `false` if the queue was empty.
    pub async fn process_one(&self) -> Result<bool> {
        match self.queue.get_one(&self.raw_logs_queue).await? {
            Some(msg) => {
                self.finish_delivery(msg.delivery.delivery_tag, &msg.delivery.data)
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drain every currently-pending message, returning how many were
    /// handled (each is acked or nacked, never left pending).
    pub async fn process_all_pending(&self) -> Result<usize> {
        let mut count = 0;
        while self.process_one().await? {
            count += 1;
        }
        Ok(count)
    }

    async fn finish_delivery(&self, delivery_tag: u64, body: &[u8]) -> Result<()> {
        match self.handle_message(body).await {
            Ok(()) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.queue.ack(delivery_tag).await
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient failure in parser worker, requeueing");
                self.requeued.fetch_add(1, Ordering::Relaxed);
                self.queue.nack(delivery_tag, true).await
            }
            Err(e) => {
                warn!(error = %e, "dropping malformed raw_logs message");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.queue.ack(delivery_tag).await
            }
        }
    }

    async fn handle_message(&self, body: &[u8]) -> Result<()> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| PipelineError::malformed(format!("invalid JSON: {e}")))?;

        let meta = payload.get("_meta").cloned().unwrap_or(Value::Null);
        let request_id = meta
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mongo_id = meta.get("mongo_id").and_then(Value::as_str).map(String::from);

        let raw = RawBuild::from_payload(&payload);
        if raw.build_id.is_empty() {
            return Err(PipelineError::malformed("raw_logs message has no build id"));
        }

        let (features, parse_results) = {
            let mut drain = self.drain.lock().await;
            self.extractor.extract(&raw, &mut drain)
        };

        self.docs
            .insert_parsed_log(&raw.build_id, &parse_results, &features)
            .await?;
        if let Some(id) = &mongo_id {
            self.docs.mark_raw_log_processed(id).await?;
        }

        self.timeseries.insert_build_metrics(&features).await?;

        let feature_vector = features.to_feature_vector();
        let feature_names = crate::features::FEATURE_NAMES;
        let outgoing = json!({
            "_meta": {
                "request_id": request_id,
                "mongo_id": mongo_id,
                "source": "log-parser",
                "processed_at": chrono::Utc::now().to_rfc3339(),
            },
            "features": features,
            "feature_vector": feature_vector,
            "feature_names": feature_names,
        });
        let body = serde_json::to_vec(&outgoing)?;
        self.queue.publish(&self.features_queue, &body).await?;

        info!(build_id = %raw.build_id, "parsed build and published features");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_is_classified_as_not_transient() {
        let err = PipelineError::malformed("bad json");
        assert!(!err.is_transient());
    }
}
