//! # Error Handling Module
//!
//! Crate-wide error type for the CI anomaly pipeline. Categories mirror
//! transient (broker/db), malformed input, contract violation,
//! and internal errors. Queue and HTTP layers inspect `PipelineError` to
//! decide ack/nack and status-code behavior.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// I/O related errors (model artifact read/write, config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed message body — ack-and-drop, never requeue.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Queue broker connectivity or protocol errors — retried with backoff.
    #[error("Queue error: {0}")]
    Queue(#[from] lapin::Error),

    /// Document store (MongoDB) errors.
    #[error("Document store error: {0}")]
    DocumentStore(#[from] mongodb::error::Error),

    /// Timeseries store (Postgres) errors.
    #[error("Timeseries store error: {0}")]
    TimeseriesStore(#[from] sqlx::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Caller asked for a model operation that needs a trained model.
    #[error("Model not trained: {0}")]
    ModelNotTrained(String),

    /// Training data missing, malformed, or insufficient.
    #[error("Training data error: {0}")]
    TrainingData(String),

    /// Model artifact on disk has a metadata version this build doesn't
    /// understand.
    #[error("Model artifact version mismatch: on-disk {on_disk}, expected {expected}")]
    ModelVersionMismatch { on_disk: String, expected: String },

    /// Configuration errors (missing/invalid environment variables).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal errors — logged with context, never poison a queue.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedInput(message.into())
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    pub fn training_data<S: Into<String>>(message: S) -> Self {
        Self::TrainingData(message.into())
    }

    /// True if this error category should be retried (nack + requeue)
    /// rather than dropped.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Queue(_)
                | PipelineError::DocumentStore(_)
                | PipelineError::TimeseriesStore(_)
                | PipelineError::Io(_)
        )
    }
}
