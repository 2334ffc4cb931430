use common_redis::CustomRedisError;
use thiserror::Error;

/// Failure taxonomy for the pipeline.
///
/// Per-message failures (corrupt, validation, enrichment, persistence,
/// retries exhausted) are contained to that message: the worker loops
/// classify them and route the message to the retry or dead-letter stream.
/// `BackendUnavailable` is the only variant a caller is expected to see
/// from publish/consume paths, and it means delivery failed, not that the
/// caller's own record was lost.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("corrupt message {id}: checksum mismatch")]
    CorruptMessage { id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("enrichment failed: {0}")]
    Enrichment(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("streaming backend unavailable: {0}")]
    BackendUnavailable(#[from] CustomRedisError),

    #[error("max retries exceeded after {retries} attempts")]
    MaxRetriesExceeded { retries: u32 },

    #[error("could not serialize envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}
