use thiserror::Error;
use uuid::Uuid;

/// Error type for job enqueueing operations.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// A live message or a processed-registry entry already owns this
    /// `(job_type, idempotency_key)` pair.
    #[error("a job with this (job_type, idempotency_key) already exists")]
    DuplicateIdempotencyKey,

    /// The envelope failed validation before it ever reached the store.
    #[error(transparent)]
    Envelope(#[from] crate::envelope::EnvelopeError),

    /// The envelope could not be serialized to JSON.
    #[error("failed to serialize envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage layer rejected the write.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the queue, import-ledger, and ops store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A status column held a value outside the known lifecycle.
    #[error("unknown {entity} status `{value}`")]
    UnknownStatus {
        /// Which entity carried the bad status.
        entity: &'static str,
        /// The raw value read from storage.
        value: String,
    },

    /// The referenced queue message does not exist.
    #[error("queue message {0} not found")]
    MessageNotFound(i64),

    /// The referenced import run does not exist.
    #[error("import run {0} not found")]
    ImportRunNotFound(Uuid),
}
