//! Storage traits and row types for the queue, the processed-job registry,
//! the import ledger, and worker heartbeats.
//!
//! The relational engine is treated as a black box offering an atomic
//! "lock and skip already locked" claim primitive; [`postgres::PgStore`]
//! implements it with `FOR UPDATE SKIP LOCKED`, [`memory::MemoryStore`] with
//! a single mutex-guarded transition. Both back the same worker, reaper,
//! moat, and watchdog code through the traits below.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::envelope::JobEnvelope;
use crate::errors::{EnqueueError, StoreError};
use crate::moat::{ClaimOutcome, ImportCounts, ImportRun, ImportSpec};

/// Queue name used when none is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Default cap on delivery attempts before a message is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Lifecycle state of a queue message.
///
/// Successfully completed messages are deleted on ack, so no `completed`
/// state is ever observable in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting for a worker, eligible once `available_at` passes.
    Pending,
    /// Leased by exactly one worker.
    Processing,
    /// Dead-lettered: poison or retry-exhausted.
    Failed,
}

impl MessageStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::UnknownStatus {
                entity: "queue message",
                value: other.to_owned(),
            }),
        }
    }
}

/// A message row as read from the queue.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Storage-assigned message id.
    pub id: i64,
    /// Queue the message belongs to.
    pub queue: String,
    /// Handler dispatch key.
    pub job_type: String,
    /// Exactly-once key, denormalized from the envelope for indexing.
    pub idempotency_key: String,
    /// The raw envelope JSON. Validated by the worker, not the store.
    pub envelope: Value,
    /// Current lifecycle state.
    pub status: MessageStatus,
    /// Number of failed tries so far.
    pub attempts: i32,
    /// Cap on tries before dead-lettering.
    pub max_attempts: i32,
    /// Worker currently holding the lease, if any.
    pub worker_id: Option<String>,
    /// When the current lease began.
    pub started_at: Option<DateTime<Utc>>,
    /// Advisory lease expiry declared at claim time. The reaper's timeout is
    /// authoritative; this is recorded for operators inspecting stuck rows.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Earliest time the message may next be claimed.
    pub available_at: DateTime<Utc>,
    /// Most recent failure text, `[RECOVERED]`/`[DLQ]`-prefixed by the reaper.
    pub last_error: Option<String>,
    /// How many times the reaper reclaimed an abandoned lease on this row.
    pub reap_count: i32,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

/// A message to enqueue.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Destination queue.
    pub queue: String,
    /// Handler dispatch key.
    pub job_type: String,
    /// Exactly-once key, unique per job type.
    pub idempotency_key: String,
    /// Envelope JSON as it will be stored.
    pub envelope: Value,
    /// Cap on delivery attempts.
    pub max_attempts: i32,
    /// Earliest eligible claim time; `None` means immediately.
    pub available_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    /// Build a message from a validated envelope.
    ///
    /// The envelope is normalized via [`JobEnvelope::validate`] first, so the
    /// stored JSON and the denormalized key always agree.
    pub fn new(job_type: impl Into<String>, envelope: JobEnvelope) -> Result<Self, EnqueueError> {
        let envelope = envelope.validate()?;
        let idempotency_key = envelope.idempotency_key.clone();
        Ok(Self {
            queue: DEFAULT_QUEUE.to_owned(),
            job_type: job_type.into(),
            idempotency_key,
            envelope: serde_json::to_value(&envelope)?,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            available_at: None,
        })
    }

    /// Build a message from raw envelope JSON.
    ///
    /// For producers outside this crate (ETL pipelines writing rows through
    /// their own drivers). No validation happens here; the worker will
    /// dead-letter the message if the envelope turns out to be poison.
    pub fn from_raw(
        job_type: impl Into<String>,
        idempotency_key: impl Into<String>,
        envelope: Value,
    ) -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_owned(),
            job_type: job_type.into(),
            idempotency_key: idempotency_key.into(),
            envelope,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            available_at: None,
        }
    }

    /// Route to a queue other than [`DEFAULT_QUEUE`].
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Override the delivery-attempt cap.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Schedule the message instead of making it immediately eligible.
    #[must_use]
    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }
}

/// Result of an idempotent enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new message was written.
    Created(i64),
    /// A live message already owns the key; its id is returned.
    Existing(i64),
    /// The key was already processed to completion; nothing was written.
    Completed,
}

/// Result of a `nack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Rescheduled as `pending` with backoff applied.
    Retried {
        /// When the message becomes claimable again.
        available_at: DateTime<Utc>,
    },
    /// Attempts exhausted; the message moved to the dead-letter state.
    DeadLettered,
}

/// Outcome of one reaper pass.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    /// Messages requeued with a `[RECOVERED]` marker.
    pub recovered: Vec<i64>,
    /// Messages dead-lettered with a `[DLQ]` marker.
    pub dead_lettered: Vec<i64>,
}

impl ReapReport {
    /// True when the pass touched nothing.
    pub fn is_empty(&self) -> bool {
        self.recovered.is_empty() && self.dead_lettered.is_empty()
    }
}

/// A dead-lettered message as seen by the watchdog triage scan.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// Message id.
    pub id: i64,
    /// Handler dispatch key.
    pub job_type: String,
    /// Raw envelope JSON.
    pub envelope: Value,
    /// Failure text recorded when the message was dead-lettered.
    pub last_error: Option<String>,
}

/// Liveness state reported by a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// The worker loop is alive.
    Running,
    /// The worker hit a fault but is still reporting.
    Error,
    /// The worker shut down; final row.
    Stopped,
}

impl WorkerStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            other => Err(StoreError::UnknownStatus {
                entity: "worker heartbeat",
                value: other.to_owned(),
            }),
        }
    }
}

/// One worker's liveness row, upserted on `worker_id`.
#[derive(Debug, Clone)]
pub struct WorkerHeartbeat {
    /// Stable identity of the reporting process.
    pub worker_id: String,
    /// Role of the process (e.g. `queue-worker`, `importer`).
    pub worker_type: String,
    /// Host the process runs on.
    pub hostname: String,
    /// Last time the process checked in.
    pub last_heartbeat_at: DateTime<Utc>,
    /// Reported liveness state.
    pub status: WorkerStatus,
}

/// Durable message queue with atomic claim, retry, and lease recovery.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Insert a message, rejecting duplicates.
    ///
    /// Fails with [`EnqueueError::DuplicateIdempotencyKey`] when a live
    /// message or a processed-registry entry already owns the pair.
    async fn enqueue(&self, msg: &NewMessage) -> Result<i64, EnqueueError>;

    /// Insert a message, resolving duplicates to the existing job.
    ///
    /// This is the contract producers should default to: repeat enqueues are
    /// answered with [`Enqueued::Existing`] (live row) or
    /// [`Enqueued::Completed`] (already processed) and never create a second
    /// job.
    async fn enqueue_idempotent(&self, msg: &NewMessage) -> Result<Enqueued, EnqueueError>;

    /// Atomically lease the oldest eligible `pending` message.
    ///
    /// Eligibility: matching queue, `job_type` in `job_types` (an empty slice
    /// matches every type), `available_at` in the past. Order is
    /// `(available_at, id)` ascending across all eligible types. Concurrent
    /// claimers never receive the same row and never block each other.
    async fn claim(
        &self,
        queue: &str,
        job_types: &[String],
        lease: Duration,
        worker_id: &str,
    ) -> Result<Option<QueueMessage>, StoreError>;

    /// Delete a completed message.
    async fn ack(&self, id: i64) -> Result<(), StoreError>;

    /// Record a failed try: reschedule with backoff, or dead-letter once
    /// attempts are exhausted.
    async fn nack(&self, id: i64, error: &str) -> Result<NackOutcome, StoreError>;

    /// Dead-letter a message immediately, bypassing retries (poison path).
    async fn dead_letter(&self, id: i64, error: &str) -> Result<(), StoreError>;

    /// Atomically record the idempotency entry and ack the message.
    ///
    /// The success path of the worker commit. A concurrent replay may have
    /// inserted the registry entry first; that is fine, the ack proceeds
    /// either way.
    async fn commit(&self, id: i64, job_type: &str, idempotency_key: &str)
    -> Result<(), StoreError>;

    /// Reclaim `processing` rows whose lease started more than `lease_timeout`
    /// ago, using the same locking primitive as [`QueueStore::claim`] so the
    /// reaper and live workers never double-act on one row.
    async fn reap(&self, lease_timeout: Duration) -> Result<ReapReport, StoreError>;

    /// Insert into the processed-job registry. Returns `false` when the pair
    /// was already present.
    async fn mark_processed(&self, job_type: &str, idempotency_key: &str)
    -> Result<bool, StoreError>;

    /// Check the processed-job registry.
    async fn is_processed(&self, job_type: &str, idempotency_key: &str)
    -> Result<bool, StoreError>;

    /// Make a backed-off or dead-lettered message immediately claimable
    /// again (operator "retry now" action). Dead-lettered rows return to
    /// `pending` with their attempt budget intact.
    async fn retry_now(&self, id: i64) -> Result<(), StoreError>;

    /// Fetch a single message row, if it still exists.
    async fn message(&self, id: i64) -> Result<Option<QueueMessage>, StoreError>;

    /// Age of the oldest claimable `pending` message, or `None` when the
    /// queue head is empty.
    async fn oldest_pending_age(&self, queue: &str) -> Result<Option<Duration>, StoreError>;

    /// Number of dead-lettered messages in a queue.
    async fn dlq_depth(&self, queue: &str) -> Result<u64, StoreError>;

    /// Oldest `limit` dead-lettered messages for triage.
    async fn dlq_peek(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, StoreError>;
}

/// Batch-level ledger behind the ingestion moat.
#[async_trait]
pub trait ImportLedger: Send + Sync + 'static {
    /// Claim a batch identity, reclaiming stale runs older than
    /// `stale_after`. See [`crate::moat::MoatClient::claim`].
    async fn claim_import(
        &self,
        spec: &ImportSpec,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Refresh the staleness window; moves a `claimed` run to `processing`.
    async fn heartbeat_import(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Record terminal counts and mark the run `completed` or `failed`.
    async fn finalize_import(
        &self,
        run_id: Uuid,
        counts: &ImportCounts,
        error_details: Option<&str>,
        mark_completed: bool,
    ) -> Result<(), StoreError>;

    /// Flag the run `rolled_back` with a reason, preserving row data.
    async fn rollback_import(&self, run_id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Fetch a run by id.
    async fn import_run(&self, run_id: Uuid) -> Result<Option<ImportRun>, StoreError>;
}

/// Operational state consumed by the heartbeat reporter and the watchdog.
#[async_trait]
pub trait OpsStore: Send + Sync + 'static {
    /// Insert or refresh a worker's heartbeat row.
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError>;

    /// All heartbeat rows, ordered by worker id.
    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError>;
}
