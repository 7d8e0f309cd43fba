#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backoff;
mod envelope;
mod errors;
mod heartbeat;
mod job_handler;
mod moat;
mod reaper;
mod runner;
/// Storage traits and backends.
pub mod store;
/// SLO supervisor, DLQ triage, and the synthetic API probe.
pub mod watchdog;
mod worker;

/// The retry backoff schedule.
pub use self::backoff::backoff;
/// The validated job message and its errors.
pub use self::envelope::{EnvelopeError, JobEnvelope};
/// Error types for enqueueing and storage.
pub use self::errors::{EnqueueError, StoreError};
/// The background liveness reporter.
pub use self::heartbeat::{HeartbeatHandle, HeartbeatReporter, heartbeat_channel};
/// The handler trait and dispatch registry.
pub use self::job_handler::{HandlerRegistry, JobHandler};
/// The batch-level ingestion claim client.
pub use self::moat::{
    ClaimOutcome, ImportCounts, ImportRun, ImportSpec, ImportStatus, MoatClient, Reconciliation,
};
/// The stale-lease reaper.
pub use self::reaper::Reaper;
/// The runner that orchestrates worker pools.
pub use self::runner::{Configured, Queue, RunHandle, Runner, Unconfigured};
/// Queue row types and outcomes.
pub use self::store::{
    DeadLetter, Enqueued, MessageStatus, NackOutcome, NewMessage, QueueMessage, ReapReport,
    WorkerHeartbeat, WorkerStatus,
};
/// The in-process store (tests, embedded use).
pub use self::store::memory::MemoryStore;
/// The Postgres store and its migration-driven setup.
pub use self::store::postgres::{PgStore, setup_database};
