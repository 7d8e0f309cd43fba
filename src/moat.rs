//! Ingestion claim client ("moat").
//!
//! Batch-level exactly-once coordination for whole-file imports, layered
//! above message-level idempotency. A batch is identified by the
//! `(source_system, source_batch_id, file_hash)` triple; at most one
//! non-stale run may hold it at a time, and a completed run makes every
//! later claim a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::store::ImportLedger;

/// Staleness threshold after which an abandoned run is reclaimable.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Lifecycle state of an import run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    /// Claimed, import not started yet.
    Claimed,
    /// Import underway; heartbeats keep the claim fresh.
    Processing,
    /// Finished successfully. Later claims for the triple return duplicate.
    Completed,
    /// Recorded by ETL callers that observed a duplicate claim; never
    /// written by the claim protocol itself.
    Duplicate,
    /// Finished with errors.
    Failed,
    /// Soft-deleted with dependents flagged; row data preserved for audit.
    RolledBack,
}

impl ImportStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Duplicate => "duplicate",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "claimed" => Ok(Self::Claimed),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "duplicate" => Ok(Self::Duplicate),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(StoreError::UnknownStatus {
                entity: "import run",
                value: other.to_owned(),
            }),
        }
    }

    /// A live claim: the batch is held and not terminal.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Claimed | Self::Processing)
    }
}

/// Identity and metadata of a batch to import.
#[derive(Debug, Clone)]
pub struct ImportSpec {
    /// Originating system (e.g. `courtlink`, `sftp-drop`).
    pub source_system: String,
    /// Batch identifier within the source system.
    pub source_batch_id: String,
    /// Content hash of the file, part of the batch identity.
    pub file_hash: String,
    /// Human-readable file name, informational only.
    pub filename: String,
    /// Kind of import (e.g. `accounts`, `payments`).
    pub import_kind: String,
}

/// Terminal row counts recorded by `finalize`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportCounts {
    /// Rows read from the source file.
    pub rows_fetched: i32,
    /// Rows written.
    pub rows_inserted: i32,
    /// Rows skipped (already present, filtered).
    pub rows_skipped: i32,
    /// Rows that errored.
    pub rows_errored: i32,
}

/// One import run row.
#[derive(Debug, Clone)]
pub struct ImportRun {
    /// Run id, stable across stale reclaims.
    pub run_id: Uuid,
    /// Batch identity and metadata.
    pub spec: ImportSpec,
    /// Current lifecycle state.
    pub status: ImportStatus,
    /// Worker currently (or last) holding the run.
    pub worker_id: String,
    /// Terminal counts; zero until finalized.
    pub counts: ImportCounts,
    /// Error summary recorded by a failed finalize.
    pub error_details: Option<String>,
    /// Reason recorded by rollback.
    pub rollback_reason: Option<String>,
    /// When the current holder claimed the run.
    pub claimed_at: DateTime<Utc>,
    /// Last heartbeat; drives the staleness window.
    pub heartbeat_at: DateTime<Utc>,
    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of a batch claim.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The batch is now held by the caller; proceed with the import.
    Claimed(ImportRun),
    /// The batch already completed; no-op, nothing was written.
    Duplicate {
        /// The completed run.
        run_id: Uuid,
    },
    /// A fresh claim is held elsewhere; back off and try later. This is a
    /// control-flow signal, not an error.
    InProgress {
        /// The run holding the claim.
        run_id: Uuid,
        /// When that run was claimed.
        claimed_at: DateTime<Utc>,
    },
}

/// Result of comparing expected vs. written rows.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Reconciliation {
    /// Caller-expected row count, when known.
    pub expected: Option<i64>,
    /// Rows actually recorded as inserted.
    pub actual: i64,
    /// Whether the two agree (vacuously true with no expectation).
    pub matched: bool,
}

/// Client for the batch claim/finalize/reconcile/rollback protocol.
#[derive(Debug, Clone)]
pub struct MoatClient<S> {
    store: Arc<S>,
    stale_after: Duration,
}

impl<S: ImportLedger> MoatClient<S> {
    /// Create a client with the default one-hour staleness threshold.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Override the staleness threshold.
    #[must_use]
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Claim a batch for this worker.
    ///
    /// A `claimed`/`processing` run whose heartbeat is older than the
    /// staleness threshold is treated as abandoned and reassigned to the
    /// caller; the run id stays stable so audit history survives.
    pub async fn claim(
        &self,
        spec: &ImportSpec,
        worker_id: &str,
    ) -> Result<ClaimOutcome, StoreError> {
        let outcome = self
            .store
            .claim_import(spec, worker_id, self.stale_after)
            .await?;
        match &outcome {
            ClaimOutcome::Claimed(run) => {
                info!(
                    run_id = %run.run_id,
                    source_system = %spec.source_system,
                    batch = %spec.source_batch_id,
                    "claimed import batch"
                );
            }
            ClaimOutcome::Duplicate { run_id } => {
                info!(%run_id, batch = %spec.source_batch_id, "import batch already completed");
            }
            ClaimOutcome::InProgress { run_id, claimed_at } => {
                warn!(
                    %run_id,
                    %claimed_at,
                    batch = %spec.source_batch_id,
                    "import batch held elsewhere, backing off"
                );
            }
        }
        Ok(outcome)
    }

    /// Extend the staleness window for a held run.
    pub async fn heartbeat(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.store.heartbeat_import(run_id).await
    }

    /// Record terminal counts. `mark_completed = false` finalizes as failed.
    pub async fn finalize(
        &self,
        run_id: Uuid,
        counts: ImportCounts,
        error_details: Option<&str>,
        mark_completed: bool,
    ) -> Result<(), StoreError> {
        self.store
            .finalize_import(run_id, &counts, error_details, mark_completed)
            .await?;
        info!(
            %run_id,
            rows_inserted = counts.rows_inserted,
            rows_errored = counts.rows_errored,
            completed = mark_completed,
            "finalized import run"
        );
        Ok(())
    }

    /// Compare expected vs. recorded row counts, independent of the claim
    /// state machine.
    pub async fn reconcile(
        &self,
        run_id: Uuid,
        expected: Option<i64>,
    ) -> Result<Reconciliation, StoreError> {
        let run = self
            .store
            .import_run(run_id)
            .await?
            .ok_or(StoreError::ImportRunNotFound(run_id))?;
        let actual = i64::from(run.counts.rows_inserted);
        let matched = expected.is_none_or(|e| e == actual);
        if !matched {
            warn!(%run_id, ?expected, actual, "import reconciliation mismatch");
        }
        Ok(Reconciliation {
            expected,
            actual,
            matched,
        })
    }

    /// Soft-delete the run: flag `rolled_back` with a reason, keeping the
    /// row and its counts for the audit trail.
    pub async fn rollback(&self, run_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.store.rollback_import(run_id, reason).await?;
        warn!(%run_id, reason, "rolled back import run");
        Ok(())
    }
}
