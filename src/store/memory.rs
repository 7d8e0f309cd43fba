//! In-process store backing the test suite and embedded deployments.
//!
//! All state lives behind one async mutex, so every operation is a single
//! atomic transition. That gives the same claim semantics as the Postgres
//! store's `FOR UPDATE SKIP LOCKED`: concurrent claimers serialize on the
//! lock and each row is handed to at most one of them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backoff::backoff;
use crate::envelope::MAX_ATTEMPT;
use crate::errors::{EnqueueError, StoreError};
use crate::moat::{ClaimOutcome, ImportCounts, ImportRun, ImportSpec, ImportStatus};
use crate::store::{
    DeadLetter, Enqueued, ImportLedger, MessageStatus, NackOutcome, NewMessage, OpsStore,
    QueueMessage, QueueStore, ReapReport, WorkerHeartbeat,
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    messages: BTreeMap<i64, QueueMessage>,
    processed: HashSet<(String, String)>,
    imports: HashMap<Uuid, ImportRun>,
    heartbeats: HashMap<String, WorkerHeartbeat>,
}

impl Inner {
    fn live_message_id(&self, job_type: &str, idempotency_key: &str) -> Option<i64> {
        self.messages
            .values()
            .find(|m| m.job_type == job_type && m.idempotency_key == idempotency_key)
            .map(|m| m.id)
    }

    fn insert(&mut self, msg: &NewMessage) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        let now = Utc::now();
        self.messages.insert(
            id,
            QueueMessage {
                id,
                queue: msg.queue.clone(),
                job_type: msg.job_type.clone(),
                idempotency_key: msg.idempotency_key.clone(),
                envelope: msg.envelope.clone(),
                status: MessageStatus::Pending,
                attempts: 0,
                max_attempts: msg.max_attempts,
                worker_id: None,
                started_at: None,
                lease_expires_at: None,
                available_at: msg.available_at.unwrap_or(now),
                last_error: None,
                reap_count: 0,
                created_at: now,
            },
        );
        id
    }
}

/// Requeue a message after a failed try: clear the lease, bump the attempt
/// counter in both the row and the envelope, and apply backoff.
fn record_failure(msg: &mut QueueMessage, error: &str, reaped: bool) -> NackOutcome {
    msg.attempts += 1;
    bump_envelope_attempt(&mut msg.envelope, msg.attempts);
    msg.worker_id = None;
    msg.started_at = None;
    msg.lease_expires_at = None;
    msg.last_error = Some(error.to_owned());

    let retry = if reaped {
        // The reaper checks the budget before counting the lost lease as a
        // failed try; nack checks it after.
        msg.attempts - 1 < msg.max_attempts
    } else {
        msg.attempts < msg.max_attempts
    };

    if retry {
        let delay = backoff(msg.attempts.max(0) as u32);
        msg.status = MessageStatus::Pending;
        msg.available_at = Utc::now() + TimeDelta::seconds(delay.as_secs() as i64);
        if reaped {
            msg.reap_count += 1;
        }
        NackOutcome::Retried {
            available_at: msg.available_at,
        }
    } else {
        msg.status = MessageStatus::Failed;
        NackOutcome::DeadLettered
    }
}

fn bump_envelope_attempt(envelope: &mut Value, attempts: i32) {
    if let Some(obj) = envelope.as_object_mut() {
        let attempt = (attempts as u32 + 1).min(MAX_ATTEMPT);
        obj.insert("attempt".to_owned(), Value::from(attempt));
    }
}

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, msg: &NewMessage) -> Result<i64, EnqueueError> {
        let mut inner = self.inner.lock().await;
        let key = (msg.job_type.clone(), msg.idempotency_key.clone());
        if inner.processed.contains(&key)
            || inner
                .live_message_id(&msg.job_type, &msg.idempotency_key)
                .is_some()
        {
            return Err(EnqueueError::DuplicateIdempotencyKey);
        }
        Ok(inner.insert(msg))
    }

    async fn enqueue_idempotent(&self, msg: &NewMessage) -> Result<Enqueued, EnqueueError> {
        let mut inner = self.inner.lock().await;
        let key = (msg.job_type.clone(), msg.idempotency_key.clone());
        if inner.processed.contains(&key) {
            return Ok(Enqueued::Completed);
        }
        if let Some(id) = inner.live_message_id(&msg.job_type, &msg.idempotency_key) {
            return Ok(Enqueued::Existing(id));
        }
        Ok(Enqueued::Created(inner.insert(msg)))
    }

    async fn claim(
        &self,
        queue: &str,
        job_types: &[String],
        lease: Duration,
        worker_id: &str,
    ) -> Result<Option<QueueMessage>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let next = inner
            .messages
            .values()
            .filter(|m| {
                m.queue == queue
                    && m.status == MessageStatus::Pending
                    && m.available_at <= now
                    && (job_types.is_empty() || job_types.iter().any(|t| *t == m.job_type))
            })
            .min_by_key(|m| (m.available_at, m.id))
            .map(|m| m.id);

        let Some(id) = next else { return Ok(None) };
        let msg = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        msg.status = MessageStatus::Processing;
        msg.worker_id = Some(worker_id.to_owned());
        msg.started_at = Some(now);
        msg.lease_expires_at = Some(now + TimeDelta::seconds(lease.as_secs() as i64));
        Ok(Some(msg.clone()))
    }

    async fn ack(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.messages.remove(&id);
        Ok(())
    }

    async fn nack(&self, id: i64, error: &str) -> Result<NackOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let msg = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        Ok(record_failure(msg, error, false))
    }

    async fn dead_letter(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let msg = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        msg.status = MessageStatus::Failed;
        msg.worker_id = None;
        msg.started_at = None;
        msg.lease_expires_at = None;
        msg.last_error = Some(error.to_owned());
        Ok(())
    }

    async fn commit(
        &self,
        id: i64,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .processed
            .insert((job_type.to_owned(), idempotency_key.to_owned()));
        inner.messages.remove(&id);
        Ok(())
    }

    async fn reap(&self, lease_timeout: Duration) -> Result<ReapReport, StoreError> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - TimeDelta::seconds(lease_timeout.as_secs() as i64);
        let expired: Vec<i64> = inner
            .messages
            .values()
            .filter(|m| {
                m.status == MessageStatus::Processing
                    && m.started_at.is_some_and(|started| started <= cutoff)
            })
            .map(|m| m.id)
            .collect();

        let mut report = ReapReport::default();
        for id in expired {
            let Some(msg) = inner.messages.get_mut(&id) else {
                continue;
            };
            let previous = msg.last_error.clone().unwrap_or_else(|| {
                format!("lease expired for worker {}", msg.worker_id.as_deref().unwrap_or("?"))
            });
            let recovered = msg.attempts < msg.max_attempts;
            let marker = if recovered { "[RECOVERED]" } else { "[DLQ]" };
            match record_failure(msg, &format!("{marker} {previous}"), true) {
                NackOutcome::Retried { .. } => report.recovered.push(id),
                NackOutcome::DeadLettered => report.dead_lettered.push(id),
            }
        }
        Ok(report)
    }

    async fn mark_processed(
        &self,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .processed
            .insert((job_type.to_owned(), idempotency_key.to_owned())))
    }

    async fn is_processed(
        &self,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .processed
            .contains(&(job_type.to_owned(), idempotency_key.to_owned())))
    }

    async fn retry_now(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let msg = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::MessageNotFound(id))?;
        msg.status = MessageStatus::Pending;
        msg.available_at = Utc::now();
        msg.worker_id = None;
        msg.started_at = None;
        msg.lease_expires_at = None;
        Ok(())
    }

    async fn message(&self, id: i64) -> Result<Option<QueueMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.messages.get(&id).cloned())
    }

    async fn oldest_pending_age(&self, queue: &str) -> Result<Option<Duration>, StoreError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let oldest = inner
            .messages
            .values()
            .filter(|m| m.queue == queue && m.status == MessageStatus::Pending && m.available_at <= now)
            .map(|m| m.available_at)
            .min();
        Ok(oldest.map(|at| (now - at).to_std().unwrap_or(Duration::ZERO)))
    }

    async fn dlq_depth(&self, queue: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .values()
            .filter(|m| m.queue == queue && m.status == MessageStatus::Failed)
            .count() as u64)
    }

    async fn dlq_peek(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .messages
            .values()
            .filter(|m| m.queue == queue && m.status == MessageStatus::Failed)
            .take(limit)
            .map(|m| DeadLetter {
                id: m.id,
                job_type: m.job_type.clone(),
                envelope: m.envelope.clone(),
                last_error: m.last_error.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl ImportLedger for MemoryStore {
    async fn claim_import(
        &self,
        spec: &ImportSpec,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let latest = inner
            .imports
            .values_mut()
            .filter(|run| {
                run.spec.source_system == spec.source_system
                    && run.spec.source_batch_id == spec.source_batch_id
                    && run.spec.file_hash == spec.file_hash
            })
            .max_by_key(|run| run.claimed_at);

        if let Some(run) = latest {
            match run.status {
                ImportStatus::Completed => {
                    return Ok(ClaimOutcome::Duplicate { run_id: run.run_id });
                }
                status if status.is_live() => {
                    let stale_cutoff = now - TimeDelta::seconds(stale_after.as_secs() as i64);
                    if run.heartbeat_at > stale_cutoff {
                        return Ok(ClaimOutcome::InProgress {
                            run_id: run.run_id,
                            claimed_at: run.claimed_at,
                        });
                    }
                    // Abandoned: reassign in place, run id stays stable.
                    run.worker_id = worker_id.to_owned();
                    run.status = ImportStatus::Claimed;
                    run.claimed_at = now;
                    run.heartbeat_at = now;
                    return Ok(ClaimOutcome::Claimed(run.clone()));
                }
                _ => {}
            }
        }

        let run = ImportRun {
            run_id: Uuid::new_v4(),
            spec: spec.clone(),
            status: ImportStatus::Claimed,
            worker_id: worker_id.to_owned(),
            counts: ImportCounts::default(),
            error_details: None,
            rollback_reason: None,
            claimed_at: now,
            heartbeat_at: now,
            finished_at: None,
        };
        inner.imports.insert(run.run_id, run.clone());
        Ok(ClaimOutcome::Claimed(run))
    }

    async fn heartbeat_import(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .imports
            .get_mut(&run_id)
            .ok_or(StoreError::ImportRunNotFound(run_id))?;
        run.heartbeat_at = Utc::now();
        if run.status == ImportStatus::Claimed {
            run.status = ImportStatus::Processing;
        }
        Ok(())
    }

    async fn finalize_import(
        &self,
        run_id: Uuid,
        counts: &ImportCounts,
        error_details: Option<&str>,
        mark_completed: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .imports
            .get_mut(&run_id)
            .ok_or(StoreError::ImportRunNotFound(run_id))?;
        run.counts = *counts;
        run.error_details = error_details.map(str::to_owned);
        run.status = if mark_completed {
            ImportStatus::Completed
        } else {
            ImportStatus::Failed
        };
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn rollback_import(&self, run_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .imports
            .get_mut(&run_id)
            .ok_or(StoreError::ImportRunNotFound(run_id))?;
        run.status = ImportStatus::RolledBack;
        run.rollback_reason = Some(reason.to_owned());
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn import_run(&self, run_id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.imports.get(&run_id).cloned())
    }
}

#[async_trait]
impl OpsStore for MemoryStore {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner.heartbeats.values().cloned().collect();
        rows.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(rows)
    }
}
