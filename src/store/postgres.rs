//! Postgres store.
//!
//! The claim and reap primitives lock candidate rows with
//! `FOR UPDATE SKIP LOCKED`, so concurrent claimers and the reaper never
//! return the same row and never block each other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::errors::{EnqueueError, StoreError};
use crate::moat::{ClaimOutcome, ImportCounts, ImportRun, ImportSpec, ImportStatus};
use crate::store::{
    DeadLetter, Enqueued, ImportLedger, MessageStatus, NackOutcome, NewMessage, OpsStore,
    QueueMessage, QueueStore, ReapReport, WorkerHeartbeat, WorkerStatus,
};

/// Run the bundled migrations against a connection pool.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Postgres-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Connect to `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<Arc<Self>, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        setup_database(&pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        Ok(Self::new(pool))
    }

    /// The underlying pool, for callers sharing the connection.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const MESSAGE_COLUMNS: &str = "id, queue, job_type, idempotency_key, envelope, status, attempts, \
     max_attempts, worker_id, started_at, lease_expires_at, available_at, last_error, \
     reap_count, created_at";

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    queue: String,
    job_type: String,
    idempotency_key: String,
    envelope: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    worker_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
    reap_count: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for QueueMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, StoreError> {
        Ok(QueueMessage {
            id: row.id,
            queue: row.queue,
            job_type: row.job_type,
            idempotency_key: row.idempotency_key,
            envelope: row.envelope,
            status: MessageStatus::parse(&row.status)?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            worker_id: row.worker_id,
            started_at: row.started_at,
            lease_expires_at: row.lease_expires_at,
            available_at: row.available_at,
            last_error: row.last_error,
            reap_count: row.reap_count,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct ImportRow {
    run_id: Uuid,
    source_system: String,
    source_batch_id: String,
    file_hash: String,
    filename: String,
    import_kind: String,
    status: String,
    worker_id: String,
    rows_fetched: i32,
    rows_inserted: i32,
    rows_skipped: i32,
    rows_errored: i32,
    error_details: Option<String>,
    rollback_reason: Option<String>,
    claimed_at: DateTime<Utc>,
    heartbeat_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<ImportRow> for ImportRun {
    type Error = StoreError;

    fn try_from(row: ImportRow) -> Result<Self, StoreError> {
        Ok(ImportRun {
            run_id: row.run_id,
            spec: ImportSpec {
                source_system: row.source_system,
                source_batch_id: row.source_batch_id,
                file_hash: row.file_hash,
                filename: row.filename,
                import_kind: row.import_kind,
            },
            status: ImportStatus::parse(&row.status)?,
            worker_id: row.worker_id,
            counts: ImportCounts {
                rows_fetched: row.rows_fetched,
                rows_inserted: row.rows_inserted,
                rows_skipped: row.rows_skipped,
                rows_errored: row.rows_errored,
            },
            error_details: row.error_details,
            rollback_reason: row.rollback_reason,
            claimed_at: row.claimed_at,
            heartbeat_at: row.heartbeat_at,
            finished_at: row.finished_at,
        })
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn enqueue(&self, msg: &NewMessage) -> Result<i64, EnqueueError> {
        if self
            .is_processed(&msg.job_type, &msg.idempotency_key)
            .await?
        {
            return Err(EnqueueError::DuplicateIdempotencyKey);
        }

        let id: Option<i64> = sqlx::query_scalar(
            r"
            INSERT INTO queue_messages
                (queue, job_type, idempotency_key, envelope, max_attempts, available_at)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
            ON CONFLICT (job_type, idempotency_key) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&msg.queue)
        .bind(&msg.job_type)
        .bind(&msg.idempotency_key)
        .bind(&msg.envelope)
        .bind(msg.max_attempts)
        .bind(msg.available_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        id.ok_or(EnqueueError::DuplicateIdempotencyKey)
    }

    async fn enqueue_idempotent(&self, msg: &NewMessage) -> Result<Enqueued, EnqueueError> {
        if self
            .is_processed(&msg.job_type, &msg.idempotency_key)
            .await?
        {
            return Ok(Enqueued::Completed);
        }

        let id: Option<i64> = sqlx::query_scalar(
            r"
            INSERT INTO queue_messages
                (queue, job_type, idempotency_key, envelope, max_attempts, available_at)
            VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
            ON CONFLICT (job_type, idempotency_key) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&msg.queue)
        .bind(&msg.job_type)
        .bind(&msg.idempotency_key)
        .bind(&msg.envelope)
        .bind(msg.max_attempts)
        .bind(msg.available_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        if let Some(id) = id {
            return Ok(Enqueued::Created(id));
        }

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM queue_messages WHERE job_type = $1 AND idempotency_key = $2",
        )
        .bind(&msg.job_type)
        .bind(&msg.idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        // The conflicting row may have been acked between the two statements;
        // in that case the registry owns the key now.
        Ok(existing.map_or(Enqueued::Completed, Enqueued::Existing))
    }

    async fn claim(
        &self,
        queue: &str,
        job_types: &[String],
        lease: Duration,
        worker_id: &str,
    ) -> Result<Option<QueueMessage>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            r"
            WITH next_msg AS (
                SELECT id FROM queue_messages
                WHERE queue = $1
                  AND (cardinality($2::text[]) = 0 OR job_type = ANY($2))
                  AND status = 'pending'
                  AND available_at <= NOW()
                ORDER BY available_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE queue_messages m
            SET status = 'processing',
                worker_id = $3,
                started_at = NOW(),
                lease_expires_at = NOW() + make_interval(secs => $4)
            FROM next_msg
            WHERE m.id = next_msg.id
            RETURNING {MESSAGE_COLUMNS}
            "
        ))
        .bind(queue)
        .bind(job_types)
        .bind(worker_id)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(QueueMessage::try_from).transpose()
    }

    async fn ack(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, id: i64, error: &str) -> Result<NackOutcome, StoreError> {
        let row = sqlx::query(
            r"
            UPDATE queue_messages
            SET attempts = attempts + 1,
                envelope = CASE WHEN jsonb_typeof(envelope) = 'object'
                    THEN jsonb_set(envelope, '{attempt}', to_jsonb(LEAST(attempts + 2, 100)))
                    ELSE envelope END,
                status = CASE WHEN attempts + 1 < max_attempts THEN 'pending' ELSE 'failed' END,
                worker_id = NULL,
                started_at = NULL,
                lease_expires_at = NULL,
                last_error = $2,
                available_at = CASE WHEN attempts + 1 < max_attempts
                    THEN NOW() + make_interval(secs => LEAST(power(2, attempts + 1) * 30, 3600))
                    ELSE available_at END
            WHERE id = $1
            RETURNING status, available_at
            ",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::MessageNotFound(id))?;

        let status: String = row.try_get("status")?;
        if status == "pending" {
            Ok(NackOutcome::Retried {
                available_at: row.try_get("available_at")?,
            })
        } else {
            Ok(NackOutcome::DeadLettered)
        }
    }

    async fn dead_letter(&self, id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE queue_messages
            SET status = 'failed',
                worker_id = NULL,
                started_at = NULL,
                lease_expires_at = NULL,
                last_error = $2
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit(
        &self,
        id: i64,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"
            INSERT INTO processed_jobs (job_type, idempotency_key)
            VALUES ($1, $2)
            ON CONFLICT (job_type, idempotency_key) DO NOTHING
            ",
        )
        .bind(job_type)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reap(&self, lease_timeout: Duration) -> Result<ReapReport, StoreError> {
        let rows = sqlx::query(
            r"
            WITH expired AS (
                SELECT id FROM queue_messages
                WHERE status = 'processing'
                  AND started_at <= NOW() - make_interval(secs => $1)
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages m
            SET status = CASE WHEN m.attempts < m.max_attempts THEN 'pending' ELSE 'failed' END,
                attempts = m.attempts + 1,
                envelope = CASE WHEN jsonb_typeof(m.envelope) = 'object'
                    THEN jsonb_set(m.envelope, '{attempt}', to_jsonb(LEAST(m.attempts + 2, 100)))
                    ELSE m.envelope END,
                reap_count = m.reap_count
                    + CASE WHEN m.attempts < m.max_attempts THEN 1 ELSE 0 END,
                worker_id = NULL,
                started_at = NULL,
                lease_expires_at = NULL,
                last_error = CASE WHEN m.attempts < m.max_attempts
                    THEN '[RECOVERED] ' ELSE '[DLQ] ' END
                    || COALESCE(m.last_error,
                                'lease expired for worker ' || COALESCE(m.worker_id, '?')),
                available_at = CASE WHEN m.attempts < m.max_attempts
                    THEN NOW() + make_interval(secs => LEAST(power(2, m.attempts + 1) * 30, 3600))
                    ELSE m.available_at END
            FROM expired
            WHERE m.id = expired.id
            RETURNING m.id, m.status
            ",
        )
        .bind(lease_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut report = ReapReport::default();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let status: String = row.try_get("status")?;
            if status == "pending" {
                report.recovered.push(id);
            } else {
                report.dead_lettered.push(id);
            }
        }
        Ok(report)
    }

    async fn mark_processed(
        &self,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO processed_jobs (job_type, idempotency_key)
            VALUES ($1, $2)
            ON CONFLICT (job_type, idempotency_key) DO NOTHING
            ",
        )
        .bind(job_type)
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn is_processed(
        &self,
        job_type: &str,
        idempotency_key: &str,
    ) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM processed_jobs
                WHERE job_type = $1 AND idempotency_key = $2
            )
            ",
        )
        .bind(job_type)
        .bind(idempotency_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn retry_now(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE queue_messages
            SET status = 'pending',
                available_at = NOW(),
                worker_id = NULL,
                started_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn message(&self, id: i64) -> Result<Option<QueueMessage>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM queue_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(QueueMessage::try_from).transpose()
    }

    async fn oldest_pending_age(&self, queue: &str) -> Result<Option<Duration>, StoreError> {
        let age_secs: Option<f64> = sqlx::query_scalar(
            r"
            SELECT EXTRACT(EPOCH FROM (NOW() - MIN(available_at)))::DOUBLE PRECISION
            FROM queue_messages
            WHERE queue = $1 AND status = 'pending' AND available_at <= NOW()
            ",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(age_secs.map(|secs| Duration::from_secs_f64(secs.max(0.0))))
    }

    async fn dlq_depth(&self, queue: &str) -> Result<u64, StoreError> {
        let depth: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = $1 AND status = 'failed'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(depth.max(0) as u64)
    }

    async fn dlq_peek(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, job_type, envelope, last_error
            FROM queue_messages
            WHERE queue = $1 AND status = 'failed'
            ORDER BY id ASC
            LIMIT $2
            ",
        )
        .bind(queue)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row: PgRow| {
                Ok(DeadLetter {
                    id: row.try_get("id")?,
                    job_type: row.try_get("job_type")?,
                    envelope: row.try_get("envelope")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ImportLedger for PgStore {
    async fn claim_import(
        &self,
        spec: &ImportSpec,
        worker_id: &str,
        stale_after: Duration,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let latest = sqlx::query_as::<_, ImportRow>(
            r"
            SELECT * FROM import_runs
            WHERE source_system = $1 AND source_batch_id = $2 AND file_hash = $3
            ORDER BY claimed_at DESC
            LIMIT 1
            FOR UPDATE
            ",
        )
        .bind(&spec.source_system)
        .bind(&spec.source_batch_id)
        .bind(&spec.file_hash)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = latest {
            let status = ImportStatus::parse(&row.status)?;
            match status {
                ImportStatus::Completed => {
                    tx.rollback().await?;
                    return Ok(ClaimOutcome::Duplicate { run_id: row.run_id });
                }
                s if s.is_live() => {
                    let age = Utc::now() - row.heartbeat_at;
                    if age.to_std().unwrap_or(Duration::ZERO) < stale_after {
                        tx.rollback().await?;
                        return Ok(ClaimOutcome::InProgress {
                            run_id: row.run_id,
                            claimed_at: row.claimed_at,
                        });
                    }
                    let reclaimed = sqlx::query_as::<_, ImportRow>(
                        r"
                        UPDATE import_runs
                        SET worker_id = $2,
                            status = 'claimed',
                            claimed_at = NOW(),
                            heartbeat_at = NOW()
                        WHERE run_id = $1
                        RETURNING *
                        ",
                    )
                    .bind(row.run_id)
                    .bind(worker_id)
                    .fetch_one(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(ClaimOutcome::Claimed(reclaimed.try_into()?));
                }
                _ => {}
            }
        }

        let run = sqlx::query_as::<_, ImportRow>(
            r"
            INSERT INTO import_runs
                (run_id, source_system, source_batch_id, file_hash, filename,
                 import_kind, status, worker_id)
            VALUES ($1, $2, $3, $4, $5, $6, 'claimed', $7)
            RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(&spec.source_system)
        .bind(&spec.source_batch_id)
        .bind(&spec.file_hash)
        .bind(&spec.filename)
        .bind(&spec.import_kind)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(ClaimOutcome::Claimed(run.try_into()?))
    }

    async fn heartbeat_import(&self, run_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE import_runs
            SET heartbeat_at = NOW(),
                status = CASE WHEN status = 'claimed' THEN 'processing' ELSE status END
            WHERE run_id = $1
            ",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ImportRunNotFound(run_id));
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
        let result = sqlx::query(
            r"
            UPDATE import_runs
            SET rows_fetched = $2,
                rows_inserted = $3,
                rows_skipped = $4,
                rows_errored = $5,
                error_details = $6,
                status = CASE WHEN $7 THEN 'completed' ELSE 'failed' END,
                finished_at = NOW()
            WHERE run_id = $1
            ",
        )
        .bind(run_id)
        .bind(counts.rows_fetched)
        .bind(counts.rows_inserted)
        .bind(counts.rows_skipped)
        .bind(counts.rows_errored)
        .bind(error_details)
        .bind(mark_completed)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ImportRunNotFound(run_id));
        }
        Ok(())
    }

    async fn rollback_import(&self, run_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE import_runs
            SET status = 'rolled_back',
                rollback_reason = $2,
                finished_at = NOW()
            WHERE run_id = $1
            ",
        )
        .bind(run_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ImportRunNotFound(run_id));
        }
        Ok(())
    }

    async fn import_run(&self, run_id: Uuid) -> Result<Option<ImportRun>, StoreError> {
        let row = sqlx::query_as::<_, ImportRow>("SELECT * FROM import_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ImportRun::try_from).transpose()
    }
}

#[async_trait]
impl OpsStore for PgStore {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO worker_heartbeats
                (worker_id, worker_type, hostname, last_heartbeat_at, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (worker_id) DO UPDATE
            SET worker_type = EXCLUDED.worker_type,
                hostname = EXCLUDED.hostname,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                status = EXCLUDED.status
            ",
        )
        .bind(&heartbeat.worker_id)
        .bind(&heartbeat.worker_type)
        .bind(&heartbeat.hostname)
        .bind(heartbeat.last_heartbeat_at)
        .bind(heartbeat.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT worker_id, worker_type, hostname, last_heartbeat_at, status
            FROM worker_heartbeats
            ORDER BY worker_id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row: PgRow| {
                let status: String = row.try_get("status")?;
                Ok(WorkerHeartbeat {
                    worker_id: row.try_get("worker_id")?,
                    worker_type: row.try_get("worker_type")?,
                    hostname: row.try_get("hostname")?,
                    last_heartbeat_at: row.try_get("last_heartbeat_at")?,
                    status: WorkerStatus::parse(&status)?,
                })
            })
            .collect()
    }
}
