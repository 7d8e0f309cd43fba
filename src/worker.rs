//! The poll/lease/validate/process/commit loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

use crate::backoff::jittered;
use crate::envelope::JobEnvelope;
use crate::errors::StoreError;
use crate::job_handler::HandlerRegistry;
use crate::store::{NackOutcome, QueueMessage, QueueStore};

pub(crate) struct Worker<Context, S> {
    pub(crate) store: Arc<S>,
    pub(crate) context: Context,
    pub(crate) registry: Arc<HandlerRegistry<Context>>,
    pub(crate) queue: String,
    pub(crate) worker_id: String,
    pub(crate) lease: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl<Context, S> Worker<Context, S>
where
    Context: Clone + Send + Sync + 'static,
    S: QueueStore,
{
    /// Run jobs until shut down, or until the queue is empty if
    /// `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(mut self) {
        let job_types = self.registry.job_types();
        loop {
            if *self.shutdown.borrow() {
                debug!("Shutdown requested. Draining worker…");
                break;
            }
            match self.run_next_job(&job_types).await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = jittered(self.poll_interval, self.jitter);
                    trace!("No pending jobs found. Polling again in {sleep_duration:?}…");
                    self.idle(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    let sleep_duration = jittered(self.poll_interval, self.jitter);
                    self.idle(sleep_duration).await;
                }
            }
        }
    }

    /// Sleep, waking early when a shutdown is signalled.
    async fn idle(&mut self, duration: Duration) {
        tokio::select! {
            () = sleep(duration) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    /// Lease and fully process the next message, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(id))` if a message was leased (whatever its outcome)
    /// - `Ok(None)` if nothing was claimable
    /// - `Err(…)` if the store was unreachable
    async fn run_next_job(&self, job_types: &[String]) -> Result<Option<i64>, StoreError> {
        trace!("Looking for the next queue message…");
        let Some(msg) = self
            .store
            .claim(&self.queue, job_types, self.lease, &self.worker_id)
            .await?
        else {
            return Ok(None);
        };

        let id = msg.id;
        let span = info_span!("job", job.id = id, job.r#type = %msg.job_type);
        self.process_message(msg).instrument(span).await?;
        Ok(Some(id))
    }

    async fn process_message(&self, msg: QueueMessage) -> Result<(), StoreError> {
        // Strict schema check first: a malformed envelope is poison and is
        // dead-lettered without ever reaching a handler.
        let envelope = match JobEnvelope::parse(msg.envelope.clone()) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "Dead-lettering message with invalid envelope");
                self.store
                    .dead_letter(msg.id, &format!("envelope validation failed: {error}"))
                    .await?;
                return Ok(());
            }
        };

        // A key that already completed means this message is a replay
        // (duplicate enqueue or lease recovery of a committed run). Ack it
        // without re-invoking the handler.
        if self
            .store
            .is_processed(&msg.job_type, &envelope.idempotency_key)
            .await?
        {
            debug!(
                idempotency_key = %envelope.idempotency_key,
                "Idempotency key already processed. Acking replay without running the handler…"
            );
            self.store.ack(msg.id).await?;
            return Ok(());
        }

        debug!(attempt = envelope.attempt, "Running job…");
        let result = match self.registry.get(&msg.job_type) {
            Some(run_task_fn) => {
                AssertUnwindSafe(run_task_fn(self.context.clone(), envelope.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(panic_error(&*panic)))
            }
            None => Err(anyhow!("unknown job type `{}`", msg.job_type)),
        };

        match result {
            Ok(()) => {
                debug!("Committing successful job…");
                self.store
                    .commit(msg.id, &msg.job_type, &envelope.idempotency_key)
                    .await?;
            }
            Err(error) => {
                warn!("Failed to run job: {error:#}");
                match self.store.nack(msg.id, &format!("{error:#}")).await? {
                    NackOutcome::Retried { available_at } => {
                        debug!(%available_at, "Rescheduled job for retry");
                    }
                    NackOutcome::DeadLettered => {
                        error!(job.id = msg.id, "Attempts exhausted. Job moved to the DLQ");
                    }
                }
            }
        }

        Ok(())
    }
}

fn panic_error(panic: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = panic.downcast_ref::<&str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
