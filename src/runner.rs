//! The runner that owns worker pools, the heartbeat reporter, and the
//! optional in-process reaper, and coordinates graceful shutdown.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

use crate::heartbeat::{HeartbeatHandle, heartbeat_channel};
use crate::job_handler::{HandlerRegistry, JobHandler};
use crate::reaper::Reaper;
use crate::store::{OpsStore, QueueStore, WorkerStatus};
use crate::worker::Worker;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_LEASE: Duration = Duration::from_secs(300);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Marker type for a configured runner.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for leasing and running jobs.
pub struct Runner<Context: Clone + Send + Sync + 'static, S, State = Unconfigured> {
    store: Arc<S>,
    queues: HashMap<String, Queue<Context, Configured>>,
    context: Context,
    instance_id: String,
    shutdown_when_queue_empty: bool,
    heartbeat: Option<(String, Duration)>,
    reaper: Option<(Duration, Duration)>,
    _state: PhantomData<State>,
}

impl<Context, S, State> std::fmt::Debug for Runner<Context, S, State>
where
    Context: std::fmt::Debug + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("context", &self.context)
            .field("instance_id", &self.instance_id)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static, S> Runner<Context, S> {
    /// Create a new runner with the given store and context.
    pub fn new(store: Arc<S>, context: Context) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned());
        Self {
            store,
            queues: HashMap::new(),
            context,
            instance_id: format!("{hostname}-{}", std::process::id()),
            shutdown_when_queue_empty: false,
            heartbeat: None,
            reaper: None,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, S, State> Runner<Context, S, State> {
    /// Configure a queue.
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context, Configured>,
    ) -> Runner<Context, S, Configured> {
        self.queues
            .insert(queue_name.into(), config_fn(Queue::default()));

        Runner {
            store: self.store,
            queues: self.queues,
            context: self.context,
            instance_id: self.instance_id,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            heartbeat: self.heartbeat,
            reaper: self.reaper,
            _state: PhantomData,
        }
    }

    /// Configure the default queue.
    pub fn configure_default_queue(
        self,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context, Configured>,
    ) -> Runner<Context, S, Configured> {
        self.configure_queue(crate::store::DEFAULT_QUEUE, config_fn)
    }

    /// Override the identity this runner reports as.
    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the runner to shut down when the job queue is empty.
    #[must_use]
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Report liveness under the given worker type every 30 seconds.
    #[must_use]
    pub fn with_heartbeat(mut self, worker_type: &str) -> Self {
        self.heartbeat = Some((worker_type.to_owned(), DEFAULT_HEARTBEAT_INTERVAL));
        self
    }

    /// Report liveness at a custom interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, worker_type: &str, interval: Duration) -> Self {
        self.heartbeat = Some((worker_type.to_owned(), interval));
        self
    }

    /// Run an in-process reaper reclaiming leases older than `lease_timeout`
    /// every 60 seconds.
    #[must_use]
    pub fn with_reaper(mut self, lease_timeout: Duration) -> Self {
        self.reaper = Some((DEFAULT_REAPER_INTERVAL, lease_timeout));
        self
    }
}

impl<Context, S> Runner<Context, S, Configured>
where
    Context: Clone + Send + Sync + 'static,
    S: QueueStore + OpsStore,
{
    /// Start the worker pools and background tasks.
    ///
    /// Returns a [`RunHandle`] used to wait for, or gracefully drain, the
    /// running system.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        for (queue_name, queue) in &self.queues {
            for i in 1..=queue.num_workers {
                let name = format!("{}-{queue_name}-{i}", self.instance_id);
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    store: self.store.clone(),
                    context: self.context.clone(),
                    registry: Arc::new(queue.registry.clone()),
                    queue: queue_name.clone(),
                    worker_id: name.clone(),
                    lease: queue.lease,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    shutdown: shutdown_rx.clone(),
                };

                let span = info_span!("worker", worker.name = %name);
                handles.push(tokio::spawn(worker.run().instrument(span)));
            }
        }

        // Kept out of `handles`: the reaper only exits on the shutdown
        // signal, so joining it with the workers would hang a
        // shutdown_when_queue_empty drain forever.
        let reaper = self.reaper.map(|(interval, lease_timeout)| {
            let reaper = Reaper::new(self.store.clone())
                .interval(interval)
                .lease_timeout(lease_timeout);
            tokio::spawn(reaper.run(shutdown_rx.clone()))
        });

        let heartbeat = self.heartbeat.as_ref().map(|(worker_type, interval)| {
            let (handle, reporter) = heartbeat_channel(
                self.store.clone(),
                self.instance_id.clone(),
                worker_type.clone(),
                *interval,
            );
            (handle, tokio::spawn(reporter.run()))
        });

        RunHandle {
            shutdown: shutdown_tx,
            handles,
            reaper,
            heartbeat,
        }
    }
}

/// Handle to a running job processing system.
#[derive(Debug)]
pub struct RunHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
    heartbeat: Option<(HeartbeatHandle, JoinHandle<()>)>,
}

impl RunHandle {
    /// Wait for all workers to shut down on their own (only useful together
    /// with `shutdown_when_queue_empty`).
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });
        // The workers drained on their own; tell the background tasks.
        let _ = self.shutdown.send(true);
        if let Some(task) = self.reaper {
            if let Err(error) = task.await {
                warn!(%error, "Reaper task panicked");
            }
        }
        if let Some((handle, task)) = self.heartbeat {
            handle.transition(WorkerStatus::Stopped).await;
            if let Err(error) = task.await {
                warn!(%error, "Heartbeat reporter task panicked");
            }
        }
    }

    /// Drain gracefully: stop leasing new messages, give in-flight work
    /// until `grace` to finish, then abort whatever remains. Abandoned
    /// leases are left for the reaper.
    pub async fn shutdown(mut self, grace: Duration) {
        info!("Shutting down. Draining in-flight work…");
        let _ = self.shutdown.send(true);

        let drained = tokio::time::timeout(grace, join_all(&mut self.handles)).await;
        if drained.is_err() {
            warn!("Grace deadline hit. Aborting remaining workers…");
            for handle in &self.handles {
                handle.abort();
            }
        }

        if let Some(task) = self.reaper.take() {
            let _ = task.await;
        }
        if let Some((handle, task)) = self.heartbeat.take() {
            handle.transition(WorkerStatus::Stopped).await;
            let _ = task.await;
        }
    }
}

/// Configuration for one queue's worker pool.
#[derive(Debug)]
pub struct Queue<Context, State = Unconfigured> {
    registry: HandlerRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    lease: Duration,
    _state: PhantomData<State>,
}

impl<Context> Default for Queue<Context, Unconfigured> {
    fn default() -> Self {
        Self {
            registry: HandlerRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            lease: DEFAULT_LEASE,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Queue<Context, State> {
    /// Set the number of workers for this queue.
    #[must_use]
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll an empty queue.
    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter added to poll intervals.
    ///
    /// Jitter reduces thundering-herd effects when several workers poll an
    /// empty queue at once.
    #[must_use]
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the advisory lease duration declared at claim time.
    #[must_use]
    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Register a handler for this queue. A queue is configured once it can
    /// dispatch at least one job type.
    pub fn register_job_type<H: JobHandler<Context = Context>>(
        mut self,
    ) -> Queue<Context, Configured> {
        self.registry.register::<H>();
        Queue {
            registry: self.registry,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            lease: self.lease,
            _state: PhantomData,
        }
    }
}
