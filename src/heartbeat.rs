//! Background liveness reporter.
//!
//! One reporter task runs per worker process. Status transitions arrive as
//! messages over a channel rather than through shared mutable state; the
//! reporter owns the row it upserts. Upsert failures are logged and retried
//! on the next tick, so an unreachable store never crashes the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::store::{OpsStore, WorkerHeartbeat, WorkerStatus};

/// Producer side of the heartbeat channel.
///
/// Cloned into the parts of the process that know about status changes.
/// Dropping every handle stops the reporter, which writes a final `stopped`
/// row on the way out.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    tx: mpsc::Sender<WorkerStatus>,
}

impl HeartbeatHandle {
    /// Report a status transition. Best effort: a full or closed channel is
    /// ignored rather than blocking the caller.
    pub async fn transition(&self, status: WorkerStatus) {
        let _ = self.tx.send(status).await;
    }
}

/// The reporter task. Drive it with [`HeartbeatReporter::run`].
pub struct HeartbeatReporter<S> {
    store: Arc<S>,
    worker_id: String,
    worker_type: String,
    hostname: String,
    interval: Duration,
    rx: mpsc::Receiver<WorkerStatus>,
}

/// Create a connected handle/reporter pair.
pub fn heartbeat_channel<S: OpsStore>(
    store: Arc<S>,
    worker_id: String,
    worker_type: String,
    interval: Duration,
) -> (HeartbeatHandle, HeartbeatReporter<S>) {
    let (tx, rx) = mpsc::channel(16);
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_owned());
    (
        HeartbeatHandle { tx },
        HeartbeatReporter {
            store,
            worker_id,
            worker_type,
            hostname,
            interval,
            rx,
        },
    )
}

impl<S: OpsStore> HeartbeatReporter<S> {
    /// Beat until told to stop, then write the final `stopped` row.
    pub async fn run(mut self) {
        let mut status = WorkerStatus::Running;
        self.beat(status).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    trace!("Heartbeat tick");
                    self.beat(status).await;
                }
                transition = self.rx.recv() => match transition {
                    Some(WorkerStatus::Stopped) | None => break,
                    Some(next) => {
                        debug!(status = next.as_str(), "Heartbeat status transition");
                        status = next;
                        self.beat(status).await;
                    }
                }
            }
        }

        self.beat(WorkerStatus::Stopped).await;
    }

    async fn beat(&self, status: WorkerStatus) {
        let heartbeat = WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            worker_type: self.worker_type.clone(),
            hostname: self.hostname.clone(),
            last_heartbeat_at: Utc::now(),
            status,
        };
        if let Err(error) = self.store.upsert_heartbeat(&heartbeat).await {
            warn!(%error, "Failed to upsert heartbeat. Retrying next interval…");
        }
    }
}
