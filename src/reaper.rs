//! Periodic recovery of leases abandoned by crashed or stalled workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace, warn};

use crate::errors::StoreError;
use crate::store::{QueueStore, ReapReport};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Reclaims `processing` rows whose lease started longer ago than the
/// configured timeout. Shares the store's atomic claim primitive, so it is
/// safe to run alongside any number of workers, and multiple reapers are
/// harmless.
pub struct Reaper<S> {
    store: Arc<S>,
    interval: Duration,
    lease_timeout: Duration,
}

impl<S: QueueStore> Reaper<S> {
    /// Create a reaper with a 60 second interval and 300 second timeout.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            interval: DEFAULT_INTERVAL,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    /// Set the pass interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the lease timeout after which a `processing` row is reclaimed.
    #[must_use]
    pub fn lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Run a single pass.
    pub async fn run_once(&self) -> Result<ReapReport, StoreError> {
        self.store.reap(self.lease_timeout).await
    }

    /// Run passes until shutdown. Store errors are logged and retried on
    /// the next interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(report) if report.is_empty() => trace!("Reaper pass found nothing to reclaim"),
                Ok(report) => info!(
                    recovered = report.recovered.len(),
                    dead_lettered = report.dead_lettered.len(),
                    "Reaper reclaimed abandoned leases"
                ),
                Err(error) => warn!(%error, "Reaper pass failed. Retrying next interval…"),
            }
        }
    }
}
