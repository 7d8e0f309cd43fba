//! Watchdog supervisor.
//!
//! A periodic external auditor of queue age, worker liveness, API health,
//! and DLQ backlog. Checks are independently fault-isolated; the overall
//! status is the maximum severity across them.

pub mod checks;
pub mod triage;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::info;

pub use checks::{HealthProbe, HttpProbe, ProbeOutcome};
pub use triage::{AlertSink, DlqAlert, LogAlertSink, TriageCategory, classify};

use crate::store::{OpsStore, QueueStore};

/// Default watchdog loop interval.
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(60);

/// SLO thresholds the watchdog enforces.
#[derive(Debug, Clone)]
pub struct Thresholds {
    /// Heartbeat age at which a worker is stale (warning).
    pub worker_stale: Duration,
    /// Heartbeat age at which a worker is dead (fatal).
    pub worker_dead: Duration,
    /// Oldest-message age at which a queue is slowing.
    pub queue_slowing: Duration,
    /// Oldest-message age at which a queue is in a traffic jam.
    pub queue_jammed: Duration,
    /// Probe latency above which a 200 still counts as degraded.
    pub probe_slow: Duration,
    /// How many DLQ messages one pass triages.
    pub dlq_peek: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            worker_stale: Duration::from_secs(90),
            worker_dead: Duration::from_secs(900),
            queue_slowing: Duration::from_secs(180),
            queue_jammed: Duration::from_secs(300),
            probe_slow: Duration::from_millis(1000),
            dlq_peek: 20,
        }
    }
}

/// Severity of one check (and of the aggregated report).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Within SLO.
    Healthy,
    /// Outside SLO but functioning.
    Degraded,
    /// The check itself failed; treated like degraded when aggregating.
    Unknown,
    /// SLO violated.
    Unhealthy,
}

impl CheckStatus {
    fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded | Self::Unknown => 1,
            Self::Unhealthy => 2,
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Stable check name.
    pub name: &'static str,
    /// Severity.
    pub status: CheckStatus,
    /// Human-readable explanation.
    pub detail: String,
}

impl CheckResult {
    pub(crate) fn unknown(name: &'static str, error: &dyn std::fmt::Display) -> Self {
        Self {
            name,
            status: CheckStatus::Unknown,
            detail: format!("check failed: {error}"),
        }
    }
}

/// One full watchdog pass.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogReport {
    /// When the pass ran.
    pub checked_at: DateTime<Utc>,
    /// Max severity across checks.
    pub overall: CheckStatus,
    /// Individual check outcomes.
    pub checks: Vec<CheckResult>,
}

/// Aggregate check severities: unhealthy if any check is unhealthy,
/// degraded if any is degraded or unknown, healthy otherwise.
pub fn overall(checks: &[CheckResult]) -> CheckStatus {
    match checks.iter().map(|c| c.status.severity()).max() {
        Some(2) => CheckStatus::Unhealthy,
        Some(1) => CheckStatus::Degraded,
        _ => CheckStatus::Healthy,
    }
}

/// The supervisor. Generic over the store, the probe transport, and the
/// alert sink so tests can stub the external collaborators.
pub struct Watchdog<S, P = HttpProbe, A = LogAlertSink> {
    store: Arc<S>,
    queue: String,
    probe: Option<P>,
    sink: A,
    thresholds: Thresholds,
}

impl<S> Watchdog<S> {
    /// Create a watchdog over a queue with default thresholds, no probe,
    /// and the logging sink.
    pub fn new(store: Arc<S>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
            probe: None,
            sink: LogAlertSink,
            thresholds: Thresholds::default(),
        }
    }
}

impl<S, P, A> Watchdog<S, P, A> {
    /// Attach a synthetic API probe. Without one, the probe check is
    /// skipped entirely.
    pub fn with_probe<P2>(self, probe: P2) -> Watchdog<S, P2, A> {
        Watchdog {
            store: self.store,
            queue: self.queue,
            probe: Some(probe),
            sink: self.sink,
            thresholds: self.thresholds,
        }
    }

    /// Replace the alert sink.
    pub fn with_sink<A2>(self, sink: A2) -> Watchdog<S, P, A2> {
        Watchdog {
            store: self.store,
            queue: self.queue,
            probe: self.probe,
            sink,
            thresholds: self.thresholds,
        }
    }

    /// Override the SLO thresholds.
    #[must_use]
    pub fn thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

impl<S, P, A> Watchdog<S, P, A>
where
    S: QueueStore + OpsStore,
    P: HealthProbe,
    A: AlertSink,
{
    /// Run one pass of every check.
    pub async fn run_checks(&self) -> WatchdogReport {
        let mut checks = vec![
            checks::worker_liveness(&*self.store, &self.thresholds).await,
            checks::queue_freshness(&*self.store, &self.queue, &self.thresholds).await,
            checks::dlq_discipline(&*self.store, &self.queue, &self.sink, &self.thresholds).await,
        ];
        if let Some(probe) = &self.probe {
            checks.push(checks::probe_result(probe.check().await, &self.thresholds));
        }

        let report = WatchdogReport {
            checked_at: Utc::now(),
            overall: overall(&checks),
            checks,
        };
        for check in &report.checks {
            info!(
                check = check.name,
                status = %check.status,
                detail = %check.detail,
                "watchdog check"
            );
        }
        info!(overall = %report.overall, "watchdog pass complete");
        report
    }

    /// Run passes at `interval` until shutdown; returns the last report.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> WatchdogReport {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick fires immediately

        let mut last = self.run_checks().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            last = self.run_checks().await;
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(status: CheckStatus) -> CheckResult {
        CheckResult {
            name: "test",
            status,
            detail: String::new(),
        }
    }

    #[test]
    fn unhealthy_dominates() {
        let checks = [
            check(CheckStatus::Healthy),
            check(CheckStatus::Degraded),
            check(CheckStatus::Unhealthy),
        ];
        assert_eq!(overall(&checks), CheckStatus::Unhealthy);
    }

    #[test]
    fn degraded_or_unknown_without_unhealthy_is_degraded() {
        assert_eq!(
            overall(&[check(CheckStatus::Healthy), check(CheckStatus::Degraded)]),
            CheckStatus::Degraded
        );
        assert_eq!(
            overall(&[check(CheckStatus::Healthy), check(CheckStatus::Unknown)]),
            CheckStatus::Degraded
        );
    }

    #[test]
    fn all_healthy_is_healthy() {
        assert_eq!(
            overall(&[check(CheckStatus::Healthy), check(CheckStatus::Healthy)]),
            CheckStatus::Healthy
        );
        assert_eq!(overall(&[]), CheckStatus::Healthy);
    }
}
