//! Individual watchdog checks.
//!
//! Every check is fault-isolated: a store or transport failure yields
//! [`CheckStatus::Unknown`] with the error in the detail text, and never
//! aborts the supervisor loop.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use crate::store::{OpsStore, QueueStore, WorkerStatus};
use crate::watchdog::triage::{AlertSink, DlqAlert, TriageCategory, classify};
use crate::watchdog::{CheckResult, CheckStatus, Thresholds};

/// Worker liveness: newest heartbeat per worker vs. the stale/dead
/// thresholds. Workers that reported a clean `stopped` are ignored.
pub(crate) async fn worker_liveness<S: OpsStore>(
    store: &S,
    thresholds: &Thresholds,
) -> CheckResult {
    let heartbeats = match store.list_heartbeats().await {
        Ok(rows) => rows,
        Err(error) => return CheckResult::unknown("worker_liveness", &error),
    };

    let now = chrono::Utc::now();
    let mut stale = Vec::new();
    let mut dead = Vec::new();
    let mut alive = 0usize;

    for hb in heartbeats
        .iter()
        .filter(|hb| hb.status != WorkerStatus::Stopped)
    {
        let age = (now - hb.last_heartbeat_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age >= thresholds.worker_dead {
            dead.push(format!("{} (silent {}s)", hb.worker_id, age.as_secs()));
        } else if age >= thresholds.worker_stale {
            stale.push(format!("{} (silent {}s)", hb.worker_id, age.as_secs()));
        } else {
            alive += 1;
        }
    }

    if !dead.is_empty() {
        CheckResult {
            name: "worker_liveness",
            status: CheckStatus::Unhealthy,
            detail: format!("dead workers: {}", dead.join(", ")),
        }
    } else if !stale.is_empty() {
        CheckResult {
            name: "worker_liveness",
            status: CheckStatus::Degraded,
            detail: format!("stale workers: {}", stale.join(", ")),
        }
    } else if alive == 0 {
        CheckResult {
            name: "worker_liveness",
            status: CheckStatus::Degraded,
            detail: "no workers reporting".to_owned(),
        }
    } else {
        CheckResult {
            name: "worker_liveness",
            status: CheckStatus::Healthy,
            detail: format!("{alive} workers alive"),
        }
    }
}

/// Queue freshness: age of the oldest claimable message vs. the slowing
/// and traffic-jam thresholds.
pub(crate) async fn queue_freshness<S: QueueStore>(
    store: &S,
    queue: &str,
    thresholds: &Thresholds,
) -> CheckResult {
    let age = match store.oldest_pending_age(queue).await {
        Ok(age) => age,
        Err(error) => return CheckResult::unknown("queue_freshness", &error),
    };

    match age {
        None => CheckResult {
            name: "queue_freshness",
            status: CheckStatus::Healthy,
            detail: "queue head empty".to_owned(),
        },
        Some(age) if age > thresholds.queue_jammed => CheckResult {
            name: "queue_freshness",
            status: CheckStatus::Unhealthy,
            detail: format!("traffic jam: oldest message waiting {}s", age.as_secs()),
        },
        Some(age) if age > thresholds.queue_slowing => CheckResult {
            name: "queue_freshness",
            status: CheckStatus::Degraded,
            detail: format!("slowing: oldest message waiting {}s", age.as_secs()),
        },
        Some(age) => CheckResult {
            name: "queue_freshness",
            status: CheckStatus::Healthy,
            detail: format!("oldest message waiting {}s", age.as_secs()),
        },
    }
}

/// DLQ discipline: classify the oldest dead-lettered messages and publish
/// triage side effects through the sink. Sink failures are logged, never
/// propagated.
pub(crate) async fn dlq_discipline<S: QueueStore, A: AlertSink>(
    store: &S,
    queue: &str,
    sink: &A,
    thresholds: &Thresholds,
) -> CheckResult {
    let depth = match store.dlq_depth(queue).await {
        Ok(depth) => depth,
        Err(error) => return CheckResult::unknown("dlq_discipline", &error),
    };
    if depth == 0 {
        return CheckResult {
            name: "dlq_discipline",
            status: CheckStatus::Healthy,
            detail: "dlq empty".to_owned(),
        };
    }

    let letters = match store.dlq_peek(queue, thresholds.dlq_peek).await {
        Ok(letters) => letters,
        Err(error) => return CheckResult::unknown("dlq_discipline", &error),
    };

    let mut security = 0usize;
    let mut compliance = 0usize;
    for letter in &letters {
        let text = format!(
            "{} {}",
            letter.envelope,
            letter.last_error.as_deref().unwrap_or_default()
        );
        let category = classify(&text);
        let alert = DlqAlert {
            message_id: letter.id,
            job_type: letter.job_type.clone(),
            category,
            error: letter.last_error.clone().unwrap_or_default(),
        };
        match category {
            TriageCategory::Security => {
                security += 1;
                if let Err(error) = sink.security_incident(&alert).await {
                    warn!(%error, message_id = letter.id, "Failed to publish security incident");
                }
            }
            TriageCategory::Compliance => {
                compliance += 1;
                if let Err(error) = sink.remediation_task(&alert).await {
                    warn!(%error, message_id = letter.id, "Failed to publish remediation task");
                }
            }
            TriageCategory::Unclassified => {}
        }
    }

    let detail = format!(
        "{depth} dead-lettered ({security} security, {compliance} compliance, {} unclassified in top {})",
        letters.len() - security - compliance,
        letters.len(),
    );
    CheckResult {
        name: "dlq_discipline",
        status: if security > 0 {
            CheckStatus::Unhealthy
        } else {
            CheckStatus::Degraded
        },
        detail,
    }
}

/// Outcome of one synthetic probe request.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// The endpoint answered within the transport timeout.
    Responded {
        /// HTTP status code.
        status: u16,
        /// Wall-clock request latency.
        latency: Duration,
    },
    /// Timeout or connect error.
    Unreachable(String),
}

/// Transport seam for the synthetic API probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Issue one timed health request.
    async fn check(&self) -> ProbeOutcome;
}

/// Production probe: a timed GET against a health endpoint.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Build a probe with its own transport timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self) -> ProbeOutcome {
        let start = Instant::now();
        match self.client.get(&self.url).send().await {
            Ok(response) => ProbeOutcome::Responded {
                status: response.status().as_u16(),
                latency: start.elapsed(),
            },
            Err(error) => ProbeOutcome::Unreachable(error.to_string()),
        }
    }
}

/// Map a probe outcome onto a check result.
pub(crate) fn probe_result(outcome: ProbeOutcome, thresholds: &Thresholds) -> CheckResult {
    match outcome {
        ProbeOutcome::Responded { status, latency } if status == 200 && latency < thresholds.probe_slow => {
            CheckResult {
                name: "api_probe",
                status: CheckStatus::Healthy,
                detail: format!("200 in {}ms", latency.as_millis()),
            }
        }
        ProbeOutcome::Responded { status, latency } => CheckResult {
            name: "api_probe",
            status: CheckStatus::Degraded,
            detail: format!("status {status} in {}ms", latency.as_millis()),
        },
        ProbeOutcome::Unreachable(error) => CheckResult {
            name: "api_probe",
            status: CheckStatus::Unhealthy,
            detail: format!("unreachable: {error}"),
        },
    }
}
