//! SLO watchdog for the job queue: audits worker liveness, queue freshness,
//! DLQ backlog (with triage), and an optional synthetic API probe.
//!
//! Exits 0 when the final report is healthy or degraded, 1 when unhealthy.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use docketq::PgStore;
use docketq::watchdog::{CheckStatus, HttpProbe, Watchdog, WatchdogReport};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "watchdog", about = "SLO supervisor for the job queue")]
struct Opts {
    /// Run a single pass, print the report as JSON, and exit.
    #[arg(long)]
    once: bool,

    /// Seconds between passes in loop mode.
    #[arg(long, default_value = "60")]
    interval: u64,

    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Health endpoint for the synthetic API probe. Without it the probe
    /// check is skipped.
    #[arg(long, env = "WATCHDOG_PROBE_URL")]
    probe_url: Option<String>,

    /// Probe transport timeout in seconds.
    #[arg(long, default_value = "5")]
    probe_timeout: u64,

    /// Queue to audit.
    #[arg(long, default_value = "default")]
    queue: String,

    /// Environment tag carried in log fields.
    #[arg(long, env = "ENVIRONMENT", default_value = "production")]
    environment: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let opts = Opts::parse();
    info!(environment = %opts.environment, queue = %opts.queue, "Starting watchdog");

    let store = PgStore::connect(&opts.database_url).await?;
    let watchdog = Watchdog::new(store, &opts.queue);

    let report = match &opts.probe_url {
        Some(url) => {
            let probe = HttpProbe::new(url, Duration::from_secs(opts.probe_timeout))?;
            run(watchdog.with_probe(probe), &opts).await
        }
        None => run(watchdog, &opts).await,
    };

    if opts.once {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(match report.overall {
        CheckStatus::Unhealthy => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

async fn run<S, P, A>(watchdog: Watchdog<S, P, A>, opts: &Opts) -> WatchdogReport
where
    S: docketq::store::QueueStore + docketq::store::OpsStore,
    P: docketq::watchdog::HealthProbe,
    A: docketq::watchdog::AlertSink,
{
    if opts.once {
        return watchdog.run_checks().await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c. Finishing up…");
            let _ = shutdown_tx.send(true);
        }
    });
    watchdog
        .run(Duration::from_secs(opts.interval), shutdown_rx)
        .await
}
