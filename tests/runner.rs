//! End-to-end tests for the runner: dispatch, idempotent replay, poison
//! handling, retry, panic capture, crash recovery, and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use claims::{assert_none, assert_some};
use docketq::store::{OpsStore, QueueStore};
use docketq::{
    Enqueued, JobEnvelope, JobHandler, MemoryStore, MessageStatus, NewMessage, Runner,
    WorkerStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Clone, Default)]
struct TestContext {
    runs: Arc<AtomicUsize>,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[derive(Serialize, Deserialize)]
struct Recorded {}

impl JobHandler for Recorded {
    const JOB_TYPE: &'static str = "recorded";
    type Context = TestContext;

    async fn run(&self, _envelope: &JobEnvelope, ctx: TestContext) -> anyhow::Result<()> {
        ctx.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct AlwaysFails {}

impl JobHandler for AlwaysFails {
    const JOB_TYPE: &'static str = "always_fails";
    type Context = TestContext;

    async fn run(&self, _envelope: &JobEnvelope, _ctx: TestContext) -> anyhow::Result<()> {
        anyhow::bail!("downstream unavailable")
    }
}

#[derive(Serialize, Deserialize)]
struct Panics {}

impl JobHandler for Panics {
    const JOB_TYPE: &'static str = "panics";
    type Context = TestContext;

    async fn run(&self, _envelope: &JobEnvelope, _ctx: TestContext) -> anyhow::Result<()> {
        panic!("boom")
    }
}

/// Blocks until released so tests can observe in-flight work.
#[derive(Serialize, Deserialize)]
struct Blocking {}

impl JobHandler for Blocking {
    const JOB_TYPE: &'static str = "blocking";
    type Context = TestContext;

    async fn run(&self, _envelope: &JobEnvelope, ctx: TestContext) -> anyhow::Result<()> {
        ctx.started.notify_one();
        ctx.release.notified().await;
        ctx.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn message(job_type: &str, key: &str) -> NewMessage {
    let envelope = JobEnvelope::new(Uuid::new_v4(), "plaintiff", "123", key);
    NewMessage::new(job_type, envelope).unwrap()
}

fn fast(queue: docketq::Queue<TestContext>) -> docketq::Queue<TestContext> {
    queue
        .poll_interval(Duration::from_millis(10))
        .jitter(Duration::from_millis(5))
}

#[tokio::test]
async fn runner_drains_the_queue_and_commits() {
    let store = MemoryStore::new();
    let ctx = TestContext::default();
    for key in ["k-1", "k-2", "k-3"] {
        store.enqueue(&message("recorded", key)).await.unwrap();
    }

    Runner::new(Arc::clone(&store), ctx.clone())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).num_workers(2).register_job_type::<Recorded>())
        .start()
        .wait_for_shutdown()
        .await;

    assert_eq!(ctx.runs.load(Ordering::SeqCst), 3);
    for key in ["k-1", "k-2", "k-3"] {
        assert!(store.is_processed("recorded", key).await.unwrap());
    }
    assert_none!(store.claim("default", &[], Duration::from_secs(1), "w").await.unwrap());
}

#[tokio::test]
async fn duplicate_enqueues_run_exactly_once() {
    let store = MemoryStore::new();
    let ctx = TestContext::default();

    let outcome = store
        .enqueue_idempotent(&message("recorded", "plaintiff:123:intake"))
        .await
        .unwrap();
    assert!(matches!(outcome, Enqueued::Created(_)));

    Runner::new(Arc::clone(&store), ctx.clone())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).register_job_type::<Recorded>())
        .start()
        .wait_for_shutdown()
        .await;

    assert_eq!(ctx.runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        store
            .enqueue_idempotent(&message("recorded", "plaintiff:123:intake"))
            .await
            .unwrap(),
        Enqueued::Completed
    );
}

#[tokio::test]
async fn replayed_messages_ack_without_running_the_handler() {
    let store = MemoryStore::new();
    let ctx = TestContext::default();

    let id = store.enqueue(&message("recorded", "k-1")).await.unwrap();
    // The key completed elsewhere; the queued row is a replay.
    store.mark_processed("recorded", "k-1").await.unwrap();

    Runner::new(Arc::clone(&store), ctx.clone())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).register_job_type::<Recorded>())
        .start()
        .wait_for_shutdown()
        .await;

    assert_eq!(ctx.runs.load(Ordering::SeqCst), 0);
    assert_none!(store.message(id).await.unwrap());
}

#[tokio::test]
async fn poison_envelopes_are_dead_lettered_without_retry() {
    let store = MemoryStore::new();
    let ctx = TestContext::default();

    // No org_id: fails envelope validation at the worker.
    let id = store
        .enqueue(&NewMessage::from_raw(
            "recorded",
            "poison-1",
            json!({"idempotency_key": "poison-1"}),
        ))
        .await
        .unwrap();

    Runner::new(Arc::clone(&store), ctx.clone())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).register_job_type::<Recorded>())
        .start()
        .wait_for_shutdown()
        .await;

    assert_eq!(ctx.runs.load(Ordering::SeqCst), 0);
    let row = assert_some!(store.message(id).await.unwrap());
    assert_eq!(row.status, MessageStatus::Failed);
    let last_error = assert_some!(row.last_error);
    assert!(
        last_error.starts_with("envelope validation failed"),
        "got {last_error:?}"
    );
    assert_eq!(store.dlq_depth("default").await.unwrap(), 1);
}

#[tokio::test]
async fn handler_failures_are_rescheduled_with_backoff() {
    let store = MemoryStore::new();
    let id = store.enqueue(&message("always_fails", "k-1")).await.unwrap();

    Runner::new(Arc::clone(&store), TestContext::default())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).register_job_type::<AlwaysFails>())
        .start()
        .wait_for_shutdown()
        .await;

    // One failed try, then the worker found a backed-off queue and drained.
    let row = assert_some!(store.message(id).await.unwrap());
    assert_eq!(row.status, MessageStatus::Pending);
    assert_eq!(row.attempts, 1);
    assert!(row.last_error.unwrap().contains("downstream unavailable"));
}

#[tokio::test]
async fn exhausted_handlers_end_up_in_the_dlq() {
    let store = MemoryStore::new();
    let id = store
        .enqueue(&message("always_fails", "k-1").max_attempts(1))
        .await
        .unwrap();

    Runner::new(Arc::clone(&store), TestContext::default())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).register_job_type::<AlwaysFails>())
        .start()
        .wait_for_shutdown()
        .await;

    let row = assert_some!(store.message(id).await.unwrap());
    assert_eq!(row.status, MessageStatus::Failed);
    assert_eq!(store.dlq_depth("default").await.unwrap(), 1);
}

#[tokio::test]
async fn panics_are_caught_and_treated_as_failures() {
    let store = MemoryStore::new();
    let id = store
        .enqueue(&message("panics", "k-1").max_attempts(1))
        .await
        .unwrap();

    Runner::new(Arc::clone(&store), TestContext::default())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).register_job_type::<Panics>())
        .start()
        .wait_for_shutdown()
        .await;

    let row = assert_some!(store.message(id).await.unwrap());
    assert_eq!(row.status, MessageStatus::Failed);
    let last_error = assert_some!(row.last_error);
    assert!(last_error.contains("job panicked: boom"), "got {last_error:?}");
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_work() {
    let store = MemoryStore::new();
    let ctx = TestContext::default();
    let id = store.enqueue(&message("blocking", "k-1")).await.unwrap();

    let handle = Runner::new(Arc::clone(&store), ctx.clone())
        .configure_default_queue(|queue| fast(queue).register_job_type::<Blocking>())
        .start();

    // Wait for the handler to be in flight, then drain.
    ctx.started.notified().await;
    ctx.release.notify_one();
    handle.shutdown(Duration::from_secs(5)).await;

    assert_eq!(ctx.runs.load(Ordering::SeqCst), 1);
    assert_none!(store.message(id).await.unwrap());
    assert!(store.is_processed("blocking", "k-1").await.unwrap());
}

#[tokio::test]
async fn crashed_lease_is_reaped_retried_and_replay_proof() {
    let store = MemoryStore::new();
    let ctx = TestContext::default();
    let key = "plaintiff:123:intake";

    let id = match store
        .enqueue_idempotent(&message("recorded", key))
        .await
        .unwrap()
    {
        Enqueued::Created(id) => id,
        other => panic!("expected a fresh row, got {other:?}"),
    };

    // A worker claims the message and dies without acking.
    assert_some!(
        store
            .claim("default", &[], Duration::from_secs(300), "crashed-worker")
            .await
            .unwrap()
    );
    let report = store.reap(Duration::ZERO).await.unwrap();
    assert_eq!(report.recovered, vec![id]);

    // Operator retries immediately instead of waiting out the backoff.
    store.retry_now(id).await.unwrap();

    Runner::new(Arc::clone(&store), ctx.clone())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).register_job_type::<Recorded>())
        .start()
        .wait_for_shutdown()
        .await;

    assert_eq!(ctx.runs.load(Ordering::SeqCst), 1);
    assert!(store.is_processed("recorded", key).await.unwrap());
    assert_eq!(
        store.enqueue_idempotent(&message("recorded", key)).await.unwrap(),
        Enqueued::Completed
    );
}

#[tokio::test]
async fn queue_empty_shutdown_also_stops_the_reaper() {
    let store = MemoryStore::new();
    let ctx = TestContext::default();
    store.enqueue(&message("recorded", "k-1")).await.unwrap();

    // The reaper runs until signalled; draining the queue must still end
    // wait_for_shutdown instead of joining a task that never exits.
    let drained = Runner::new(Arc::clone(&store), ctx.clone())
        .shutdown_when_queue_empty()
        .with_reaper(Duration::from_secs(300))
        .configure_default_queue(|queue| fast(queue).register_job_type::<Recorded>())
        .start()
        .wait_for_shutdown();
    tokio::time::timeout(Duration::from_secs(5), drained)
        .await
        .expect("draining the queue must also stop the reaper");

    assert_eq!(ctx.runs.load(Ordering::SeqCst), 1);
    assert!(store.is_processed("recorded", "k-1").await.unwrap());
}

#[tokio::test]
async fn runner_reports_heartbeats_and_a_final_stopped_row() {
    let store = MemoryStore::new();

    Runner::new(Arc::clone(&store), TestContext::default())
        .instance_id("runner-1")
        .shutdown_when_queue_empty()
        .with_heartbeat_interval("queue-worker", Duration::from_millis(50))
        .configure_default_queue(|queue| fast(queue).register_job_type::<Recorded>())
        .start()
        .wait_for_shutdown()
        .await;

    let rows = store.list_heartbeats().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].worker_id, "runner-1");
    assert_eq!(rows[0].worker_type, "queue-worker");
    assert_eq!(rows[0].status, WorkerStatus::Stopped);
}

#[tokio::test]
async fn workers_only_claim_their_registered_job_types() {
    let store = MemoryStore::new();
    let ctx = TestContext::default();
    store.enqueue(&message("recorded", "k-1")).await.unwrap();
    let other = store.enqueue(&message("unhandled", "k-2")).await.unwrap();

    Runner::new(Arc::clone(&store), ctx.clone())
        .shutdown_when_queue_empty()
        .configure_default_queue(|queue| fast(queue).register_job_type::<Recorded>())
        .start()
        .wait_for_shutdown()
        .await;

    assert_eq!(ctx.runs.load(Ordering::SeqCst), 1);
    // The unregistered message is untouched for another pool to claim.
    let row = assert_some!(store.message(other).await.unwrap());
    assert_eq!(row.status, MessageStatus::Pending);
    assert_eq!(row.attempts, 0);
}
