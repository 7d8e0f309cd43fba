//! Tests for the ingestion moat: batch claim exclusivity, duplicate
//! suppression, stale reclaim, finalize, reconcile, and rollback.

use std::time::Duration;

use claims::{assert_matches, assert_some};
use docketq::store::ImportLedger;
use docketq::{
    ClaimOutcome, ImportCounts, ImportSpec, ImportStatus, MemoryStore, MoatClient, StoreError,
};
use uuid::Uuid;

fn spec(batch: &str) -> ImportSpec {
    ImportSpec {
        source_system: "courtlink".to_owned(),
        source_batch_id: batch.to_owned(),
        file_hash: format!("sha256:{batch}"),
        filename: format!("{batch}.csv"),
        import_kind: "accounts".to_owned(),
    }
}

fn counts(inserted: i32) -> ImportCounts {
    ImportCounts {
        rows_fetched: inserted + 2,
        rows_inserted: inserted,
        rows_skipped: 2,
        rows_errored: 0,
    }
}

#[tokio::test]
async fn claiming_a_new_batch_succeeds() {
    let moat = MoatClient::new(MemoryStore::new());

    let outcome = moat.claim(&spec("2026-08-01"), "importer-1").await.unwrap();
    let run = match outcome {
        ClaimOutcome::Claimed(run) => run,
        other => panic!("expected a claim, got {other:?}"),
    };
    assert_eq!(run.status, ImportStatus::Claimed);
    assert_eq!(run.worker_id, "importer-1");
    assert_eq!(run.spec.source_batch_id, "2026-08-01");
}

#[tokio::test]
async fn completed_batches_answer_duplicate() {
    let moat = MoatClient::new(MemoryStore::new());

    let ClaimOutcome::Claimed(run) = moat.claim(&spec("b-1"), "importer-1").await.unwrap() else {
        panic!("first claim must win");
    };
    moat.finalize(run.run_id, counts(10), None, true).await.unwrap();

    let outcome = moat.claim(&spec("b-1"), "importer-2").await.unwrap();
    assert_matches!(outcome, ClaimOutcome::Duplicate { run_id } if run_id == run.run_id);
}

#[tokio::test]
async fn a_changed_file_hash_is_a_new_batch() {
    let moat = MoatClient::new(MemoryStore::new());

    let ClaimOutcome::Claimed(first) = moat.claim(&spec("b-1"), "importer-1").await.unwrap()
    else {
        panic!("first claim must win");
    };
    moat.finalize(first.run_id, counts(10), None, true).await.unwrap();

    // Same batch id, corrected file contents: a distinct identity.
    let mut resubmitted = spec("b-1");
    resubmitted.file_hash = "sha256:corrected".to_owned();
    let outcome = moat.claim(&resubmitted, "importer-1").await.unwrap();
    assert_matches!(outcome, ClaimOutcome::Claimed(run) if run.run_id != first.run_id);
}

#[tokio::test]
async fn a_live_claim_blocks_other_workers() {
    let moat = MoatClient::new(MemoryStore::new());

    let ClaimOutcome::Claimed(run) = moat.claim(&spec("b-1"), "importer-1").await.unwrap() else {
        panic!("first claim must win");
    };

    let outcome = moat.claim(&spec("b-1"), "importer-2").await.unwrap();
    assert_matches!(outcome, ClaimOutcome::InProgress { run_id, .. } if run_id == run.run_id);
}

#[tokio::test]
async fn stale_claims_are_reassigned_with_a_stable_run_id() {
    let store = MemoryStore::new();
    let moat = MoatClient::new(store.clone()).stale_after(Duration::ZERO);

    let ClaimOutcome::Claimed(run) = moat.claim(&spec("b-1"), "importer-1").await.unwrap() else {
        panic!("first claim must win");
    };

    // Everything is instantly stale, so the second worker takes over.
    let outcome = moat.claim(&spec("b-1"), "importer-2").await.unwrap();
    let reclaimed = match outcome {
        ClaimOutcome::Claimed(run) => run,
        other => panic!("expected a stale reclaim, got {other:?}"),
    };
    assert_eq!(reclaimed.run_id, run.run_id);
    assert_eq!(reclaimed.worker_id, "importer-2");
    assert_eq!(reclaimed.status, ImportStatus::Claimed);
}

#[tokio::test]
async fn heartbeat_moves_the_run_to_processing() {
    let store = MemoryStore::new();
    let moat = MoatClient::new(store.clone());

    let ClaimOutcome::Claimed(run) = moat.claim(&spec("b-1"), "importer-1").await.unwrap() else {
        panic!("first claim must win");
    };
    moat.heartbeat(run.run_id).await.unwrap();

    let row = assert_some!(store.import_run(run.run_id).await.unwrap());
    assert_eq!(row.status, ImportStatus::Processing);
    assert!(row.heartbeat_at >= run.heartbeat_at);
}

#[tokio::test]
async fn failed_finalize_records_counts_and_errors() {
    let store = MemoryStore::new();
    let moat = MoatClient::new(store.clone());

    let ClaimOutcome::Claimed(run) = moat.claim(&spec("b-1"), "importer-1").await.unwrap() else {
        panic!("first claim must win");
    };
    moat.finalize(run.run_id, counts(7), Some("3 rows failed validation"), false)
        .await
        .unwrap();

    let row = assert_some!(store.import_run(run.run_id).await.unwrap());
    assert_eq!(row.status, ImportStatus::Failed);
    assert_eq!(row.counts.rows_inserted, 7);
    assert_eq!(row.error_details.as_deref(), Some("3 rows failed validation"));
    assert_some!(row.finished_at);

    // A failed run does not hold the batch forever; is_live is false, so
    // a later claim starts fresh.
    let outcome = moat.claim(&spec("b-1"), "importer-2").await.unwrap();
    assert_matches!(outcome, ClaimOutcome::Claimed(next) if next.run_id != run.run_id);
}

#[tokio::test]
async fn reconcile_compares_expected_against_recorded() {
    let moat = MoatClient::new(MemoryStore::new());

    let ClaimOutcome::Claimed(run) = moat.claim(&spec("b-1"), "importer-1").await.unwrap() else {
        panic!("first claim must win");
    };
    moat.finalize(run.run_id, counts(10), None, true).await.unwrap();

    let result = moat.reconcile(run.run_id, Some(10)).await.unwrap();
    assert!(result.matched);
    assert_eq!(result.actual, 10);

    let result = moat.reconcile(run.run_id, Some(12)).await.unwrap();
    assert!(!result.matched);
    assert_eq!(result.expected, Some(12));
    assert_eq!(result.actual, 10);

    // No expectation means nothing to dispute.
    let result = moat.reconcile(run.run_id, None).await.unwrap();
    assert!(result.matched);
}

#[tokio::test]
async fn reconcile_rejects_unknown_runs() {
    let moat = MoatClient::new(MemoryStore::new());
    let missing = Uuid::new_v4();
    let result = moat.reconcile(missing, Some(1)).await;
    assert_matches!(result, Err(StoreError::ImportRunNotFound(id)) if id == missing);
}

#[tokio::test]
async fn rollback_preserves_the_audit_trail() {
    let store = MemoryStore::new();
    let moat = MoatClient::new(store.clone());

    let ClaimOutcome::Claimed(run) = moat.claim(&spec("b-1"), "importer-1").await.unwrap() else {
        panic!("first claim must win");
    };
    moat.finalize(run.run_id, counts(10), None, true).await.unwrap();
    moat.rollback(run.run_id, "wrong column mapping").await.unwrap();

    let row = assert_some!(store.import_run(run.run_id).await.unwrap());
    assert_eq!(row.status, ImportStatus::RolledBack);
    assert_eq!(row.rollback_reason.as_deref(), Some("wrong column mapping"));
    // Counts survive the rollback for the audit record.
    assert_eq!(row.counts.rows_inserted, 10);

    // Rolled back is terminal but not completed: the batch is claimable again.
    let outcome = moat.claim(&spec("b-1"), "importer-2").await.unwrap();
    assert_matches!(outcome, ClaimOutcome::Claimed(_));
}
