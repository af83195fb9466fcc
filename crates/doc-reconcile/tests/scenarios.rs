//! End-to-end reconciliation scenarios against the in-memory providers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use doc_reconcile::config::ReconcileConfig;
use doc_reconcile::processing::{LifecycleState, Notification, ProcessingOutcome};
use doc_reconcile::providers::{
    InMemoryExtractionJob, InMemoryMetadataStore, InMemoryObjectStore, MetadataStoreProvider,
    ObjectStoreProvider,
};
use doc_reconcile::storage::SqliteMetadataStore;
use doc_reconcile::{
    DocumentKind, DocumentRecord, Error, ExtractionResult, IngestService, RecordFilter,
    RecordPatch, UploadRequest,
};
use uuid::Uuid;

// ─── Helpers ────────────────────────────────────────────────────────────────

struct Harness {
    objects: Arc<InMemoryObjectStore>,
    metadata: Arc<InMemoryMetadataStore>,
    job: Arc<InMemoryExtractionJob>,
    service: IngestService,
}

fn test_config() -> ReconcileConfig {
    let mut config = ReconcileConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config
}

fn harness() -> Harness {
    harness_with(test_config())
}

fn harness_with(config: ReconcileConfig) -> Harness {
    let objects = Arc::new(InMemoryObjectStore::new());
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let job = Arc::new(InMemoryExtractionJob::new());
    let service = IngestService::new(config, objects.clone(), metadata.clone(), job.clone());
    Harness {
        objects,
        metadata,
        job,
        service,
    }
}

fn pdf(name: &str) -> UploadRequest {
    UploadRequest::new(name, "application/pdf", &b"%PDF-1.7 scenario"[..])
}

/// Let spawned fire-and-forget tasks run
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ─── Sync ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn sync_creates_one_record_for_orphan() {
    let h = harness();
    h.objects.insert_object("uploads/a.pdf", &b"%PDF"[..]);

    let report = h.service.sync().await.unwrap();
    assert_eq!(report.created, 1);

    let rows = h.metadata.query(&RecordFilter::all()).await.unwrap();
    let matching: Vec<_> = rows.iter().filter(|r| r.storage_key == "uploads/a.pdf").collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].document_kind, DocumentKind::Other);
    assert_eq!(h.service.state_of(matching[0]), LifecycleState::Uploaded);
    assert_eq!(h.service.sync_status().files_synced, 1);
}

#[tokio::test(start_paused = true)]
async fn sync_during_delete_does_not_resurrect() {
    let h = harness();
    let record = h.service.upload(pdf("contract.pdf")).await.unwrap();
    settle().await;

    // Object listing lags behind the delete
    h.objects.set_list_lag(3);
    h.service.delete_document(record.id, true).await.unwrap();

    let report = h.service.sync().await.unwrap();
    assert_eq!(report.created, 0);
    assert_eq!(report.skipped_tombstoned, 1);
    assert!(h.metadata.snapshot().is_empty());
}

// ─── Deletion & fetch ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn delete_then_concurrent_refreshes() {
    let h = harness();
    let doomed = h.service.upload(pdf("statement.pdf")).await.unwrap();
    let kept = h.service.upload(pdf("receipt.pdf")).await.unwrap();
    settle().await;
    h.metadata.set_query_delay(Some(Duration::from_millis(100)));

    // Reads keep returning the deleted row for a while
    h.metadata.set_read_lag(5);
    h.service.delete_document(doomed.id, true).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let before = h.service.fetch_count();
    let (a, b) = tokio::join!(h.service.refresh(), h.service.refresh());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(a.iter().all(|r| r.id != doomed.id));
    assert!(b.iter().all(|r| r.id != doomed.id));
    assert!(a.iter().any(|r| r.id == kept.id));
    assert!(h.service.fetch_count() - before <= 1);
}

#[tokio::test(start_paused = true)]
async fn reappeared_record_is_redeleted_once() {
    let h = harness();
    let record = h.service.upload(pdf("payslip.pdf")).await.unwrap();
    settle().await;

    h.service.delete_document(record.id, true).await.unwrap();

    // The delete did not reach the metadata store: the row comes back
    h.metadata.insert(&record).await.unwrap();
    h.metadata.set_query_delay(Some(Duration::from_millis(10)));
    let deletes_before = h.objects.delete_calls();

    tokio::time::advance(Duration::from_secs(2)).await;
    let list = h.service.refresh().await.unwrap();
    assert!(list.iter().all(|r| r.id != record.id));
    tokio::time::advance(Duration::from_secs(2)).await;
    let list = h.service.refresh().await.unwrap();
    assert!(list.iter().all(|r| r.id != record.id));
    settle().await;

    assert!(h.metadata.get(record.id).await.unwrap().is_none());
    assert_eq!(h.objects.delete_calls() - deletes_before, 1);
}

// ─── Lifecycle ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn stuck_sweep_notifies_once() {
    let mut config = test_config();
    config.lifecycle.stuck_threshold_secs = 300;
    let h = harness_with(config);
    let mut notifications = h.service.subscribe_notifications();

    let t0 = Utc::now() - chrono::Duration::seconds(301);
    let record = DocumentRecord::new(
        Uuid::new_v4(),
        "uploads/slow.pdf",
        "slow.pdf",
        1,
        "application/pdf",
        DocumentKind::Other,
    );
    h.metadata.insert(&record).await.unwrap();
    h.metadata
        .update(record.id, &RecordPatch::start_processing(t0))
        .await
        .unwrap();

    let first = h.service.sweep_stuck().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, record.id);

    let second = h.service.sweep_stuck().await.unwrap();
    assert!(second.is_empty());

    let stuck: Vec<_> = std::iter::from_fn(|| notifications.try_recv().ok())
        .filter(|n| matches!(n, Notification::Stuck(_)))
        .collect();
    assert_eq!(stuck.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn job_completion_arrives_through_change_feed() {
    let h = harness();
    let mut notifications = h.service.subscribe_notifications();
    let background = h.service.spawn_background();

    let record = h.service.upload(pdf("invoice-0042.pdf")).await.unwrap();
    settle().await;
    assert_eq!(h.job.invocations_for(record.id), 1);

    // The job writes its own outcome
    let result = ExtractionResult::success(serde_json::json!({"total": "99.00"}))
        .with_kind(DocumentKind::Invoice);
    h.metadata
        .update(record.id, &RecordPatch::complete(result, Utc::now()))
        .await
        .unwrap();
    settle().await;

    let mut seen = Vec::new();
    while let Ok(note) = notifications.try_recv() {
        seen.push(note);
    }
    assert!(seen.iter().any(|n| matches!(n, Notification::Uploaded { .. })));
    assert!(seen.iter().any(|n| matches!(n, Notification::ProcessingStarted { .. })));
    assert!(seen.iter().any(|n| matches!(n, Notification::Completed { id, .. } if *id == record.id)));

    background.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_document_can_be_retried() {
    let h = harness();
    let record = h.service.upload(pdf("scan.pdf")).await.unwrap();
    settle().await;

    h.metadata
        .update(record.id, &RecordPatch::fail("unreadable", Utc::now()))
        .await
        .unwrap();
    let stored = h.metadata.get(record.id).await.unwrap().unwrap();
    assert_eq!(h.service.state_of(&stored), LifecycleState::Failed);

    let outcome = h.service.retry_document(record.id).await.unwrap();
    assert!(matches!(outcome, ProcessingOutcome::Started(_)));
    assert_eq!(h.job.invocations_for(record.id), 2);

    let stored = h.metadata.get(record.id).await.unwrap().unwrap();
    assert_eq!(h.service.state_of(&stored), LifecycleState::Processing);
    assert!(stored.extraction_result.is_none());
}

#[tokio::test]
async fn upload_and_process_starts_job_before_returning() {
    let h = harness();
    let (record, outcome) = h.service.upload_and_process(pdf("w2_2024.pdf")).await.unwrap();

    // No settling: the job must already have been invoked
    assert!(matches!(outcome, ProcessingOutcome::Started(_)));
    assert_eq!(h.job.invocations_for(record.id), 1);
    let stored = h.metadata.get(record.id).await.unwrap().unwrap();
    assert_eq!(h.service.state_of(&stored), LifecycleState::Processing);
}

// ─── Upload failures ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn put_failure_leaves_no_metadata() {
    let h = harness();
    h.objects.fail_puts.set(100);

    let err = h.service.upload(pdf("a.pdf")).await.unwrap_err();
    assert!(err.is_exhausted());
    assert!(err.reason().contains("attempts"));
    assert!(h.metadata.query(&RecordFilter::all()).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn insert_failure_removes_object() {
    let h = harness();
    h.metadata.fail_inserts.set(100);

    let err = h.service.upload(pdf("a.pdf")).await.unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { .. }));
    assert!(h.objects.list("uploads/").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn retry_ceiling_is_not_exceeded() {
    let h = harness();
    h.objects.fail_puts.set(100);

    h.service.upload(pdf("a.pdf")).await.unwrap_err();
    assert_eq!(h.objects.put_calls(), 3);
}

// ─── SQLite backend ─────────────────────────────────────────────────────────

#[tokio::test]
async fn service_runs_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(SqliteMetadataStore::new(dir.path().join("meta.db")).unwrap());
    let objects = Arc::new(InMemoryObjectStore::new());
    let service = IngestService::new(
        test_config(),
        objects.clone(),
        metadata.clone(),
        Arc::new(InMemoryExtractionJob::new()),
    );

    objects.insert_object("uploads/bank_statement_may.pdf", &b"%PDF"[..]);
    let report = service.sync().await.unwrap();
    assert_eq!(report.created, 1);

    let rows = service.refresh().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].document_kind, DocumentKind::BankStatement);
}
