//! Ingest service
//!
//! Owns and wires every reconciliation component. All shared state (the
//! tombstone set, the retry counters, the fetch cache) lives for as long as
//! the service does.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::error::{Error, Result};
use crate::processing::{
    ChangeFeedConsumer, DocumentDeleter, FetchCoordinator, LifecycleManager, LifecycleState,
    LifecycleSummary, Notification, ProcessingOutcome, Reconciler, Redeleter, RetryController,
    RetryPolicy, StuckNotice, StuckSweeper, SyncReport, SyncStatus, TombstoneTracker,
    UploadController, UploadRequest, NOTIFICATION_CAPACITY,
};
use crate::providers::{ExtractionJobProvider, MetadataStoreProvider, ObjectStoreProvider};
use crate::types::{DocumentRecord, RecordFilter};

/// Ingest service (cheap to clone)
#[derive(Clone)]
pub struct IngestService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: ReconcileConfig,
    objects: Arc<dyn ObjectStoreProvider>,
    metadata: Arc<dyn MetadataStoreProvider>,
    retry: Arc<RetryController>,
    tombstones: Arc<TombstoneTracker>,
    lifecycle: Arc<LifecycleManager>,
    uploads: UploadController,
    fetch: Arc<FetchCoordinator>,
    deleter: Arc<DocumentDeleter>,
    reconciler: Reconciler,
    sweeper: Arc<StuckSweeper>,
    consumer: Arc<ChangeFeedConsumer>,
    notifications: broadcast::Sender<Notification>,
}

/// Running background loops
pub struct BackgroundHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundHandle {
    /// Token that stops the loops when cancelled
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the loops and wait for them to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
    }
}

impl IngestService {
    /// Wire the components around the given collaborators
    pub fn new(
        config: ReconcileConfig,
        objects: Arc<dyn ObjectStoreProvider>,
        metadata: Arc<dyn MetadataStoreProvider>,
        job: Arc<dyn ExtractionJobProvider>,
    ) -> Self {
        tracing::info!(
            "Initializing ingest service (objects: {}, metadata: {}, job: {})",
            objects.name(),
            metadata.name(),
            job.name()
        );

        let threshold = config.lifecycle.stuck_threshold();
        let retry = Arc::new(RetryController::new(RetryPolicy::from(&config.retry)));
        let tombstones = Arc::new(TombstoneTracker::new());
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&metadata),
            Arc::clone(&job),
            Arc::clone(&retry),
            threshold,
        ));
        let uploads = UploadController::new(
            Arc::clone(&objects),
            Arc::clone(&metadata),
            Arc::clone(&retry),
            Arc::clone(&lifecycle),
            config.upload.clone(),
            config.sync.clone(),
            config.storage.ingest_prefix.clone(),
        );
        let fetch = Arc::new(FetchCoordinator::new(
            Arc::clone(&metadata),
            Arc::clone(&tombstones),
            Arc::clone(&retry),
            config.fetch.min_interval(),
        ));
        let deleter = Arc::new(DocumentDeleter::new(
            Arc::clone(&objects),
            Arc::clone(&metadata),
            Arc::clone(&tombstones),
            Arc::clone(&fetch),
            Arc::clone(&retry),
            threshold,
        ));
        let redeleter: Arc<dyn Redeleter> = deleter.clone();
        fetch.set_redeleter(Arc::downgrade(&redeleter));

        let reconciler = Reconciler::new(
            Arc::clone(&objects),
            Arc::clone(&metadata),
            Arc::clone(&tombstones),
            Arc::clone(&retry),
            config.storage.ingest_prefix.clone(),
            config.sync.clone(),
        );
        let sweeper = Arc::new(StuckSweeper::new(
            Arc::clone(&metadata),
            Arc::clone(&tombstones),
            threshold,
            notifications.clone(),
        ));
        let consumer = Arc::new(ChangeFeedConsumer::new(
            Arc::clone(&metadata),
            Arc::clone(&tombstones),
            threshold,
            notifications.clone(),
        ));

        Self {
            inner: Arc::new(ServiceInner {
                config,
                objects,
                metadata,
                retry,
                tombstones,
                lifecycle,
                uploads,
                fetch,
                deleter,
                reconciler,
                sweeper,
                consumer,
                notifications,
            }),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.inner.config
    }

    pub fn retry_controller(&self) -> &RetryController {
        &self.inner.retry
    }

    pub fn tombstones(&self) -> &TombstoneTracker {
        &self.inner.tombstones
    }

    // ==================== Uploads ====================

    /// Upload a document; extraction starts in the background
    pub async fn upload(&self, request: UploadRequest) -> Result<DocumentRecord> {
        self.inner.uploads.upload(request).await
    }

    /// Upload a document and wait until its extraction job is started
    pub async fn upload_and_process(
        &self,
        request: UploadRequest,
    ) -> Result<(DocumentRecord, ProcessingOutcome)> {
        let record = self.inner.uploads.store(request).await?;
        let outcome = self.inner.lifecycle.begin_processing(record.id).await?;
        Ok((record, outcome))
    }

    /// Cancel an in-flight upload
    pub fn cancel_upload(&self, id: Uuid) -> bool {
        self.inner.uploads.cancel(id)
    }

    // ==================== Lifecycle ====================

    /// Delete a document; `force` allows deleting an active job
    pub async fn delete_document(&self, id: Uuid, force: bool) -> Result<()> {
        let record = match self.inner.metadata.get(id).await? {
            Some(record) => record,
            // Still visible in the cached list, e.g. behind replica lag
            None => self
                .inner
                .fetch
                .cached()
                .and_then(|records| records.into_iter().find(|r| r.id == id))
                .ok_or_else(|| Error::not_found(format!("document {}", id)))?,
        };
        self.inner.deleter.delete(&record, force).await
    }

    /// Start extraction for an uploaded (or synced) document
    pub async fn begin_processing(&self, id: Uuid) -> Result<ProcessingOutcome> {
        self.inner.lifecycle.begin_processing(id).await
    }

    /// Retry a stuck or failed document
    pub async fn retry_document(&self, id: Uuid) -> Result<ProcessingOutcome> {
        self.inner.lifecycle.retry(id).await
    }

    /// Derived state of a record right now
    pub fn state_of(&self, record: &DocumentRecord) -> LifecycleState {
        self.inner.lifecycle.state_of(record)
    }

    /// Per-state counts for a record list
    pub fn summarize(&self, records: &[DocumentRecord]) -> LifecycleSummary {
        LifecycleSummary::from_records(records, Utc::now(), self.inner.lifecycle.stuck_threshold())
    }

    // ==================== Reads ====================

    /// Current record list, rate-limited and tombstone-filtered
    pub async fn refresh(&self) -> Result<Vec<DocumentRecord>> {
        self.inner.fetch.refresh().await
    }

    /// Number of store queries the fetch coordinator issued
    pub fn fetch_count(&self) -> usize {
        self.inner.fetch.fetch_count()
    }

    // ==================== Reconciliation ====================

    /// Create records for orphaned objects
    pub async fn sync(&self) -> Result<SyncReport> {
        self.inner.reconciler.sync().await
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.inner.reconciler.status()
    }

    /// Run one stuck sweep now
    pub async fn sweep_stuck(&self) -> Result<Vec<StuckNotice>> {
        self.inner.sweeper.sweep(Utc::now()).await
    }

    /// Whether both stores answer
    pub async fn health_check(&self) -> Result<bool> {
        let objects = self.inner.objects.health_check().await?;
        self.inner.metadata.query(&RecordFilter::by_id(Uuid::nil())).await?;
        Ok(objects)
    }

    // ==================== Notifications ====================

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Start the change-feed consumer and the periodic stuck sweep
    pub fn spawn_background(&self) -> BackgroundHandle {
        let shutdown = CancellationToken::new();
        let consumer = Arc::clone(&self.inner.consumer).spawn(shutdown.child_token());
        let sweeper = Arc::clone(&self.inner.sweeper).spawn(
            self.inner.config.lifecycle.sweep_interval(),
            shutdown.child_token(),
        );
        tracing::info!(
            "Background loops started (sweep every {:?}, stuck after {}s)",
            self.inner.config.lifecycle.sweep_interval(),
            self.inner.config.lifecycle.stuck_threshold_secs
        );
        BackgroundHandle {
            shutdown,
            tasks: vec![consumer, sweeper],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{InMemoryExtractionJob, InMemoryMetadataStore, InMemoryObjectStore};

    fn service() -> (IngestService, Arc<InMemoryMetadataStore>) {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let service = IngestService::new(
            ReconcileConfig::default(),
            Arc::new(InMemoryObjectStore::new()),
            metadata.clone(),
            Arc::new(InMemoryExtractionJob::new()),
        );
        (service, metadata)
    }

    #[tokio::test]
    async fn deleted_document_cannot_be_retried() {
        let (service, _) = service();
        let record = service
            .upload(UploadRequest::new("a.pdf", "application/pdf", &b"%PDF"[..]))
            .await
            .unwrap();
        service.delete_document(record.id, true).await.unwrap();

        let err = service.retry_document(record.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(service.refresh().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delete_leaves_document_addressable() {
        let (service, metadata) = service();
        let record = service
            .upload(UploadRequest::new("a.pdf", "application/pdf", &b"%PDF"[..]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        metadata.fail_deletes.set(100);
        assert!(service.delete_document(record.id, true).await.is_err());
        assert!(metadata.get(record.id).await.unwrap().is_some());

        // Hidden from listings, but the store still decides what exists
        assert!(service.refresh().await.unwrap().is_empty());
        let outcome = service.retry_document(record.id).await.unwrap();
        assert!(matches!(outcome, ProcessingOutcome::AlreadyProcessing));
    }

    #[tokio::test]
    async fn sync_runs_on_a_spawned_task() {
        let (service, _) = service();
        let task = tokio::spawn({
            let service = service.clone();
            async move { service.sync().await }
        });
        assert_eq!(task.await.unwrap().unwrap().created, 0);
    }

    #[tokio::test]
    async fn background_loops_stop_on_shutdown() {
        let (service, _) = service();
        let mut notes = service.subscribe_notifications();
        let handle = service.spawn_background();

        let record = service
            .upload(UploadRequest::new("receipt.pdf", "application/pdf", &b"%PDF"[..]))
            .await
            .unwrap();
        let first = notes.recv().await.unwrap();
        assert_eq!(first.id(), record.id);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn health_check_reports_ok() {
        let (service, _) = service();
        assert!(service.health_check().await.unwrap());
    }
}
