//! Document deletion
//!
//! The id is tombstoned and dropped from the cached list before any network
//! call, then the object and the record are deleted with retries.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::providers::{MetadataStoreProvider, ObjectStoreProvider};
use crate::types::DocumentRecord;

use super::fetch::FetchCoordinator;
use super::lifecycle::LifecycleState;
use super::retry::RetryController;
use super::tombstone::{Redeleter, TombstoneTracker};

/// Deletes documents from both stores
pub struct DocumentDeleter {
    objects: Arc<dyn ObjectStoreProvider>,
    metadata: Arc<dyn MetadataStoreProvider>,
    tombstones: Arc<TombstoneTracker>,
    fetch: Arc<FetchCoordinator>,
    retry: Arc<RetryController>,
    stuck_threshold: chrono::Duration,
}

impl DocumentDeleter {
    pub fn new(
        objects: Arc<dyn ObjectStoreProvider>,
        metadata: Arc<dyn MetadataStoreProvider>,
        tombstones: Arc<TombstoneTracker>,
        fetch: Arc<FetchCoordinator>,
        retry: Arc<RetryController>,
        stuck_threshold: chrono::Duration,
    ) -> Self {
        Self {
            objects,
            metadata,
            tombstones,
            fetch,
            retry,
            stuck_threshold,
        }
    }

    /// Delete a document
    ///
    /// A record whose job is still running (and not stuck) is refused with
    /// `InvalidTransition` unless `force` is set.
    pub async fn delete(&self, record: &DocumentRecord, force: bool) -> Result<()> {
        let state = LifecycleState::derive(record, Utc::now(), self.stuck_threshold);
        if !state.can_delete(force) {
            return Err(Error::InvalidTransition {
                from: state.as_str().to_string(),
                event: "delete".to_string(),
            });
        }

        self.tombstones.mark_deleted(record.id, &record.storage_key);
        self.fetch.forget(record.id);
        tracing::info!("Deleting {} ({}, was {})", record.id, record.storage_key, state);

        self.purge(record.id, &record.storage_key).await?;
        self.retry.release_document(record.id);
        Ok(())
    }

    /// Delete the object, then the record
    ///
    /// Both deletes are attempted even if the first fails; the first error
    /// is returned.
    async fn purge(&self, id: Uuid, storage_key: &str) -> Result<()> {
        let objects = &self.objects;
        let keys = [storage_key.to_string()];
        let object_result = self
            .retry
            .execute(&format!("object_delete:{}", id), || objects.delete(&keys))
            .await;

        let metadata = &self.metadata;
        let record_result = self
            .retry
            .execute(&format!("metadata_delete:{}", id), || metadata.delete(id))
            .await;

        if let Err(e) = &object_result {
            tracing::error!("Failed to delete object {}: {}", storage_key, e);
        }
        match record_result {
            Ok(false) => tracing::debug!("Record {} was already gone", id),
            Ok(true) => {}
            Err(ref e) => tracing::error!("Failed to delete record {}: {}", id, e),
        }

        object_result?;
        record_result.map(|_| ())
    }
}

#[async_trait]
impl Redeleter for DocumentDeleter {
    async fn redelete(&self, id: Uuid, storage_key: &str) -> Result<()> {
        tracing::info!("Re-deleting {} ({})", id, storage_key);
        self.purge(id, storage_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::retry::RetryPolicy;
    use crate::providers::{InMemoryMetadataStore, InMemoryObjectStore};
    use crate::types::{DocumentKind, RecordPatch};
    use std::time::Duration;

    struct Fixture {
        objects: Arc<InMemoryObjectStore>,
        metadata: Arc<InMemoryMetadataStore>,
        tombstones: Arc<TombstoneTracker>,
        fetch: Arc<FetchCoordinator>,
        retry: Arc<RetryController>,
        deleter: DocumentDeleter,
    }

    fn fixture() -> Fixture {
        let objects = Arc::new(InMemoryObjectStore::new());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let tombstones = Arc::new(TombstoneTracker::new());
        let retry = Arc::new(RetryController::new(RetryPolicy::fixed(
            3,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )));
        let fetch = Arc::new(FetchCoordinator::new(
            metadata.clone(),
            tombstones.clone(),
            retry.clone(),
            Duration::from_secs(1),
        ));
        let deleter = DocumentDeleter::new(
            objects.clone(),
            metadata.clone(),
            tombstones.clone(),
            fetch.clone(),
            retry.clone(),
            chrono::Duration::seconds(300),
        );
        Fixture {
            objects,
            metadata,
            tombstones,
            fetch,
            retry,
            deleter,
        }
    }

    async fn seed(f: &Fixture) -> DocumentRecord {
        let id = Uuid::new_v4();
        let key = format!("uploads/{}_a.pdf", id);
        f.objects.insert_object(&key, &b"%PDF"[..]);
        let rec = DocumentRecord::new(id, key, "a.pdf", 4, "application/pdf", DocumentKind::Other);
        f.metadata.insert(&rec).await.unwrap();
        rec
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_both_sides_and_tombstones() {
        let f = fixture();
        let rec = seed(&f).await;
        f.fetch.refresh().await.unwrap();

        f.deleter.delete(&rec, false).await.unwrap();
        assert!(f.tombstones.is_tombstoned(rec.id));
        assert_eq!(f.retry.tracked_kinds(), 0);
        assert!(f.fetch.cached().unwrap().is_empty());
        assert!(!f.objects.contains(&rec.storage_key));
        assert!(f.metadata.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn active_processing_blocks_unforced_delete() {
        let f = fixture();
        let rec = seed(&f).await;
        let rec = f
            .metadata
            .update(rec.id, &RecordPatch::start_processing(Utc::now()))
            .await
            .unwrap();

        let err = f.deleter.delete(&rec, false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(!f.tombstones.is_tombstoned(rec.id));

        f.deleter.delete(&rec, true).await.unwrap();
        assert!(f.metadata.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_delete_failures_are_retried() {
        let f = fixture();
        let rec = seed(&f).await;
        f.objects.fail_deletes.set(2);
        f.metadata.fail_deletes.set(1);

        f.deleter.delete(&rec, false).await.unwrap();
        assert!(!f.objects.contains(&rec.storage_key));
        assert!(f.metadata.snapshot().is_empty());
    }
}
