//! Upload Controller
//!
//! Two-phase commit of a new document: object write, then metadata insert.
//! A failure or cancellation after the object landed deletes it again, so
//! an upload never leaves an orphan behind for the reconciler.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{SyncConfig, UploadConfig};
use crate::error::{Error, Result};
use crate::providers::{MetadataStoreProvider, ObjectStoreProvider};
use crate::types::DocumentRecord;

use super::lifecycle::LifecycleManager;
use super::retry::RetryController;
use super::sync::classify;

/// A file to ingest
#[derive(Debug, Clone)]
pub struct UploadRequest {
    id: Uuid,
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl UploadRequest {
    /// New request with a freshly generated document id
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Id the record will carry; usable for `cancel` before the upload ends
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` so the name is a safe key segment
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

/// Unregisters the upload's token when it ends. An upload that never
/// committed also drops its retry counters.
struct Registered<'a> {
    tokens: &'a DashMap<Uuid, CancellationToken>,
    retry: &'a RetryController,
    id: Uuid,
    committed: bool,
}

impl Drop for Registered<'_> {
    fn drop(&mut self) {
        self.tokens.remove(&self.id);
        if !self.committed {
            self.retry.release_document(self.id);
        }
    }
}

/// Upload Controller
pub struct UploadController {
    objects: Arc<dyn ObjectStoreProvider>,
    metadata: Arc<dyn MetadataStoreProvider>,
    retry: Arc<RetryController>,
    lifecycle: Arc<LifecycleManager>,
    config: UploadConfig,
    sync_config: SyncConfig,
    ingest_prefix: String,
    /// One cancellation token per in-flight upload
    tokens: DashMap<Uuid, CancellationToken>,
}

impl UploadController {
    pub fn new(
        objects: Arc<dyn ObjectStoreProvider>,
        metadata: Arc<dyn MetadataStoreProvider>,
        retry: Arc<RetryController>,
        lifecycle: Arc<LifecycleManager>,
        config: UploadConfig,
        sync_config: SyncConfig,
        ingest_prefix: impl Into<String>,
    ) -> Self {
        Self {
            objects,
            metadata,
            retry,
            lifecycle,
            config,
            sync_config,
            ingest_prefix: ingest_prefix.into(),
            tokens: DashMap::new(),
        }
    }

    /// Reject a request before any network call
    pub fn validate(&self, request: &UploadRequest) -> Result<()> {
        let size = request.data.len() as u64;
        if size == 0 {
            return Err(Error::validation(format!("{} is empty", request.file_name)));
        }
        if size > self.config.max_file_size {
            return Err(Error::validation(format!(
                "{} is {} bytes, the limit is {} bytes",
                request.file_name, size, self.config.max_file_size
            )));
        }
        let accepted = self
            .config
            .accepted_mime_types
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&request.mime_type));
        if !accepted {
            return Err(Error::validation(format!(
                "{} has type {}, accepted: {}",
                request.file_name,
                request.mime_type,
                self.config.accepted_mime_types.join(", ")
            )));
        }
        Ok(())
    }

    /// Cancel an in-flight upload; `false` if it is not running
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.tokens.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of uploads still running
    pub fn in_flight(&self) -> Vec<Uuid> {
        self.tokens.iter().map(|entry| *entry.key()).collect()
    }

    /// Upload a document and start its extraction job
    ///
    /// Returns once the record is written. The job is started in the
    /// background; its outcome arrives through the change feed.
    pub async fn upload(&self, request: UploadRequest) -> Result<DocumentRecord> {
        let record = self.store(request).await?;

        let lifecycle = Arc::clone(&self.lifecycle);
        let id = record.id;
        tokio::spawn(async move {
            if let Err(e) = lifecycle.begin_processing(id).await {
                tracing::warn!("Could not start processing {}: {}", id, e);
            }
        });

        Ok(record)
    }

    /// Write the object and its record without starting the job
    pub async fn store(&self, request: UploadRequest) -> Result<DocumentRecord> {
        self.validate(&request)?;

        let id = request.id;
        let token = CancellationToken::new();
        match self.tokens.entry(id) {
            Entry::Occupied(_) => {
                return Err(Error::conflict(format!("upload {} already in flight", id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }
        let mut registered = Registered {
            tokens: &self.tokens,
            retry: &self.retry,
            id,
            committed: false,
        };

        let key = format!(
            "{}{}_{}",
            self.ingest_prefix,
            id,
            sanitize_file_name(&request.file_name)
        );
        let record = DocumentRecord::new(
            id,
            key.as_str(),
            request.file_name.as_str(),
            request.data.len() as u64,
            request.mime_type.as_str(),
            classify(
                &request.file_name,
                &self.sync_config.rules,
                self.sync_config.default_kind,
            ),
        );

        // Step 1: object write. Nothing to undo if it fails.
        let objects = &self.objects;
        let (data, mime_type) = (&request.data, request.mime_type.as_str());
        let put_kind = format!("object_put:{}", id);
        let put = self
            .retry
            .execute(&put_kind, || objects.put(&key, data.clone(), mime_type));
        if let Err(e) = cancellable(&token, put).await {
            if matches!(e, Error::Cancelled(_)) {
                // The write may have landed right before the cancel
                self.discard_object(id, &key).await;
            }
            tracing::warn!("Upload of {} aborted before metadata write: {}", request.file_name, e);
            return Err(e);
        }

        // Step 2: metadata insert, undone by deleting the object
        let metadata = &self.metadata;
        let row = &record;
        let insert_kind = format!("metadata_insert:{}", id);
        let insert = self
            .retry
            .execute(&insert_kind, || metadata.insert(row));
        let inserted = match cancellable(&token, insert).await {
            Err(Error::Conflict(reason)) => {
                if self.reconciled_concurrently(&record).await {
                    tracing::debug!("Record {} already created by sync: {}", id, reason);
                    Ok(())
                } else {
                    Err(Error::Conflict(reason))
                }
            }
            other => other,
        };
        match inserted {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Metadata insert for {} failed, removing object: {}", key, e);
                if matches!(e, Error::Cancelled(_)) {
                    if let Err(del) = self.metadata.delete(id).await {
                        tracing::warn!("Cleanup of record {} failed: {}", id, del);
                    }
                }
                self.discard_object(id, &key).await;
                return Err(e);
            }
        }

        registered.committed = true;
        tracing::info!("Uploaded {} as {} ({} bytes)", request.file_name, key, record.byte_size);
        Ok(record)
    }

    /// The reconciler may adopt the object between our put and insert
    async fn reconciled_concurrently(&self, record: &DocumentRecord) -> bool {
        matches!(
            self.metadata.get(record.id).await,
            Ok(Some(existing)) if existing.storage_key == record.storage_key
        )
    }

    async fn discard_object(&self, id: Uuid, key: &str) {
        let objects = &self.objects;
        let keys = [key.to_string()];
        let result = self
            .retry
            .execute(&format!("object_delete:{}", id), || objects.delete(&keys))
            .await;
        if let Err(e) = result {
            tracing::error!("Failed to remove object {} after aborted upload: {}", key, e);
        }
    }
}

/// Run `fut` unless the token fires first
async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled("upload".to_string())),
        result = fut => result,
    }
}
