//! Storage/Metadata Reconciler
//!
//! Lists the object store under the ingest prefix, diffs it against the
//! metadata records and creates records for orphaned objects. Records whose
//! object is missing are only reported.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{ClassificationRule, SyncConfig};
use crate::error::{Error, Result};
use crate::providers::{MetadataStoreProvider, ObjectInfo, ObjectStoreProvider};
use crate::types::{DocumentKind, DocumentRecord, RecordFilter};

use super::retry::RetryController;
use super::tombstone::TombstoneTracker;

/// Orphans adopted concurrently during one sync
const ADOPT_CONCURRENCY: usize = 4;

/// Infer a document kind from a key or file name
///
/// Case-insensitive substring match, first rule wins, `default` otherwise.
pub fn classify(key: &str, rules: &[ClassificationRule], default: DocumentKind) -> DocumentKind {
    let key = key.to_lowercase();
    rules
        .iter()
        .find(|rule| !rule.pattern.is_empty() && key.contains(&rule.pattern.to_lowercase()))
        .map(|rule| rule.kind)
        .unwrap_or(default)
}

/// Split an uploaded file name `{uuid}_{name}` into its parts
pub fn parse_object_name(file_name: &str) -> (Option<Uuid>, &str) {
    if let Some((head, rest)) = file_name.split_once('_') {
        if let Ok(id) = Uuid::parse_str(head) {
            if !rest.is_empty() {
                return (Some(id), rest);
            }
        }
    }
    (None, file_name)
}

/// Outcome of one sync run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncReport {
    /// Records created for orphaned objects
    pub created: usize,
    /// Keys of the orphaned objects found
    pub orphans: Vec<String>,
    /// Keys of records whose object is not listed
    pub missing_objects: Vec<String>,
    /// Listed objects hidden by a tombstone
    pub skipped_tombstoned: usize,
    /// Orphans whose record could not be written
    pub failed: usize,
    pub duration: Duration,
}

/// Status of the last completed sync
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub files_synced: usize,
    pub duration_ms: u64,
}

/// Resets the running flag when the sync ends
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Storage/Metadata Reconciler
pub struct Reconciler {
    objects: Arc<dyn ObjectStoreProvider>,
    metadata: Arc<dyn MetadataStoreProvider>,
    tombstones: Arc<TombstoneTracker>,
    retry: Arc<RetryController>,
    ingest_prefix: String,
    config: SyncConfig,
    running: AtomicBool,
    status: Mutex<SyncStatus>,
}

impl Reconciler {
    pub fn new(
        objects: Arc<dyn ObjectStoreProvider>,
        metadata: Arc<dyn MetadataStoreProvider>,
        tombstones: Arc<TombstoneTracker>,
        retry: Arc<RetryController>,
        ingest_prefix: impl Into<String>,
        config: SyncConfig,
    ) -> Self {
        Self {
            objects,
            metadata,
            tombstones,
            retry,
            ingest_prefix: ingest_prefix.into(),
            config,
            running: AtomicBool::new(false),
            status: Mutex::new(SyncStatus::default()),
        }
    }

    /// Kind for a key under the configured rules
    pub fn classify(&self, key: &str) -> DocumentKind {
        classify(key, &self.config.rules, self.config.default_kind)
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Reconcile storage and metadata once
    pub async fn sync(&self) -> Result<SyncReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::conflict("sync already in progress"));
        }
        let _running = Running(&self.running);
        let started = Instant::now();

        let objects = &self.objects;
        let prefix = self.ingest_prefix.as_str();
        let listed = self
            .retry
            .execute("object_list", || objects.list(prefix))
            .await?;

        let metadata = &self.metadata;
        let all = RecordFilter::all();
        let records = self
            .retry
            .execute("sync_query", || metadata.query(&all))
            .await?;

        let listed_count = listed.len();
        let visible = self.tombstones.filter_objects(listed);
        let mut report = SyncReport {
            skipped_tombstoned: listed_count - visible.len(),
            ..Default::default()
        };

        let known: HashSet<&str> = records.iter().map(|r| r.storage_key.as_str()).collect();
        let present: HashSet<&str> = visible.iter().map(|o| o.key.as_str()).collect();

        for record in self.tombstones.filter(records.clone()) {
            if record.storage_key.starts_with(prefix) && !present.contains(record.storage_key.as_str()) {
                tracing::warn!(
                    "Record {} references missing object {}",
                    record.id,
                    record.storage_key
                );
                report.missing_objects.push(record.storage_key);
            }
        }

        let orphans: Vec<ObjectInfo> = visible
            .iter()
            .filter(|o| !known.contains(o.key.as_str()))
            .cloned()
            .collect();

        report.orphans = orphans.iter().map(|o| o.key.clone()).collect();
        let outcomes: Vec<(ObjectInfo, Result<bool>)> = stream::iter(orphans)
            .map(|object| async move {
                let outcome = self.adopt(&object).await;
                (object, outcome)
            })
            .buffer_unordered(ADOPT_CONCURRENCY)
            .collect()
            .await;

        for (object, outcome) in outcomes {
            match outcome {
                Ok(true) => report.created += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Failed to create record for orphan {}: {}", object.key, e);
                    report.failed += 1;
                }
            }
        }

        report.duration = started.elapsed();
        *self.status.lock() = SyncStatus {
            last_sync_at: Some(Utc::now()),
            files_synced: report.created,
            duration_ms: report.duration.as_millis() as u64,
        };

        tracing::info!(
            "Sync complete: {} orphans, {} records created, {} missing objects in {:?}",
            report.orphans.len(),
            report.created,
            report.missing_objects.len(),
            report.duration
        );
        Ok(report)
    }

    /// Insert a record for an orphan
    ///
    /// `false` when someone else already did, or when a delete tombstoned
    /// the object before the insert finished.
    async fn adopt(&self, object: &ObjectInfo) -> Result<bool> {
        let (parsed_id, display_name) = parse_object_name(object.file_name());
        let id = parsed_id.unwrap_or_else(Uuid::new_v4);
        if self.deleted_meanwhile(id, &object.key) {
            return Ok(false);
        }
        let mime_type = object
            .content_type
            .clone()
            .or_else(|| mime_guess::from_path(&object.key).first().map(|m| m.to_string()))
            .unwrap_or_else(|| "application/octet-stream".to_string());

        // Classify on the key without the generated id segment
        let directory = &object.key[..object.key.len() - object.file_name().len()];
        let kind = self.classify(&format!("{}{}", directory, display_name));

        let record = DocumentRecord::new(
            id,
            object.key.as_str(),
            display_name,
            object.size,
            mime_type,
            kind,
        );

        let metadata = &self.metadata;
        let row = &record;
        match self
            .retry
            .execute(&format!("metadata_insert:{}", id), || metadata.insert(row))
            .await
        {
            Ok(()) if self.deleted_meanwhile(id, &object.key) => {
                tracing::info!("Orphan {} was deleted during sync, dropping record {}", object.key, id);
                self.retry
                    .execute(&format!("metadata_delete:{}", id), || metadata.delete(id))
                    .await?;
                Ok(false)
            }
            Ok(()) => {
                tracing::info!(
                    "Created record {} for orphan {} ({})",
                    id,
                    object.key,
                    record.document_kind
                );
                Ok(true)
            }
            Err(Error::Conflict(_)) => {
                tracing::debug!("Orphan {} reconciled concurrently", object.key);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn deleted_meanwhile(&self, id: Uuid, key: &str) -> bool {
        self.tombstones.is_key_tombstoned(key) || self.tombstones.is_tombstoned(id)
    }
}
