//! Tombstone Tracker
//!
//! Process-lifetime visibility mask for documents deleted by this process.
//! Storage lag can return a deleted record or object on any later read, so
//! every read path filters through here. The mask only grows.
//!
//! It never answers "does this document exist". It only hides results.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::providers::ObjectInfo;
use crate::types::DocumentRecord;

/// Hook that deletes a document again after it reappeared
#[async_trait]
pub trait Redeleter: Send + Sync {
    async fn redelete(&self, id: Uuid, storage_key: &str) -> Result<()>;
}

#[derive(Default)]
struct TombstoneSet {
    ids: HashSet<Uuid>,
    keys: HashSet<String>,
}

/// Tombstone Tracker
#[derive(Default)]
pub struct TombstoneTracker {
    set: Mutex<TombstoneSet>,
    /// Ids with a re-delete in flight
    redeleting: Mutex<HashSet<Uuid>>,
}

impl TombstoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tombstone a document id and its storage key
    pub fn mark_deleted(&self, id: Uuid, storage_key: &str) {
        let mut set = self.set.lock();
        set.ids.insert(id);
        set.keys.insert(storage_key.to_string());
    }

    pub fn is_tombstoned(&self, id: Uuid) -> bool {
        self.set.lock().ids.contains(&id)
    }

    pub fn is_key_tombstoned(&self, storage_key: &str) -> bool {
        self.set.lock().keys.contains(storage_key)
    }

    pub fn len(&self) -> usize {
        self.set.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.lock().ids.is_empty()
    }

    /// Drop every tombstoned record
    pub fn filter(&self, records: Vec<DocumentRecord>) -> Vec<DocumentRecord> {
        let set = self.set.lock();
        records
            .into_iter()
            .filter(|r| !set.ids.contains(&r.id) && !set.keys.contains(&r.storage_key))
            .collect()
    }

    /// Drop every object whose key is tombstoned
    pub fn filter_objects(&self, objects: Vec<ObjectInfo>) -> Vec<ObjectInfo> {
        let set = self.set.lock();
        objects
            .into_iter()
            .filter(|o| !set.keys.contains(&o.key))
            .collect()
    }

    /// Records in a fresh read that should have been gone
    pub fn reappeared(&self, records: &[DocumentRecord]) -> Vec<DocumentRecord> {
        let set = self.set.lock();
        records
            .iter()
            .filter(|r| set.ids.contains(&r.id))
            .cloned()
            .collect()
    }

    /// Log reappearances and start one re-delete per id
    ///
    /// An id whose re-delete is still running is skipped, so repeated reads
    /// during one reappearance cycle issue a single re-delete. Returns the
    /// ids a re-delete was started for.
    pub fn repair(
        self: &Arc<Self>,
        records: &[DocumentRecord],
        redeleter: Arc<dyn Redeleter>,
    ) -> Vec<Uuid> {
        let reappeared = self.reappeared(records);
        if reappeared.is_empty() {
            return Vec::new();
        }

        let mut started = Vec::new();
        for record in reappeared {
            tracing::warn!(
                "Deleted document {} ({}) reappeared in a fresh read",
                record.id,
                record.storage_key
            );
            if !self.redeleting.lock().insert(record.id) {
                tracing::debug!("Re-delete of {} already in flight", record.id);
                continue;
            }
            started.push(record.id);

            let tracker = Arc::clone(self);
            let redeleter = Arc::clone(&redeleter);
            tokio::spawn(async move {
                if let Err(e) = redeleter.redelete(record.id, &record.storage_key).await {
                    tracing::error!("Re-delete of {} failed: {}", record.id, e);
                }
                tracker.redeleting.lock().remove(&record.id);
            });
        }
        started
    }

    /// Whether a re-delete is running for this id
    pub fn is_redeleting(&self, id: Uuid) -> bool {
        self.redeleting.lock().contains(&id)
    }
}
