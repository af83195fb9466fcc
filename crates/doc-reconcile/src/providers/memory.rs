//! In-memory provider implementations
//!
//! Both stores can imitate the failure modes the reconciler is built for:
//! a listing or query that keeps returning deleted entries for a number of
//! reads, and a budget of injected transient failures per operation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{DocumentRecord, RecordFilter, RecordPatch};

use super::extraction::ExtractionJobProvider;
use super::metadata_store::{
    ChangeEvent, MetadataStoreProvider, ProcessingLogEntry, CHANGE_CHANNEL_CAPACITY,
};
use super::object_store::{ObjectInfo, ObjectStoreProvider};

/// Number of upcoming calls that should fail
#[derive(Debug, Default)]
pub struct FailureBudget(AtomicU32);

impl FailureBudget {
    /// Fail the next `n` calls
    pub fn set(&self, n: u32) {
        self.0.store(n, Ordering::SeqCst);
    }

    /// Consume one failure if any remain
    pub fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// A deleted entry still visible to reads for `remaining` more reads
#[derive(Debug, Clone)]
struct Ghost<T> {
    value: T,
    remaining: u32,
}

fn drain_ghosts<T: Clone>(ghosts: &Mutex<HashMap<String, Ghost<T>>>) -> Vec<T> {
    let mut ghosts = ghosts.lock();
    let visible = ghosts.values().map(|g| g.value.clone()).collect();
    ghosts.retain(|_, g| {
        g.remaining -= 1;
        g.remaining > 0
    });
    visible
}

// ==================== Object Store ====================

/// Object store kept in process memory
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, (Bytes, ObjectInfo)>,
    ghosts: Mutex<HashMap<String, Ghost<ObjectInfo>>>,
    list_lag: AtomicU32,
    put_delay: Mutex<Option<Duration>>,
    /// Injected put failures
    pub fail_puts: FailureBudget,
    /// Injected delete failures
    pub fail_deletes: FailureBudget,
    /// Injected list failures
    pub fail_lists: FailureBudget,
    put_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deleted keys stay listed for the next `reads` list calls
    pub fn set_list_lag(&self, reads: u32) {
        self.list_lag.store(reads, Ordering::SeqCst);
    }

    /// Make every put take this long before landing
    pub fn set_put_delay(&self, delay: Option<Duration>) {
        *self.put_delay.lock() = delay;
    }

    /// Seed an object without going through `put`
    pub fn insert_object(&self, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let mut info = ObjectInfo::new(key, data.len() as u64);
        info.content_type = mime_guess::from_path(key).first().map(|m| m.to_string());
        info.last_modified = Some(Utc::now());
        self.objects.insert(key.to_string(), (data, info));
    }

    /// Whether the key is really stored, ignoring list lag
    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStoreProvider for InMemoryObjectStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.put_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_puts.take() {
            return Err(Error::transient(format!("injected put failure for {}", key)));
        }

        let mut info = ObjectInfo::new(key, data.len() as u64);
        info.content_type = Some(content_type.to_string());
        info.last_modified = Some(Utc::now());
        self.objects.insert(key.to_string(), (data, info));
        self.ghosts.lock().remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .get(key)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| Error::not_found(format!("object {}", key)))
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.take() {
            return Err(Error::transient("injected delete failure"));
        }

        let lag = self.list_lag.load(Ordering::SeqCst);
        for key in keys {
            if let Some((_, (_, info))) = self.objects.remove(key) {
                if lag > 0 {
                    self.ghosts.lock().insert(
                        key.clone(),
                        Ghost {
                            value: info,
                            remaining: lag,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        if self.fail_lists.take() {
            return Err(Error::transient("injected list failure"));
        }

        let mut listed: Vec<ObjectInfo> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().1.clone())
            .collect();
        listed.extend(
            drain_ghosts(&self.ghosts)
                .into_iter()
                .filter(|info| info.key.starts_with(prefix)),
        );
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "in-memory-objects"
    }
}

// ==================== Metadata Store ====================

/// Metadata store kept in process memory
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<Uuid, DocumentRecord>>,
    ghosts: Mutex<HashMap<String, Ghost<DocumentRecord>>>,
    read_lag: AtomicU32,
    query_delay: Mutex<Option<Duration>>,
    insert_delay: Mutex<Option<Duration>>,
    events: broadcast::Sender<ChangeEvent>,
    logs: broadcast::Sender<ProcessingLogEntry>,
    /// Injected insert failures
    pub fail_inserts: FailureBudget,
    /// Injected update failures
    pub fail_updates: FailureBudget,
    /// Injected delete failures
    pub fail_deletes: FailureBudget,
    /// Injected query failures
    pub fail_queries: FailureBudget,
    query_calls: AtomicUsize,
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (logs, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(HashMap::new()),
            ghosts: Mutex::new(HashMap::new()),
            read_lag: AtomicU32::new(0),
            query_delay: Mutex::new(None),
            insert_delay: Mutex::new(None),
            events,
            logs,
            fail_inserts: FailureBudget::default(),
            fail_updates: FailureBudget::default(),
            fail_deletes: FailureBudget::default(),
            fail_queries: FailureBudget::default(),
            query_calls: AtomicUsize::new(0),
        }
    }

    /// Deleted rows keep showing up in the next `reads` queries
    pub fn set_read_lag(&self, reads: u32) {
        self.read_lag.store(reads, Ordering::SeqCst);
    }

    /// Make every query take this long
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *self.query_delay.lock() = delay;
    }

    /// Make every insert wait this long before writing
    pub fn set_insert_delay(&self, delay: Option<Duration>) {
        *self.insert_delay.lock() = delay;
    }

    /// Number of `query` calls served so far
    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of the rows really stored, ignoring read lag
    pub fn snapshot(&self) -> Vec<DocumentRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Re-deliver an event, as an at-least-once feed may
    pub fn replay(&self, event: ChangeEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MetadataStoreProvider for InMemoryMetadataStore {
    async fn insert(&self, record: &DocumentRecord) -> Result<()> {
        let delay = *self.insert_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_inserts.take() {
            return Err(Error::transient(format!("injected insert failure for {}", record.id)));
        }
        {
            let mut records = self.records.write();
            if records.contains_key(&record.id) {
                return Err(Error::conflict(format!("duplicate id {}", record.id)));
            }
            if records.values().any(|r| r.storage_key == record.storage_key) {
                return Err(Error::conflict(format!(
                    "duplicate storage key {}",
                    record.storage_key
                )));
            }
            records.insert(record.id, record.clone());
        }
        self.ghosts.lock().remove(&record.id.to_string());
        let _ = self.events.send(ChangeEvent::insert(record.clone()));
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: &RecordPatch) -> Result<DocumentRecord> {
        if self.fail_updates.take() {
            return Err(Error::transient(format!("injected update failure for {}", id)));
        }
        let (old, new) = {
            let mut records = self.records.write();
            let record = records
                .get_mut(&id)
                .ok_or_else(|| Error::not_found(format!("record {}", id)))?;
            let old = record.clone();
            patch.apply(record);
            (old, record.clone())
        };
        let _ = self.events.send(ChangeEvent::update(old, new.clone()));
        Ok(new)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        if self.fail_deletes.take() {
            return Err(Error::transient(format!("injected delete failure for {}", id)));
        }
        let removed = self.records.write().remove(&id);
        match removed {
            Some(old) => {
                let lag = self.read_lag.load(Ordering::SeqCst);
                if lag > 0 {
                    self.ghosts.lock().insert(
                        id.to_string(),
                        Ghost {
                            value: old.clone(),
                            remaining: lag,
                        },
                    );
                }
                let _ = self.events.send(ChangeEvent::delete(old));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<DocumentRecord>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_queries.take() {
            return Err(Error::transient("injected query failure"));
        }

        let mut rows: Vec<DocumentRecord> = self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.extend(drain_ghosts(&self.ghosts).into_iter().filter(|r| filter.matches(r)));
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        let _ = self.logs.send(entry.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    fn subscribe_logs(&self) -> broadcast::Receiver<ProcessingLogEntry> {
        self.logs.subscribe()
    }

    fn name(&self) -> &str {
        "in-memory-metadata"
    }
}

// ==================== Extraction Job ====================

/// Extraction job that only records invocations
///
/// Tests play the job's part by writing the outcome to the metadata store.
#[derive(Default)]
pub struct InMemoryExtractionJob {
    invocations: Mutex<Vec<(Uuid, String)>>,
    /// Injected invocation failures
    pub fail_invokes: FailureBudget,
}

impl InMemoryExtractionJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every successful invocation, in order
    pub fn invocations(&self) -> Vec<(Uuid, String)> {
        self.invocations.lock().clone()
    }

    /// Invocations for one document
    pub fn invocations_for(&self, id: Uuid) -> usize {
        self.invocations.lock().iter().filter(|(i, _)| *i == id).count()
    }
}

#[async_trait]
impl ExtractionJobProvider for InMemoryExtractionJob {
    async fn invoke(&self, id: Uuid, storage_key: &str) -> Result<()> {
        if self.fail_invokes.take() {
            return Err(Error::transient(format!("injected invoke failure for {}", id)));
        }
        self.invocations.lock().push((id, storage_key.to_string()));
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory-extraction"
    }
}
