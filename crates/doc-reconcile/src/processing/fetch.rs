//! Fetch Coordinator
//!
//! Single-flight, rate-limited listing of metadata records. Refreshes come
//! from the UI, timers and change events at once; they share one query.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::providers::MetadataStoreProvider;
use crate::types::{DocumentRecord, RecordFilter};

use super::retry::RetryController;
use super::tombstone::{Redeleter, TombstoneTracker};

const FETCH_KIND: &str = "metadata_query";

type FetchResult = Option<Result<Vec<DocumentRecord>>>;

#[derive(Default)]
struct FetchState {
    /// Last successful result, already filtered
    cached: Option<Vec<DocumentRecord>>,
    last_fetch: Option<Instant>,
    /// Generation and receiver of the running fetch
    in_flight: Option<(u64, watch::Receiver<FetchResult>)>,
    generation: u64,
}

enum Role {
    Cached(Vec<DocumentRecord>),
    Wait(watch::Receiver<FetchResult>),
    Lead(u64, watch::Sender<FetchResult>),
}

/// Clears the in-flight marker if the leading fetch is dropped midway
struct InFlight<'a> {
    state: &'a Mutex<FetchState>,
    generation: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if matches!(state.in_flight, Some((g, _)) if g == self.generation) {
            state.in_flight = None;
        }
    }
}

/// Fetch Coordinator
pub struct FetchCoordinator {
    metadata: Arc<dyn MetadataStoreProvider>,
    tombstones: Arc<TombstoneTracker>,
    retry: Arc<RetryController>,
    redeleter: Mutex<Option<Weak<dyn Redeleter>>>,
    min_interval: Duration,
    state: Mutex<FetchState>,
    fetches: AtomicUsize,
}

impl FetchCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStoreProvider>,
        tombstones: Arc<TombstoneTracker>,
        retry: Arc<RetryController>,
        min_interval: Duration,
    ) -> Self {
        Self {
            metadata,
            tombstones,
            retry,
            redeleter: Mutex::new(None),
            min_interval,
            state: Mutex::new(FetchState::default()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Hook used to re-delete records that reappear in a fetch
    pub fn set_redeleter(&self, redeleter: Weak<dyn Redeleter>) {
        *self.redeleter.lock() = Some(redeleter);
    }

    /// Current record list
    ///
    /// Joins the running fetch if there is one, returns the cached list if
    /// the last fetch is younger than the minimum interval, and queries the
    /// store otherwise. Tombstoned records are never returned.
    pub async fn refresh(&self) -> Result<Vec<DocumentRecord>> {
        loop {
            match self.role() {
                Role::Cached(records) => return Ok(self.tombstones.filter(records)),
                Role::Wait(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(value) => value.clone(),
                        // Leader was dropped before finishing
                        Err(_) => continue,
                    };
                    if let Some(result) = outcome {
                        return result.map(|records| self.tombstones.filter(records));
                    }
                }
                Role::Lead(generation, tx) => return self.lead(generation, tx).await,
            }
        }
    }

    fn role(&self) -> Role {
        let mut state = self.state.lock();
        if let Some((_, rx)) = &state.in_flight {
            return Role::Wait(rx.clone());
        }
        if let (Some(cached), Some(at)) = (&state.cached, state.last_fetch) {
            if at.elapsed() < self.min_interval {
                return Role::Cached(cached.clone());
            }
        }
        state.generation += 1;
        let (tx, rx) = watch::channel(None);
        state.in_flight = Some((state.generation, rx));
        Role::Lead(state.generation, tx)
    }

    async fn lead(
        &self,
        generation: u64,
        tx: watch::Sender<FetchResult>,
    ) -> Result<Vec<DocumentRecord>> {
        let _guard = InFlight {
            state: &self.state,
            generation,
        };
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let metadata = &self.metadata;
        let all = RecordFilter::all();
        let result = self
            .retry
            .execute(FETCH_KIND, || metadata.query(&all))
            .await
            .map(|records| {
                let redeleter = self.redeleter.lock().as_ref().and_then(Weak::upgrade);
                if let Some(redeleter) = redeleter {
                    self.tombstones.repair(&records, redeleter);
                }
                self.tombstones.filter(records)
            });

        {
            let mut state = self.state.lock();
            if let Ok(records) = &result {
                state.cached = Some(records.clone());
                state.last_fetch = Some(Instant::now());
            }
            state.in_flight = None;
        }

        if let Err(e) = &result {
            tracing::warn!("Record fetch failed: {}", e);
        }
        let _ = tx.send(Some(result.clone()));
        result
    }

    /// Optimistically drop a record from the cached list
    pub fn forget(&self, id: Uuid) {
        if let Some(cached) = self.state.lock().cached.as_mut() {
            cached.retain(|r| r.id != id);
        }
    }

    /// Cached list without touching the store
    pub fn cached(&self) -> Option<Vec<DocumentRecord>> {
        let cached = self.state.lock().cached.clone();
        cached.map(|records| self.tombstones.filter(records))
    }

    /// Number of store queries issued so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::retry::RetryPolicy;
    use crate::providers::InMemoryMetadataStore;
    use crate::types::DocumentKind;

    fn coordinator(metadata: Arc<InMemoryMetadataStore>) -> (FetchCoordinator, Arc<TombstoneTracker>) {
        let tombstones = Arc::new(TombstoneTracker::new());
        let retry = Arc::new(RetryController::new(RetryPolicy::fixed(
            3,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )));
        let fetch = FetchCoordinator::new(
            metadata,
            Arc::clone(&tombstones),
            retry,
            Duration::from_secs(1),
        );
        (fetch, tombstones)
    }

    async fn seed(metadata: &InMemoryMetadataStore, key: &str) -> DocumentRecord {
        let rec = DocumentRecord::new(Uuid::new_v4(), key, "a.pdf", 1, "application/pdf", DocumentKind::Other);
        metadata.insert(&rec).await.unwrap();
        rec
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_query() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata.set_query_delay(Some(Duration::from_millis(200)));
        seed(&metadata, "uploads/a.pdf").await;
        let (fetch, _) = coordinator(metadata.clone());

        let (a, b) = tokio::join!(fetch.refresh(), fetch.refresh());
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(fetch.fetch_count(), 1);
        assert_eq!(metadata.query_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_inside_min_interval_return_cache() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        seed(&metadata, "uploads/a.pdf").await;
        let (fetch, _) = coordinator(metadata.clone());

        fetch.refresh().await.unwrap();
        seed(&metadata, "uploads/b.pdf").await;
        assert_eq!(fetch.refresh().await.unwrap().len(), 1);
        assert_eq!(fetch.fetch_count(), 1);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(fetch.refresh().await.unwrap().len(), 2);
        assert_eq!(fetch.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tombstoned_records_hidden_on_every_path() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let gone = seed(&metadata, "uploads/gone.pdf").await;
        seed(&metadata, "uploads/kept.pdf").await;
        let (fetch, tombstones) = coordinator(metadata.clone());

        fetch.refresh().await.unwrap();
        tombstones.mark_deleted(gone.id, &gone.storage_key);

        // Cached path
        assert!(fetch.refresh().await.unwrap().iter().all(|r| r.id != gone.id));
        // Fresh path, while the store still returns the row
        tokio::time::advance(Duration::from_secs(2)).await;
        let fresh = fetch.refresh().await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert!(fresh.iter().all(|r| r.id != gone.id));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_updates_cache_synchronously() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let rec = seed(&metadata, "uploads/a.pdf").await;
        let (fetch, _) = coordinator(metadata);

        fetch.refresh().await.unwrap();
        fetch.forget(rec.id);
        assert!(fetch.cached().unwrap().is_empty());
    }
}
