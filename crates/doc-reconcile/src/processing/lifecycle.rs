//! Lifecycle State Machine
//!
//! The lifecycle state is never stored. It is derived from the record's
//! flags, result payload and timestamps every time it is read, so any two
//! readers with the same clock agree on it (including on `Stuck`).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::providers::{ExtractionJobProvider, MetadataStoreProvider, ProcessingLogEntry};
use crate::types::{DocumentRecord, RecordFilter, RecordPatch, ReviewStatus};

use super::retry::RetryController;
use super::tombstone::TombstoneTracker;

/// Derived lifecycle state of a document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uploaded,
    Processing,
    Completed,
    Failed,
    Stuck,
}

/// Events that move a document between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    JobStarted,
    JobSucceeded,
    JobFailed,
    TimedOut,
    RetryRequested,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::JobStarted => "start processing",
            LifecycleEvent::JobSucceeded => "complete",
            LifecycleEvent::JobFailed => "fail",
            LifecycleEvent::TimedOut => "time out",
            LifecycleEvent::RetryRequested => "retry",
        }
    }
}

impl LifecycleState {
    /// Classify a record at `now`
    ///
    /// A processing record is `Stuck` once strictly more than
    /// `stuck_threshold` has passed since `processing_started_at` (or
    /// `created_at` when the start time was never written).
    pub fn derive(
        record: &DocumentRecord,
        now: DateTime<Utc>,
        stuck_threshold: chrono::Duration,
    ) -> Self {
        if record.has_error() {
            return LifecycleState::Failed;
        }
        if record.processed {
            return LifecycleState::Completed;
        }
        if record.processing {
            let started = record.processing_started_at.unwrap_or(record.created_at);
            if now - started > stuck_threshold {
                return LifecycleState::Stuck;
            }
            return LifecycleState::Processing;
        }
        LifecycleState::Uploaded
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uploaded => "uploaded",
            LifecycleState::Processing => "processing",
            LifecycleState::Completed => "completed",
            LifecycleState::Failed => "failed",
            LifecycleState::Stuck => "stuck",
        }
    }

    /// Target state of a transition, or `InvalidTransition`
    pub fn apply(self, event: LifecycleEvent) -> Result<LifecycleState> {
        use LifecycleEvent::*;
        use LifecycleState::*;

        let next = match (self, event) {
            (Uploaded, JobStarted) => Processing,
            (Processing | Stuck, JobSucceeded) => Completed,
            (Processing | Stuck, JobFailed) => Failed,
            (Processing, TimedOut) => Stuck,
            (Stuck | Failed, RetryRequested) => Processing,
            (from, event) => {
                return Err(Error::InvalidTransition {
                    from: from.as_str().to_string(),
                    event: event.as_str().to_string(),
                })
            }
        };
        Ok(next)
    }

    /// Whether a user retry is allowed
    pub fn can_retry(&self) -> bool {
        matches!(self, LifecycleState::Stuck | LifecycleState::Failed)
    }

    /// Whether the record may be deleted; an active job blocks it unless forced
    pub fn can_delete(&self, force: bool) -> bool {
        force || *self != LifecycleState::Processing
    }

    /// Completed and reviewed by a human; no further automatic change
    pub fn is_terminal_reviewed(&self, record: &DocumentRecord) -> bool {
        *self == LifecycleState::Completed && record.review_status() != ReviewStatus::Pending
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Per-state counts for a record list
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleSummary {
    pub uploaded: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub stuck: usize,
}

impl LifecycleSummary {
    pub fn from_records(
        records: &[DocumentRecord],
        now: DateTime<Utc>,
        stuck_threshold: chrono::Duration,
    ) -> Self {
        let mut summary = Self::default();
        for record in records {
            match LifecycleState::derive(record, now, stuck_threshold) {
                LifecycleState::Uploaded => summary.uploaded += 1,
                LifecycleState::Processing => summary.processing += 1,
                LifecycleState::Completed => summary.completed += 1,
                LifecycleState::Failed => summary.failed += 1,
                LifecycleState::Stuck => summary.stuck += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.uploaded + self.processing + self.completed + self.failed + self.stuck
    }
}

// ==================== Notifications ====================

/// Capacity of the notification channel
pub const NOTIFICATION_CAPACITY: usize = 256;

/// One-time notice for a record that crossed the stuck threshold
#[derive(Debug, Clone, PartialEq)]
pub struct StuckNotice {
    pub id: Uuid,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
    pub processing_for: chrono::Duration,
}

/// UI-facing notification
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Uploaded { id: Uuid, display_name: String },
    ProcessingStarted { id: Uuid },
    Completed { id: Uuid, review: ReviewStatus },
    Failed { id: Uuid, reason: String },
    Stuck(StuckNotice),
    Progress(ProcessingLogEntry),
    Deleted { id: Uuid },
}

impl Notification {
    pub fn id(&self) -> Uuid {
        match self {
            Notification::Uploaded { id, .. }
            | Notification::ProcessingStarted { id }
            | Notification::Completed { id, .. }
            | Notification::Failed { id, .. }
            | Notification::Deleted { id } => *id,
            Notification::Stuck(notice) => notice.id,
            Notification::Progress(entry) => entry.document_id,
        }
    }
}

// ==================== Transitions ====================

/// Result of a start or retry request
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    /// The job was invoked; carries the record as written
    Started(DocumentRecord),
    /// Another invocation owns this record; nothing was done
    AlreadyProcessing,
}

fn invoke_kind(id: Uuid) -> String {
    format!("invoke_job:{}", id)
}

fn update_kind(id: Uuid) -> String {
    format!("metadata_update:{}", id)
}

/// Removes the claim when dropped
struct Claim<'a> {
    claims: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.id);
    }
}

/// Drives the job-facing transitions (`start`, `retry`)
///
/// Completion and failure are written by the job itself and only observed
/// through the change feed.
pub struct LifecycleManager {
    metadata: Arc<dyn MetadataStoreProvider>,
    job: Arc<dyn ExtractionJobProvider>,
    retry: Arc<RetryController>,
    stuck_threshold: chrono::Duration,
    /// Ids with a start/retry in progress in this process
    claims: Mutex<HashSet<Uuid>>,
}

impl LifecycleManager {
    pub fn new(
        metadata: Arc<dyn MetadataStoreProvider>,
        job: Arc<dyn ExtractionJobProvider>,
        retry: Arc<RetryController>,
        stuck_threshold: chrono::Duration,
    ) -> Self {
        Self {
            metadata,
            job,
            retry,
            stuck_threshold,
            claims: Mutex::new(HashSet::new()),
        }
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        self.stuck_threshold
    }

    /// Current derived state of a record
    pub fn state_of(&self, record: &DocumentRecord) -> LifecycleState {
        LifecycleState::derive(record, Utc::now(), self.stuck_threshold)
    }

    fn claim(&self, id: Uuid) -> Option<Claim<'_>> {
        if self.claims.lock().insert(id) {
            Some(Claim {
                claims: &self.claims,
                id,
            })
        } else {
            None
        }
    }

    async fn load(&self, id: Uuid) -> Result<DocumentRecord> {
        self.metadata
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {}", id)))
    }

    /// `Uploaded -> Processing`, then invoke the extraction job
    pub async fn begin_processing(&self, id: Uuid) -> Result<ProcessingOutcome> {
        let Some(_claim) = self.claim(id) else {
            tracing::debug!("Start of {} already in progress", id);
            return Ok(ProcessingOutcome::AlreadyProcessing);
        };

        let record = self.load(id).await?;
        let now = Utc::now();
        match LifecycleState::derive(&record, now, self.stuck_threshold) {
            LifecycleState::Processing | LifecycleState::Stuck => {
                return Ok(ProcessingOutcome::AlreadyProcessing)
            }
            state => {
                state.apply(LifecycleEvent::JobStarted)?;
            }
        }

        let record = self.write(id, RecordPatch::start_processing(now)).await?;
        tracing::info!("Processing started for {} ({})", id, record.storage_key);
        self.invoke(&record).await?;
        Ok(ProcessingOutcome::Started(record))
    }

    /// `Stuck|Failed -> Processing`, clearing the previous attempt's result
    pub async fn retry(&self, id: Uuid) -> Result<ProcessingOutcome> {
        let Some(_claim) = self.claim(id) else {
            tracing::debug!("Retry of {} already in progress", id);
            return Ok(ProcessingOutcome::AlreadyProcessing);
        };

        let record = self.load(id).await?;
        let now = Utc::now();
        match LifecycleState::derive(&record, now, self.stuck_threshold) {
            LifecycleState::Processing => return Ok(ProcessingOutcome::AlreadyProcessing),
            state => {
                state.apply(LifecycleEvent::RetryRequested)?;
            }
        }

        // A user retry re-arms automatic retries of the invocation
        self.retry.reset(&invoke_kind(id));

        let record = self.write(id, RecordPatch::retry(now)).await?;
        tracing::info!("Retrying extraction for {} ({})", id, record.storage_key);
        self.invoke(&record).await?;
        Ok(ProcessingOutcome::Started(record))
    }

    async fn write(&self, id: Uuid, patch: RecordPatch) -> Result<DocumentRecord> {
        let metadata = &self.metadata;
        let patch = &patch;
        self.retry
            .execute(&update_kind(id), || metadata.update(id, patch))
            .await
    }

    /// Invoke the job; any terminal failure finalizes the record as `Failed`
    async fn invoke(&self, record: &DocumentRecord) -> Result<()> {
        let job = &self.job;
        let result = self
            .retry
            .execute(&invoke_kind(record.id), || {
                job.invoke(record.id, &record.storage_key)
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e @ Error::RetrySuperseded(_)) => Err(e),
            Err(e) => {
                tracing::error!("Extraction job for {} could not be started: {}", record.id, e);
                let patch = RecordPatch::fail(e.reason(), Utc::now());
                if let Err(write_err) = self.metadata.update(record.id, &patch).await {
                    tracing::error!(
                        "Failed to mark {} as failed after invocation error: {}",
                        record.id,
                        write_err
                    );
                }
                Err(e)
            }
        }
    }
}

// ==================== Stuck Sweep ====================

/// Periodic stuck detection with one notice per processing attempt
pub struct StuckSweeper {
    metadata: Arc<dyn MetadataStoreProvider>,
    tombstones: Arc<TombstoneTracker>,
    stuck_threshold: chrono::Duration,
    notifications: broadcast::Sender<Notification>,
    /// `(id, processing start)` pairs already notified
    notified: Mutex<HashSet<(Uuid, DateTime<Utc>)>>,
}

impl StuckSweeper {
    pub fn new(
        metadata: Arc<dyn MetadataStoreProvider>,
        tombstones: Arc<TombstoneTracker>,
        stuck_threshold: chrono::Duration,
        notifications: broadcast::Sender<Notification>,
    ) -> Self {
        Self {
            metadata,
            tombstones,
            stuck_threshold,
            notifications,
            notified: Mutex::new(HashSet::new()),
        }
    }

    /// Classify every processing record at `now` and notify new stuck ones
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<StuckNotice>> {
        let processing = self
            .tombstones
            .filter(self.metadata.query(&RecordFilter::processing()).await?);

        let mut notices = Vec::new();
        {
            let mut notified = self.notified.lock();
            let live: HashSet<(Uuid, DateTime<Utc>)> = processing
                .iter()
                .map(|r| (r.id, r.processing_started_at.unwrap_or(r.created_at)))
                .collect();
            notified.retain(|key| live.contains(key));

            for record in &processing {
                if LifecycleState::derive(record, now, self.stuck_threshold)
                    != LifecycleState::Stuck
                {
                    continue;
                }
                let started_at = record.processing_started_at.unwrap_or(record.created_at);
                if !notified.insert((record.id, started_at)) {
                    continue;
                }
                notices.push(StuckNotice {
                    id: record.id,
                    display_name: record.display_name.clone(),
                    started_at,
                    processing_for: now - started_at,
                });
            }
        }

        for notice in &notices {
            tracing::warn!(
                "Document {} ({}) stuck: processing for {}s",
                notice.id,
                notice.display_name,
                notice.processing_for.num_seconds()
            );
            let _ = self.notifications.send(Notification::Stuck(notice.clone()));
        }
        Ok(notices)
    }

    /// Run `sweep` every `interval` until `shutdown` fires
    pub fn spawn(
        self: Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep(Utc::now()).await {
                            tracing::warn!("Stuck sweep failed: {}", e);
                        }
                    }
                }
            }
            tracing::debug!("Stuck sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::retry::RetryPolicy;
    use crate::providers::{InMemoryExtractionJob, InMemoryMetadataStore};
    use crate::types::{DocumentKind, ExtractionResult, ReviewFlags};
    use std::time::Duration;

    fn threshold() -> chrono::Duration {
        chrono::Duration::seconds(300)
    }

    fn record() -> DocumentRecord {
        DocumentRecord::new(
            Uuid::new_v4(),
            format!("uploads/{}.pdf", Uuid::new_v4()),
            "invoice.pdf",
            100,
            "application/pdf",
            DocumentKind::Invoice,
        )
    }

    #[test]
    fn derive_covers_every_state() {
        let now = Utc::now();
        let mut rec = record();
        assert_eq!(LifecycleState::derive(&rec, now, threshold()), LifecycleState::Uploaded);

        RecordPatch::start_processing(now).apply(&mut rec);
        assert_eq!(LifecycleState::derive(&rec, now, threshold()), LifecycleState::Processing);

        let mut done = rec.clone();
        RecordPatch::complete(ExtractionResult::success(serde_json::json!({})), now)
            .apply(&mut done);
        assert_eq!(LifecycleState::derive(&done, now, threshold()), LifecycleState::Completed);

        let mut failed = rec.clone();
        RecordPatch::fail("bad scan", now).apply(&mut failed);
        assert_eq!(LifecycleState::derive(&failed, now, threshold()), LifecycleState::Failed);
    }

    #[test]
    fn stuck_boundary_is_strict() {
        let t0 = Utc::now();
        let mut rec = record();
        RecordPatch::start_processing(t0).apply(&mut rec);

        let before = t0 + threshold() - chrono::Duration::seconds(1);
        let at = t0 + threshold();
        let after = t0 + threshold() + chrono::Duration::seconds(1);
        assert_eq!(LifecycleState::derive(&rec, before, threshold()), LifecycleState::Processing);
        assert_eq!(LifecycleState::derive(&rec, at, threshold()), LifecycleState::Processing);
        assert_eq!(LifecycleState::derive(&rec, after, threshold()), LifecycleState::Stuck);
    }

    #[test]
    fn derive_is_pure() {
        let now = Utc::now();
        let mut rec = record();
        RecordPatch::start_processing(now - chrono::Duration::minutes(10)).apply(&mut rec);
        let first = LifecycleState::derive(&rec, now, threshold());
        let second = LifecycleState::derive(&rec.clone(), now, threshold());
        assert_eq!(first, second);
    }

    #[test]
    fn transition_table() {
        use LifecycleEvent::*;
        use LifecycleState::*;

        assert_eq!(Uploaded.apply(JobStarted).unwrap(), Processing);
        assert_eq!(Processing.apply(JobSucceeded).unwrap(), Completed);
        assert_eq!(Processing.apply(JobFailed).unwrap(), Failed);
        assert_eq!(Processing.apply(TimedOut).unwrap(), Stuck);
        assert_eq!(Stuck.apply(RetryRequested).unwrap(), Processing);
        assert_eq!(Failed.apply(RetryRequested).unwrap(), Processing);

        assert!(matches!(
            Completed.apply(RetryRequested),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(Uploaded.apply(RetryRequested).is_err());
        assert!(Completed.apply(JobStarted).is_err());

        assert!(!Processing.can_delete(false));
        assert!(Processing.can_delete(true));
        assert!(Stuck.can_delete(false));
    }

    #[test]
    fn reviewed_completion_is_terminal() {
        let now = Utc::now();
        let mut rec = record();
        RecordPatch::complete(ExtractionResult::success(serde_json::json!({})), now)
            .apply(&mut rec);
        let state = LifecycleState::derive(&rec, now, threshold());
        assert!(!state.is_terminal_reviewed(&rec));

        RecordPatch::review(
            ReviewFlags {
                inserted: true,
                ..Default::default()
            },
            now,
        )
        .apply(&mut rec);
        assert!(state.is_terminal_reviewed(&rec));
    }

    #[test]
    fn summary_counts_states() {
        let now = Utc::now();
        let uploaded = record();
        let mut stuck = record();
        RecordPatch::start_processing(now - chrono::Duration::minutes(6)).apply(&mut stuck);

        let summary = LifecycleSummary::from_records(&[uploaded, stuck], now, threshold());
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.stuck, 1);
        assert_eq!(summary.total(), 2);
    }

    fn manager(
        metadata: Arc<InMemoryMetadataStore>,
        job: Arc<InMemoryExtractionJob>,
    ) -> LifecycleManager {
        let retry = Arc::new(RetryController::new(RetryPolicy::fixed(
            3,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )));
        LifecycleManager::new(metadata, job, retry, threshold())
    }

    #[tokio::test(start_paused = true)]
    async fn begin_processing_marks_and_invokes_once() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let job = Arc::new(InMemoryExtractionJob::new());
        let rec = record();
        metadata.insert(&rec).await.unwrap();
        let manager = manager(metadata.clone(), job.clone());

        let outcome = manager.begin_processing(rec.id).await.unwrap();
        assert!(matches!(outcome, ProcessingOutcome::Started(ref r) if r.processing));

        let again = manager.begin_processing(rec.id).await.unwrap();
        assert_eq!(again, ProcessingOutcome::AlreadyProcessing);
        assert_eq!(job.invocations_for(rec.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_retries_invoke_one_job() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let job = Arc::new(InMemoryExtractionJob::new());
        let rec = record();
        metadata.insert(&rec).await.unwrap();
        metadata
            .update(rec.id, &RecordPatch::fail("timeout", Utc::now()))
            .await
            .unwrap();
        let manager = manager(metadata.clone(), job.clone());

        let (a, b) = tokio::join!(manager.retry(rec.id), manager.retry(rec.id));
        let started = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|o| matches!(o, ProcessingOutcome::Started(_)))
            .count();
        assert_eq!(started, 1);
        assert_eq!(job.invocations_for(rec.id), 1);

        let stored = metadata.get(rec.id).await.unwrap().unwrap();
        assert!(stored.processing);
        assert!(stored.extraction_result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_rejects_completed_record() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let job = Arc::new(InMemoryExtractionJob::new());
        let rec = record();
        metadata.insert(&rec).await.unwrap();
        metadata
            .update(
                rec.id,
                &RecordPatch::complete(ExtractionResult::success(serde_json::json!({})), Utc::now()),
            )
            .await
            .unwrap();

        let err = manager(metadata, job).retry(rec.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_invocation_finalizes_failed() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let job = Arc::new(InMemoryExtractionJob::new());
        job.fail_invokes.set(10);
        let rec = record();
        metadata.insert(&rec).await.unwrap();
        let manager = manager(metadata.clone(), job.clone());

        let err = manager.begin_processing(rec.id).await.unwrap_err();
        assert!(err.is_exhausted());

        let stored = metadata.get(rec.id).await.unwrap().unwrap();
        assert!(!stored.processing);
        assert_eq!(manager.state_of(&stored), LifecycleState::Failed);
        assert!(stored.error_message().unwrap().contains("3 attempts"));
    }

    #[tokio::test]
    async fn sweep_notifies_once_per_attempt() {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let (tx, mut rx) = broadcast::channel(16);
        let sweeper = StuckSweeper::new(
            metadata.clone(),
            Arc::new(TombstoneTracker::new()),
            threshold(),
            tx,
        );

        let t0 = Utc::now();
        let rec = record();
        metadata.insert(&rec).await.unwrap();
        metadata
            .update(rec.id, &RecordPatch::start_processing(t0))
            .await
            .unwrap();

        assert!(sweeper.sweep(t0 + chrono::Duration::seconds(200)).await.unwrap().is_empty());
        let first = sweeper.sweep(t0 + chrono::Duration::seconds(301)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].processing_for, chrono::Duration::seconds(301));
        assert!(sweeper.sweep(t0 + chrono::Duration::seconds(361)).await.unwrap().is_empty());
        assert!(matches!(rx.try_recv().unwrap(), Notification::Stuck(_)));
        assert!(rx.try_recv().is_err());

        // A retried attempt that stalls again is a new notice
        let t1 = t0 + chrono::Duration::seconds(400);
        metadata.update(rec.id, &RecordPatch::retry(t1)).await.unwrap();
        let again = sweeper.sweep(t1 + chrono::Duration::seconds(301)).await.unwrap();
        assert_eq!(again.len(), 1);
    }
}
