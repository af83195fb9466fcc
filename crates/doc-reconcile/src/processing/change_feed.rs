//! Change Feed Consumer
//!
//! Turns the metadata store's row changes and processing-log stream into
//! UI-facing notifications. The feed is at-least-once and unordered, so
//! events are judged by the state they derive to rather than by arrival.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::providers::{ChangeEvent, ChangeType, MetadataStoreProvider, ProcessingLogEntry};
use crate::types::RecordPatch;

use super::lifecycle::{LifecycleState, Notification};
use super::tombstone::TombstoneTracker;

/// Last state announced for a record
#[derive(Debug, Clone, Copy)]
struct Seen {
    state: LifecycleState,
    last_event_at: DateTime<Utc>,
}

/// Change Feed Consumer
pub struct ChangeFeedConsumer {
    metadata: Arc<dyn MetadataStoreProvider>,
    tombstones: Arc<TombstoneTracker>,
    stuck_threshold: chrono::Duration,
    notifications: broadcast::Sender<Notification>,
    seen: Mutex<HashMap<Uuid, Seen>>,
}

impl ChangeFeedConsumer {
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
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Classify one row change; returns the notification sent, if any
    ///
    /// Dropped: events for tombstoned ids, events older than the last one
    /// applied for the id, and events that derive the state already
    /// announced.
    pub fn handle_event(&self, event: &ChangeEvent) -> Option<Notification> {
        let id = event.id()?;
        if self.tombstones.is_tombstoned(id) {
            tracing::debug!("Ignoring {:?} for tombstoned {}", event.event_type, id);
            return None;
        }

        let notification = match (event.event_type, &event.new) {
            (ChangeType::Delete, _) | (_, None) => {
                self.seen.lock().remove(&id);
                Notification::Deleted { id }
            }
            (_, Some(record)) => {
                let state = LifecycleState::derive(record, Utc::now(), self.stuck_threshold);
                {
                    let mut seen = self.seen.lock();
                    if let Some(prev) = seen.get_mut(&id) {
                        if record.last_event_at < prev.last_event_at {
                            tracing::debug!("Dropping stale event for {}", id);
                            return None;
                        }
                        prev.last_event_at = record.last_event_at;
                        if prev.state == state {
                            return None;
                        }
                        prev.state = state;
                    } else {
                        seen.insert(
                            id,
                            Seen {
                                state,
                                last_event_at: record.last_event_at,
                            },
                        );
                    }
                }

                match state {
                    LifecycleState::Uploaded => Notification::Uploaded {
                        id,
                        display_name: record.display_name.clone(),
                    },
                    LifecycleState::Processing => Notification::ProcessingStarted { id },
                    LifecycleState::Completed => Notification::Completed {
                        id,
                        review: record.review_status(),
                    },
                    LifecycleState::Failed => {
                        let reason = record
                            .error_message()
                            .map(str::to_string)
                            .unwrap_or_else(|| "extraction failed".to_string());
                        let err = Error::ExternalJob {
                            id,
                            message: reason.clone(),
                        };
                        tracing::warn!("{}", err);
                        Notification::Failed { id, reason }
                    }
                    // The stuck sweep owns stuck notices
                    LifecycleState::Stuck => return None,
                }
            }
        };

        let _ = self.notifications.send(notification.clone());
        Some(notification)
    }

    /// Forward a progress line and refresh the record's `last_event_at`
    pub async fn handle_log(&self, entry: &ProcessingLogEntry) -> Option<Notification> {
        if self.tombstones.is_tombstoned(entry.document_id) {
            return None;
        }

        match self
            .metadata
            .update(entry.document_id, &RecordPatch::touch(entry.at))
            .await
        {
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => tracing::warn!(
                "Could not record activity for {}: {}",
                entry.document_id,
                e
            ),
        }

        let notification = Notification::Progress(entry.clone());
        let _ = self.notifications.send(notification.clone());
        Some(notification)
    }

    /// Consume both streams until `shutdown` fires or both close
    ///
    /// Subscribes before returning, so no event written after this call is
    /// missed.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let mut events = self.metadata.subscribe();
        let mut logs = self.metadata.subscribe_logs();

        tokio::spawn(async move {
            let (mut events_open, mut logs_open) = (true, true);
            while events_open || logs_open {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv(), if events_open => match event {
                        Ok(event) => {
                            self.handle_event(&event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Change feed lagged, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => events_open = false,
                    },
                    entry = logs.recv(), if logs_open => match entry {
                        Ok(entry) => {
                            self.handle_log(&entry).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("Processing log lagged, {} entries skipped", skipped);
                        }
                        Err(RecvError::Closed) => logs_open = false,
                    },
                }
            }
            tracing::debug!("Change feed consumer stopped");
        })
    }
}
