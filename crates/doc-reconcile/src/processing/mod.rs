//! Reconciliation core: retries, lifecycle, tombstones, sync and feeds

mod change_feed;
mod deletion;
mod fetch;
mod lifecycle;
mod retry;
mod sync;
mod tombstone;
mod upload;

pub use change_feed::ChangeFeedConsumer;
pub use deletion::DocumentDeleter;
pub use fetch::FetchCoordinator;
pub use lifecycle::{
    LifecycleEvent, LifecycleManager, LifecycleState, LifecycleSummary, Notification,
    ProcessingOutcome, StuckNotice, StuckSweeper, NOTIFICATION_CAPACITY,
};
pub use retry::{RetryController, RetryPolicy};
pub use sync::{classify, parse_object_name, Reconciler, SyncReport, SyncStatus};
pub use tombstone::{Redeleter, TombstoneTracker};
pub use upload::{sanitize_file_name, UploadController, UploadRequest};
