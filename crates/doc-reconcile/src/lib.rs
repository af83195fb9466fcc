//! doc-reconcile: keeps an object store, its metadata records and an
//! asynchronous extraction job consistent
//!
//! Documents are uploaded to an object store, described by a record in a
//! metadata store and processed by an external extraction job. This crate
//! holds the reconciliation layer between the three: the derived lifecycle
//! state machine, deletion tombstones that mask stale reads, orphan sync,
//! stuck-job detection, and the retry and single-flight discipline around
//! all of it.
//!
//! The collaborators are reached through the traits in [`providers`]; the
//! [`IngestService`] wires every component around one set of them.

pub mod config;
pub mod error;
pub mod processing;
pub mod providers;
pub mod service;
pub mod storage;
pub mod types;

pub use config::ReconcileConfig;
pub use error::{Error, Result};
pub use processing::{LifecycleState, Notification, ProcessingOutcome, SyncReport, UploadRequest};
pub use service::{BackgroundHandle, IngestService};
pub use types::{DocumentKind, DocumentRecord, ExtractionResult, RecordFilter, RecordPatch};
