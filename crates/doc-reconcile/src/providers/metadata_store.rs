//! Metadata store provider trait and its change subscription

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{DocumentRecord, RecordFilter, RecordPatch};

/// Capacity of the change and log broadcast channels
pub const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Kind of row change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// One row change, delivered at-least-once and possibly out of order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub event_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<DocumentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<DocumentRecord>,
}

impl ChangeEvent {
    pub fn insert(record: DocumentRecord) -> Self {
        Self {
            event_type: ChangeType::Insert,
            old: None,
            new: Some(record),
        }
    }

    pub fn update(old: DocumentRecord, new: DocumentRecord) -> Self {
        Self {
            event_type: ChangeType::Update,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn delete(old: DocumentRecord) -> Self {
        Self {
            event_type: ChangeType::Delete,
            old: Some(old),
            new: None,
        }
    }

    /// Id of the affected row
    pub fn id(&self) -> Option<Uuid> {
        self.new.as_ref().or(self.old.as_ref()).map(|r| r.id)
    }
}

/// Severity of a processing log line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Progress line written by the extraction job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingLogEntry {
    pub document_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ProcessingLogEntry {
    pub fn info(document_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            document_id,
            level: LogLevel::Info,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Trait for the relational metadata store
///
/// Implementations:
/// - `SqliteMetadataStore`: SQLite file
/// - `InMemoryMetadataStore`: Process memory, with replica lag and failure injection
#[async_trait]
pub trait MetadataStoreProvider: Send + Sync {
    /// Insert a record; `Error::Conflict` on a duplicate id or storage key
    async fn insert(&self, record: &DocumentRecord) -> Result<()>;

    /// Patch a record and return the updated row
    async fn update(&self, id: Uuid, patch: &RecordPatch) -> Result<DocumentRecord>;

    /// Delete a record, returns whether a row was removed
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Query records
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<DocumentRecord>>;

    /// Get a single record
    async fn get(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        Ok(self.query(&RecordFilter::by_id(id)).await?.into_iter().next())
    }

    /// Append a processing log line
    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()>;

    /// Subscribe to row changes
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Subscribe to the processing log stream
    fn subscribe_logs(&self) -> broadcast::Receiver<ProcessingLogEntry>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
