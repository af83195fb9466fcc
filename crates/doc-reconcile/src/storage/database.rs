//! SQLite metadata store
//!
//! Durable storage for document records and the processing log. Every
//! committed write is published on the change feed.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::providers::metadata_store::{
    ChangeEvent, LogLevel, MetadataStoreProvider, ProcessingLogEntry, CHANGE_CHANNEL_CAPACITY,
};
use crate::types::{DocumentKind, DocumentRecord, ExtractionResult, RecordFilter, RecordPatch};

/// SQLite-based metadata store
pub struct SqliteMetadataStore {
    db: Arc<RecordDb>,
    events: broadcast::Sender<ChangeEvent>,
    logs: broadcast::Sender<ProcessingLogEntry>,
}

/// Connection plus the synchronous record operations
struct RecordDb {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = RecordDb {
            conn: Mutex::new(conn),
        };
        db.migrate()?;

        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (logs, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            db: Arc::new(db),
            events,
            logs,
        })
    }

    /// Run a synchronous database call off the async executor
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RecordDb) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }
}

impl RecordDb {
    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        // WAL keeps readers from blocking the single writer
        conn.execute_batch(r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#).map_err(|e| Error::Database(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS document_records (
                id TEXT PRIMARY KEY,
                storage_key TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                mime_type TEXT NOT NULL,
                document_kind TEXT NOT NULL,
                processing INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                extraction_result TEXT,
                processing_started_at TEXT,
                last_event_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_document_records_processing ON document_records(processing);
            CREATE INDEX IF NOT EXISTS idx_document_records_created_at ON document_records(created_at);

            CREATE TABLE IF NOT EXISTS processing_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_processing_logs_document_id ON processing_logs(document_id);
        "#)
        .map_err(|e| Error::Database(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Metadata database migrations complete");
        Ok(())
    }

    // ==================== Record Operations ====================

    fn insert(&self, record: &DocumentRecord) -> Result<()> {
        let conn = self.conn.lock();
        let result_json = encode_result(record.extraction_result.as_ref())?;

        conn.execute(
            r#"
            INSERT INTO document_records (
                id, storage_key, display_name, byte_size, mime_type, document_kind,
                processing, processed, extraction_result, processing_started_at,
                last_event_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.id.to_string(),
                record.storage_key,
                record.display_name,
                record.byte_size as i64,
                record.mime_type,
                record.document_kind.as_str(),
                record.processing,
                record.processed,
                result_json,
                record.processing_started_at,
                record.last_event_at,
                record.created_at,
            ],
        )?;

        Ok(())
    }

    /// Read-modify-write inside one transaction; returns (old, new)
    fn update(&self, id: Uuid, patch: &RecordPatch) -> Result<(DocumentRecord, DocumentRecord)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let old = tx
            .query_row(
                "SELECT * FROM document_records WHERE id = ?1",
                params![id.to_string()],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| Error::not_found(format!("record {}", id)))?;

        let mut new = old.clone();
        patch.apply(&mut new);
        let result_json = encode_result(new.extraction_result.as_ref())?;

        tx.execute(
            r#"
            UPDATE document_records SET
                document_kind = ?2,
                processing = ?3,
                processed = ?4,
                extraction_result = ?5,
                processing_started_at = ?6,
                last_event_at = ?7
            WHERE id = ?1
            "#,
            params![
                id.to_string(),
                new.document_kind.as_str(),
                new.processing,
                new.processed,
                result_json,
                new.processing_started_at,
                new.last_event_at,
            ],
        )?;
        tx.commit()?;

        Ok((old, new))
    }

    fn delete(&self, id: Uuid) -> Result<Option<DocumentRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let old = tx
            .query_row(
                "SELECT * FROM document_records WHERE id = ?1",
                params![id.to_string()],
                row_to_record,
            )
            .optional()?;
        if old.is_some() {
            tx.execute("DELETE FROM document_records WHERE id = ?1", params![id.to_string()])?;
        }
        tx.commit()?;

        Ok(old)
    }

    fn query(&self, filter: &RecordFilter) -> Result<Vec<DocumentRecord>> {
        let conn = self.conn.lock();

        let sql = match filter.processing {
            Some(_) => "SELECT * FROM document_records WHERE processing = ?1 ORDER BY created_at DESC",
            None => "SELECT * FROM document_records ORDER BY created_at DESC",
        };
        let mut stmt = conn.prepare(sql)?;

        let rows = match filter.processing {
            Some(processing) => stmt
                .query_map(params![processing], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        Ok(rows.into_iter().filter(|r| filter.matches(r)).collect())
    }

    // ==================== Processing Log ====================

    fn insert_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO processing_logs (document_id, level, message, at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.document_id.to_string(),
                entry.level.as_str(),
                entry.message,
                entry.at,
            ],
        )?;
        Ok(())
    }

    fn logs_for(&self, document_id: Uuid) -> Result<Vec<ProcessingLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT document_id, level, message, at FROM processing_logs WHERE document_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![document_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let level: String = row.get(1)?;
                Ok(ProcessingLogEntry {
                    document_id: parse_uuid(&id, 0)?,
                    level: LogLevel::parse(&level),
                    message: row.get(2)?,
                    at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

impl SqliteMetadataStore {
    /// Processing log lines for one document, oldest first
    pub async fn logs_for(&self, document_id: Uuid) -> Result<Vec<ProcessingLogEntry>> {
        self.blocking(move |db| db.logs_for(document_id)).await
    }
}

#[async_trait]
impl MetadataStoreProvider for SqliteMetadataStore {
    async fn insert(&self, record: &DocumentRecord) -> Result<()> {
        let row = record.clone();
        self.blocking(move |db| db.insert(&row)).await?;
        let _ = self.events.send(ChangeEvent::insert(record.clone()));
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: &RecordPatch) -> Result<DocumentRecord> {
        let patch = patch.clone();
        let (old, new) = self.blocking(move |db| db.update(id, &patch)).await?;
        let _ = self.events.send(ChangeEvent::update(old, new.clone()));
        Ok(new)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        match self.blocking(move |db| db.delete(id)).await? {
            Some(old) => {
                let _ = self.events.send(ChangeEvent::delete(old));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<DocumentRecord>> {
        let filter = filter.clone();
        self.blocking(move |db| db.query(&filter)).await
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<()> {
        let row = entry.clone();
        self.blocking(move |db| db.insert_log(&row)).await?;
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
        "sqlite"
    }
}

fn encode_result(result: Option<&ExtractionResult>) -> Result<Option<String>> {
    result.map(serde_json::to_string).transpose().map_err(Error::from)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_uuid(s: &str, idx: usize) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| conversion_error(idx, e))
}

fn row_to_record(row: &Row) -> rusqlite::Result<DocumentRecord> {
    let id: String = row.get("id")?;
    let kind: String = row.get("document_kind")?;
    let result_json: Option<String> = row.get("extraction_result")?;
    let byte_size: i64 = row.get("byte_size")?;

    let extraction_result = result_json
        .map(|json| serde_json::from_str::<ExtractionResult>(&json))
        .transpose()
        .map_err(|e| conversion_error(8, e))?;

    Ok(DocumentRecord {
        id: parse_uuid(&id, 0)?,
        storage_key: row.get("storage_key")?,
        display_name: row.get("display_name")?,
        byte_size: byte_size.max(0) as u64,
        mime_type: row.get("mime_type")?,
        document_kind: kind.parse().unwrap_or(DocumentKind::Other),
        processing: row.get("processing")?,
        processed: row.get("processed")?,
        extraction_result,
        processing_started_at: row.get("processing_started_at")?,
        last_event_at: row.get("last_event_at")?,
        created_at: row.get("created_at")?,
    })
}
