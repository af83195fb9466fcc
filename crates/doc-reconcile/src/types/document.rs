//! Document record types shared by every component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Inferred category of an ingested document
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    Receipt,
    BankStatement,
    Contract,
    TaxForm,
    Payslip,
    Other,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::Receipt => "receipt",
            DocumentKind::BankStatement => "bank_statement",
            DocumentKind::Contract => "contract",
            DocumentKind::TaxForm => "tax_form",
            DocumentKind::Payslip => "payslip",
            DocumentKind::Other => "other",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoice" => Ok(DocumentKind::Invoice),
            "receipt" => Ok(DocumentKind::Receipt),
            "bank_statement" => Ok(DocumentKind::BankStatement),
            "contract" => Ok(DocumentKind::Contract),
            "tax_form" => Ok(DocumentKind::TaxForm),
            "payslip" => Ok(DocumentKind::Payslip),
            "other" => Ok(DocumentKind::Other),
            other => Err(Error::Validation(format!("Unknown document kind: {}", other))),
        }
    }
}

/// Payload written by the extraction job when it finishes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionResult {
    /// The job reported failure
    #[serde(default)]
    pub error: bool,
    /// Failure reason or job remark
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured extracted data
    #[serde(default)]
    pub data: serde_json::Value,
    /// Kind detected by the extractor, overrides the inferred one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_kind: Option<DocumentKind>,
    /// Review workflow flags
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub rejected: bool,
    #[serde(default)]
    pub inserted: bool,
}

impl ExtractionResult {
    /// Successful extraction
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            error: false,
            message: None,
            data,
            document_kind: None,
            approved: false,
            rejected: false,
            inserted: false,
        }
    }

    /// Failed extraction with a reason
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error: true,
            message: Some(message.into()),
            data: serde_json::Value::Null,
            document_kind: None,
            approved: false,
            rejected: false,
            inserted: false,
        }
    }

    pub fn with_kind(mut self, kind: DocumentKind) -> Self {
        self.document_kind = Some(kind);
        self
    }

    /// Review status derived from the review flags
    pub fn review_status(&self) -> ReviewStatus {
        if self.inserted {
            ReviewStatus::Inserted
        } else if self.rejected {
            ReviewStatus::Rejected
        } else if self.approved {
            ReviewStatus::Approved
        } else {
            ReviewStatus::Pending
        }
    }
}

/// Human review outcome of a completed extraction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Inserted,
}

/// Metadata record for one ingested document
///
/// The lifecycle state is never stored; see [`crate::processing::LifecycleState::derive`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    /// Unique record ID
    pub id: Uuid,
    /// Object store key, unique per record
    pub storage_key: String,
    /// Original filename as uploaded
    pub display_name: String,
    /// Size in bytes
    pub byte_size: u64,
    /// Declared content type
    pub mime_type: String,
    /// Inferred category
    pub document_kind: DocumentKind,
    /// Extraction job running
    pub processing: bool,
    /// Extraction job finished (successfully or not)
    pub processed: bool,
    /// Job output, `None` until the job finishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_result: Option<ExtractionResult>,
    /// When the current processing attempt started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Last write or progress event seen for this record
    pub last_event_at: DateTime<Utc>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Create a fresh record in the `Uploaded` state
    pub fn new(
        id: Uuid,
        storage_key: impl Into<String>,
        display_name: impl Into<String>,
        byte_size: u64,
        mime_type: impl Into<String>,
        document_kind: DocumentKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            storage_key: storage_key.into(),
            display_name: display_name.into(),
            byte_size,
            mime_type: mime_type.into(),
            document_kind,
            processing: false,
            processed: false,
            extraction_result: None,
            processing_started_at: None,
            last_event_at: now,
            created_at: now,
        }
    }

    /// Review status, `Pending` when nothing has been extracted yet
    pub fn review_status(&self) -> ReviewStatus {
        self.extraction_result
            .as_ref()
            .map(|r| r.review_status())
            .unwrap_or(ReviewStatus::Pending)
    }

    /// Whether the job's result carries an error flag
    pub fn has_error(&self) -> bool {
        self.extraction_result.as_ref().is_some_and(|r| r.error)
    }

    /// Error message reported by the job, if any
    pub fn error_message(&self) -> Option<&str> {
        self.extraction_result
            .as_ref()
            .filter(|r| r.error)
            .and_then(|r| r.message.as_deref())
    }
}

/// Review flags written by the review workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReviewFlags {
    pub approved: bool,
    pub rejected: bool,
    pub inserted: bool,
}

/// Partial update of a [`DocumentRecord`]
///
/// `None` fields are left untouched. `extraction_result` is tri-state:
/// `None` keeps it, `Some(None)` clears it, `Some(Some(_))` replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_result: Option<Option<ExtractionResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_kind: Option<DocumentKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewFlags>,
}

impl RecordPatch {
    /// `Uploaded -> Processing`
    pub fn start_processing(now: DateTime<Utc>) -> Self {
        Self {
            processing: Some(true),
            processed: Some(false),
            processing_started_at: Some(now),
            last_event_at: Some(now),
            ..Default::default()
        }
    }

    /// `Stuck|Failed -> Processing`; wipes the previous attempt's payload
    pub fn retry(now: DateTime<Utc>) -> Self {
        Self {
            processing: Some(true),
            processed: Some(false),
            extraction_result: Some(None),
            processing_started_at: Some(now),
            last_event_at: Some(now),
            ..Default::default()
        }
    }

    /// Job finished successfully
    pub fn complete(result: ExtractionResult, now: DateTime<Utc>) -> Self {
        Self {
            processing: Some(false),
            processed: Some(true),
            document_kind: result.document_kind,
            extraction_result: Some(Some(result)),
            last_event_at: Some(now),
            ..Default::default()
        }
    }

    /// Job finished with an error
    pub fn fail(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            processing: Some(false),
            processed: Some(true),
            extraction_result: Some(Some(ExtractionResult::failure(message))),
            last_event_at: Some(now),
            ..Default::default()
        }
    }

    /// Record activity without changing state
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self {
            last_event_at: Some(now),
            ..Default::default()
        }
    }

    /// Review workflow decision
    pub fn review(flags: ReviewFlags, now: DateTime<Utc>) -> Self {
        Self {
            review: Some(flags),
            last_event_at: Some(now),
            ..Default::default()
        }
    }

    /// Apply this patch in place
    pub fn apply(&self, record: &mut DocumentRecord) {
        if let Some(processing) = self.processing {
            record.processing = processing;
        }
        if let Some(processed) = self.processed {
            record.processed = processed;
        }
        if let Some(result) = &self.extraction_result {
            record.extraction_result = result.clone();
        }
        if let Some(started) = self.processing_started_at {
            record.processing_started_at = Some(started);
        }
        if let Some(kind) = self.document_kind {
            record.document_kind = kind;
        }
        if let Some(flags) = self.review {
            if let Some(result) = record.extraction_result.as_mut() {
                result.approved = flags.approved;
                result.rejected = flags.rejected;
                result.inserted = flags.inserted;
            }
        }
        if let Some(at) = self.last_event_at {
            if at > record.last_event_at {
                record.last_event_at = at;
            }
        }
    }
}

/// Query filter for the metadata store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Restrict to these ids
    pub ids: Option<Vec<Uuid>>,
    /// Restrict to records whose `processing` flag matches
    pub processing: Option<bool>,
    /// Restrict to storage keys under this prefix
    pub storage_prefix: Option<String>,
}

impl RecordFilter {
    /// Every record
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: Uuid) -> Self {
        Self {
            ids: Some(vec![id]),
            ..Default::default()
        }
    }

    /// Records with a running job, the input of the stuck sweep
    pub fn processing() -> Self {
        Self {
            processing: Some(true),
            ..Default::default()
        }
    }

    pub fn under_prefix(prefix: impl Into<String>) -> Self {
        Self {
            storage_prefix: Some(prefix.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &DocumentRecord) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&record.id) {
                return false;
            }
        }
        if let Some(processing) = self.processing {
            if record.processing != processing {
                return false;
            }
        }
        if let Some(prefix) = &self.storage_prefix {
            if !record.storage_key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}
