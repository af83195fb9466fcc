//! Error types for the reconciliation layer

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciliation errors
///
/// Payloads are plain strings so the error can be cloned and handed to every
/// caller waiting on a shared fetch.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Network or timeout failure talking to a store or the extraction job
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Duplicate key or concurrent modification; never retried
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bad input rejected before any network call
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The extraction job reported failure
    #[error("Extraction job failed for {id}: {message}")]
    ExternalJob { id: Uuid, message: String },

    /// Retry budget spent; carries the last underlying reason
    #[error("{operation} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        reason: String,
    },

    /// A pending retry was replaced by a newer invocation of the same kind
    #[error("Retry of {0} superseded by a newer invocation")]
    RetrySuperseded(String),

    /// Operation cancelled through its cancellation token
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Record or object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Lifecycle transition not allowed from the current state
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite failure that is neither a conflict nor transient
    #[error("Database error: {0}")]
    Database(String),

    /// JSON/TOML encoding error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a transient I/O error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo(message.into())
    }

    /// Create a conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether the Retry Controller may schedule another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientIo(_))
    }

    /// Whether this error is the terminal result of a spent retry budget
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::RetriesExhausted { .. })
    }

    /// Human-readable reason shown to users alongside a terminal failure
    pub fn reason(&self) -> String {
        match self {
            Error::TransientIo(msg) => format!("Storage temporarily unavailable: {}", msg),
            Error::Conflict(msg) => format!("Conflicting change: {}", msg),
            Error::Validation(msg) => msg.clone(),
            Error::ExternalJob { message, .. } => format!("Extraction failed: {}", message),
            Error::RetriesExhausted {
                operation,
                attempts,
                reason,
            } => format!(
                "Gave up on {} after {} attempts (last error: {})",
                operation, attempts, reason
            ),
            Error::RetrySuperseded(op) => format!("A newer {} request replaced this one", op),
            Error::Cancelled(what) => format!("Cancelled: {}", what),
            Error::NotFound(what) => format!("{} no longer exists", what),
            Error::InvalidTransition { from, event } => {
                format!("Cannot {} a document that is {}", event, from)
            }
            Error::Config(msg) => format!("Configuration problem: {}", msg),
            Error::Database(msg) => format!("Metadata store error: {}", msg),
            Error::Serialization(msg) => format!("Malformed data: {}", msg),
            Error::Internal(msg) => format!("Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Error::Conflict(err.to_string()),
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                Error::Validation(err.to_string())
            }
            _ => Error::TransientIo(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Error::TransientIo(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                Error::TransientIo(err.to_string())
            }
            Some(status) if status.as_u16() == 409 => Error::Conflict(err.to_string()),
            Some(status) if status.is_client_error() => Error::Validation(err.to_string()),
            _ => Error::TransientIo(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::ConstraintViolation => Error::Conflict(err.to_string()),
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Error::TransientIo(err.to_string())
                }
                _ => Error::Database(err.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound(err.to_string()),
            _ => Error::Database(err.to_string()),
        }
    }
}
