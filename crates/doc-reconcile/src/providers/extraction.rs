//! External extraction job provider trait

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Trait for the asynchronous extraction job
///
/// `invoke` only starts the job. Its outcome is never returned here: the job
/// writes `processing=false, processed=true, extraction_result` to the
/// metadata store and the change feed carries it back.
///
/// Implementations:
/// - `HttpExtractionJob`: HTTP endpoint
/// - `InMemoryExtractionJob`: Records invocations
#[async_trait]
pub trait ExtractionJobProvider: Send + Sync {
    /// Start extraction for a document
    async fn invoke(&self, id: Uuid, storage_key: &str) -> Result<()>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
