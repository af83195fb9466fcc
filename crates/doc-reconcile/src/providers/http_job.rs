//! HTTP extraction job provider
//!
//! Starts the external extraction by POSTing the document id and key to a
//! configured endpoint. The endpoint acknowledges and runs the job on its
//! own; the outcome arrives through the metadata store.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::config::ExtractionConfig;
use crate::error::{Error, Result};

use super::extraction::ExtractionJobProvider;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeRequest<'a> {
    document_id: Uuid,
    storage_key: &'a str,
}

/// Extraction job reached over HTTP
pub struct HttpExtractionJob {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpExtractionJob {
    /// Create a new HTTP extraction job client
    pub fn new(config: &ExtractionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ExtractionJobProvider for HttpExtractionJob {
    async fn invoke(&self, id: Uuid, storage_key: &str) -> Result<()> {
        let mut request = self.client.post(&self.endpoint).json(&InvokeRequest {
            document_id: id,
            storage_key,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        response.error_for_status()?;

        tracing::debug!("Extraction job accepted for {} ({})", id, storage_key);
        Ok(())
    }

    fn name(&self) -> &str {
        "http-extraction"
    }
}
