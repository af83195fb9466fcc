//! Object store provider trait for raw document bytes

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Listing entry returned by [`ObjectStoreProvider::list`]
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    /// Full object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Content type recorded at write time (or guessed from the key)
    pub content_type: Option<String>,
    /// Free-form object metadata
    pub metadata: HashMap<String, String>,
    /// Last modification time, when the backend reports one
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            content_type: None,
            metadata: HashMap::new(),
            last_modified: None,
        }
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Trait for object storage
///
/// `list` is assumed eventually consistent: a deleted key may still be
/// listed for a while, and a freshly written key may not be listed yet.
///
/// Implementations:
/// - `LocalObjectStore`: Local filesystem
/// - `InMemoryObjectStore`: Process memory, with lag and failure injection
#[async_trait]
pub trait ObjectStoreProvider: Send + Sync {
    /// Write an object, replacing any previous content
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()>;

    /// Read an object; `Error::NotFound` when absent
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Delete objects; keys that do not exist are ignored
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// List objects under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Check if an object exists
    async fn exists(&self, key: &str) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check if the provider is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}
