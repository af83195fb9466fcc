//! Local filesystem object store
//!
//! Keys map to relative paths under the storage root. Writes go to a
//! `.partial` sibling first and are renamed into place, so an interrupted
//! upload never leaves a half-written object that a listing would report.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

use super::object_store::{ObjectInfo, ObjectStoreProvider};

const PARTIAL_SUFFIX: &str = ".partial";

/// Object store backed by a directory
pub struct LocalObjectStore {
    /// Directory holding the objects
    root: PathBuf,
}

impl LocalObjectStore {
    /// Create a new local object store
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Resolve a key to a path, refusing anything that escapes the root
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe || key.ends_with(PARTIAL_SUFFIX) {
            return Err(Error::validation(format!("Invalid object key: {}", key)));
        }
        Ok(self.root.join(relative))
    }

    /// Object key for a path under the root
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStoreProvider for LocalObjectStore {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        tokio::fs::write(&partial, &data).await?;
        if let Err(e) = tokio::fs::rename(&partial, &path).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("object {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.object_path(key)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if !key.starts_with(prefix) {
                    continue;
                }

                let meta = entry.metadata().await?;
                let mut info = ObjectInfo::new(key.as_str(), meta.len());
                info.content_type = mime_guess::from_path(&key).first().map(|m| m.to_string());
                info.last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
                objects.push(info);
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.root.exists())
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_list_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf()).unwrap();

        store
            .put("uploads/x/a.pdf", Bytes::from_static(b"%PDF"), "application/pdf")
            .await
            .unwrap();
        store
            .put("other/b.pdf", Bytes::from_static(b"%PDF"), "application/pdf")
            .await
            .unwrap();

        let listed = store.list("uploads/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "uploads/x/a.pdf");
        assert_eq!(listed[0].size, 4);
        assert_eq!(listed[0].content_type.as_deref(), Some("application/pdf"));

        assert_eq!(store.get("uploads/x/a.pdf").await.unwrap(), Bytes::from_static(b"%PDF"));

        store.delete(&["uploads/x/a.pdf".to_string(), "uploads/missing.pdf".to_string()])
            .await
            .unwrap();
        assert!(!store.exists("uploads/x/a.pdf").await.unwrap());
        assert!(matches!(store.get("uploads/x/a.pdf").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn rejects_keys_escaping_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf()).unwrap();
        let err = store
            .put("../evil.pdf", Bytes::from_static(b"x"), "application/pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn partial_writes_are_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/c.pdf.partial"), b"half").unwrap();

        assert!(store.list("uploads/").await.unwrap().is_empty());
    }
}
