//! Local filesystem key-value backend.
//!
//! The whole store is one JSON object (`{"key": "value", ...}`) kept in
//! memory and rewritten atomically after every mutation.

use crate::error::{StorageError, StorageResult};
use crate::traits::KeyValueStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

/// Key-value store persisted as a single JSON document.
pub struct FilesystemStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FilesystemStore {
    /// Open (or create) the store document at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let entries = match fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|e| StorageError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(StorageError::Io(err)),
        };

        tracing::debug!(path = %path.display(), entries = entries.len(), "opened key-value store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the document to a temp file, fsync, then rename over the target.
    async fn persist(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        let data = serde_json::to_vec_pretty(entries)?;

        let temp_name = format!(".tmp.{}", Uuid::new_v4());
        let temp_path = self.path.with_file_name(
            self.path
                .file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        );
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(err));
        }

        Ok(())
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("empty key".into()));
    }
    Ok(())
}

#[async_trait]
impl KeyValueStore for FilesystemStore {
    async fn keys(&self) -> StorageResult<Vec<String>> {
        let entries = self.entries.lock().await;
        Ok(entries.keys().cloned().collect())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).cloned())
    }

    #[instrument(skip(self, value), fields(backend = "filesystem", size = value.len()))]
    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        validate_key(key)?;
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(key.to_string(), value);

        if let Err(err) = self.persist(&entries).await {
            // Keep memory consistent with disk.
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn remove(&self, key: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().await;
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };

        if let Err(err) = self.persist(&entries).await {
            entries.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::open(dir.path().join("ledger.json"))
            .await
            .unwrap();

        store.set("tus::a::1", "{}".into()).await.unwrap();
        assert_eq!(store.get("tus::a::1").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(store.keys().await.unwrap(), vec!["tus::a::1".to_string()]);

        store.remove("tus::a::1").await.unwrap();
        assert!(store.get("tus::a::1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_absent_key_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let store = FilesystemStore::open(&path).await.unwrap();

        store.remove("missing").await.unwrap();
        store.remove("missing").await.unwrap();
        // Nothing was ever written.
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");

        {
            let store = FilesystemStore::open(&path).await.unwrap();
            store.set("k1", "v1".into()).await.unwrap();
            store.set("k2", "v2".into()).await.unwrap();
            store.remove("k1").await.unwrap();
        }

        let reopened = FilesystemStore::open(&path).await.unwrap();
        assert_eq!(reopened.keys().await.unwrap(), vec!["k2".to_string()]);
        assert_eq!(reopened.get("k2").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::open(dir.path().join("ledger.json"))
            .await
            .unwrap();
        store.set("k", "v".into()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["ledger.json".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_document_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{not json").unwrap();

        match FilesystemStore::open(&path).await {
            Err(StorageError::Corrupt { path: p, .. }) => assert!(p.ends_with("ledger.json")),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected corrupt document error"),
        }
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::open(dir.path().join("ledger.json"))
            .await
            .unwrap();
        assert!(matches!(
            store.set("", "v".into()).await,
            Err(StorageError::InvalidKey(_))
        ));
    }
}
