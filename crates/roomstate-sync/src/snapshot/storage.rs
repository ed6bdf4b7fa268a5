//! Snapshot storage handlers
//!
//! [`MemorySnapshotStorage`] keeps records in process memory.
//! [`FilesystemSnapshotStorage`] writes one `<key>.json` file per record
//! under a base directory.

use async_trait::async_trait;
use parking_lot::RwLock;
use roomstate_core::{SnapshotStorage, StorageError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;

const RECORD_EXTENSION: &str = "json";

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(StorageError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// In-memory snapshot storage
#[derive(Debug, Default)]
pub struct MemorySnapshotStorage {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemorySnapshotStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored bytes
    pub fn total_bytes(&self) -> usize {
        self.records.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl SnapshotStorage for MemorySnapshotStorage {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.records.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.records.write().remove(key).is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.records.read().keys().cloned().collect())
    }
}

/// Filesystem snapshot storage
#[derive(Debug, Clone)]
pub struct FilesystemSnapshotStorage {
    base_path: PathBuf,
}

impl FilesystemSnapshotStorage {
    /// Storage rooted at `base_path`; the directory is created on first write
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Root directory
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base_path.join(format!("{key}.{RECORD_EXTENSION}")))
    }
}

#[async_trait]
impl SnapshotStorage for FilesystemSnapshotStorage {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|e| StorageError::write_failed(key, format!("create directory: {e}")))?;

        // Records are replaced atomically through a staging file
        let staging = path.with_extension("tmp");
        fs::write(&staging, value)
            .await
            .map_err(|e| StorageError::write_failed(key, e))?;
        fs::rename(&staging, &path)
            .await
            .map_err(|e| StorageError::write_failed(key, e))?;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::read_failed(key, e)),
        }
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::delete_failed(key, e)),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::ListFailed {
                    message: e.to_string(),
                })
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::ListFailed {
                message: e.to_string(),
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemorySnapshotStorage::new();
        storage.store("snapshot-a", b"{}".to_vec()).await.unwrap();

        assert_eq!(storage.retrieve("snapshot-a").await.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(storage.list_keys().await.unwrap(), vec!["snapshot-a".to_string()]);
        assert!(storage.remove("snapshot-a").await.unwrap());
        assert!(!storage.remove("snapshot-a").await.unwrap());
    }

    #[tokio::test]
    async fn filesystem_storage_lists_only_records() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemSnapshotStorage::new(dir.path().join("snapshots"));

        assert!(storage.list_keys().await.unwrap().is_empty());
        storage.store("snapshot-b", b"[1]".to_vec()).await.unwrap();
        storage.store("snapshot-a", b"[2]".to_vec()).await.unwrap();
        std::fs::write(dir.path().join("snapshots").join("notes.txt"), "x").unwrap();

        assert_eq!(
            storage.list_keys().await.unwrap(),
            vec!["snapshot-a".to_string(), "snapshot-b".to_string()]
        );
        assert_eq!(storage.retrieve("snapshot-b").await.unwrap(), Some(b"[1]".to_vec()));
        assert_eq!(storage.retrieve("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemSnapshotStorage::new(dir.path());

        let result = storage.store("../escape", Vec::new()).await;
        assert!(matches!(result, Err(StorageError::InvalidKey { .. })));
    }
}
