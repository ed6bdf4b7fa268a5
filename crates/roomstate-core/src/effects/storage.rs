//! Snapshot storage capability
//!
//! A flat key/value store for encoded snapshot records. Keys are plain
//! identifiers without path separators.

use crate::errors::StorageError;
use async_trait::async_trait;

/// Backing store for snapshot records
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;

    /// Read the value under `key`
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove `key`, returning whether it existed
    async fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// All stored keys, sorted
    async fn list_keys(&self) -> Result<Vec<String>, StorageError>;
}

#[async_trait]
impl<T: SnapshotStorage + ?Sized> SnapshotStorage for std::sync::Arc<T> {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        (**self).store(key, value).await
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).retrieve(key).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        (**self).remove(key).await
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        (**self).list_keys().await
    }
}
