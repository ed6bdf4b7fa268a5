//! Fault-injecting snapshot storage

use async_trait::async_trait;
use parking_lot::Mutex;
use roomstate_core::{SnapshotStorage, StorageError};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, Vec<u8>>,
    fail_writes: bool,
    fail_reads: bool,
    writes: usize,
}

/// In-memory storage whose reads and writes can be made to fail, and whose
/// records can be corrupted in place.
#[derive(Debug, Default)]
pub struct FaultyStorage {
    inner: Mutex<Inner>,
}

impl FaultyStorage {
    /// Healthy, empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Make every subsequent read fail (or succeed again)
    pub fn fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    /// Overwrite a stored record with bytes that do not decode
    pub fn corrupt(&self, key: &str) -> bool {
        match self.inner.lock().records.get_mut(key) {
            Some(bytes) => {
                *bytes = b"{not json".to_vec();
                true
            }
            None => false,
        }
    }

    /// Keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().records.keys().cloned().collect()
    }

    /// Successful writes so far
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }
}

#[async_trait]
impl SnapshotStorage for FaultyStorage {
    async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(StorageError::write_failed(key, "injected write failure"));
        }
        inner.records.insert(key.to_string(), value);
        inner.writes += 1;
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.lock();
        if inner.fail_reads {
            return Err(StorageError::read_failed(key, "injected read failure"));
        }
        Ok(inner.records.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.inner.lock().records.remove(key).is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.inner.lock().records.keys().cloned().collect())
    }
}
