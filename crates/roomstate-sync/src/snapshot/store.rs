//! Snapshot store
//!
//! Keeps an in-memory metadata index over self-contained snapshot records in
//! a [`SnapshotStorage`] backend. Saves beyond the retention limit evict the
//! oldest snapshots. Usage is tracked against a byte budget; crossing the
//! warning ratio is reported but never blocks a write.

use crate::config::SnapshotConfig;
use roomstate_core::{
    GameStateSnapshot, PersistenceError, PersistenceStatus, SnapshotId, SnapshotRecord,
    SnapshotStorage, SyncStatus, UnifiedState,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Tag applied to timer-driven saves
pub const AUTO_SAVE_TAG: &str = "auto";

/// Storage usage against the configured budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    /// Bytes used by indexed snapshots
    pub used_bytes: u64,
    /// Configured budget
    pub quota_bytes: u64,
    /// `used_bytes / quota_bytes`
    pub ratio: f64,
    /// Whether usage crossed the warning ratio
    pub warning: bool,
}

/// Result of a successful save
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    /// Metadata of the new snapshot
    pub snapshot: GameStateSnapshot,
    /// Snapshots evicted to respect the retention limit
    pub evicted: Vec<SnapshotId>,
    /// Usage after the save
    pub usage: QuotaUsage,
}

/// Snapshot index over a storage backend
pub struct SnapshotStore {
    storage: Arc<dyn SnapshotStorage>,
    config: SnapshotConfig,
    /// Oldest first
    index: Vec<GameStateSnapshot>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("config", &self.config)
            .field("snapshots", &self.index.len())
            .finish_non_exhaustive()
    }
}

fn storage_key(id: SnapshotId) -> String {
    id.to_string()
}

impl SnapshotStore {
    /// Create a store with an empty index
    pub fn new(storage: Arc<dyn SnapshotStorage>, config: SnapshotConfig) -> Self {
        Self {
            storage,
            config,
            index: Vec::new(),
        }
    }

    /// Create a store and rebuild its index from the records already in
    /// `storage`. Unreadable records are skipped.
    pub async fn open(
        storage: Arc<dyn SnapshotStorage>,
        config: SnapshotConfig,
    ) -> Result<Self, PersistenceError> {
        let mut store = Self::new(storage, config);
        for key in store.storage.list_keys().await? {
            let bytes = match store.storage.retrieve(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "skipping unreadable snapshot");
                    continue;
                }
            };
            match serde_json::from_slice::<SnapshotRecord>(&bytes) {
                Ok(record) if storage_key(record.id) == key => {
                    store.index.push(record.metadata(bytes.len() as u64));
                }
                Ok(record) => {
                    tracing::warn!(key = %key, snapshot_id = %record.id, "snapshot key mismatch, skipping");
                }
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "skipping corrupt snapshot");
                }
            }
        }
        store.sort_index();
        tracing::debug!(snapshots = store.index.len(), "snapshot index rebuilt");
        Ok(store)
    }

    fn sort_index(&mut self) {
        self.index
            .sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.version.cmp(&b.version)));
    }

    /// Snapshot metadata, oldest first
    pub fn list(&self) -> Vec<GameStateSnapshot> {
        self.index.clone()
    }

    /// Metadata of one snapshot
    pub fn get(&self, id: SnapshotId) -> Option<&GameStateSnapshot> {
        self.index.iter().find(|s| s.id == id)
    }

    /// Most recent snapshot taken at or before `timestamp`
    pub fn latest_before(&self, timestamp: u64) -> Option<&GameStateSnapshot> {
        self.index.iter().rev().find(|s| s.timestamp <= timestamp)
    }

    /// Current usage against the budget
    pub fn usage(&self) -> QuotaUsage {
        let used_bytes: u64 = self.index.iter().map(|s| s.size).sum();
        let ratio = used_bytes as f64 / self.config.quota_bytes.max(1) as f64;
        QuotaUsage {
            used_bytes,
            quota_bytes: self.config.quota_bytes,
            ratio,
            warning: ratio > self.config.quota_warn_ratio,
        }
    }

    /// Persist the current state.
    pub async fn save(
        &mut self,
        state: &UnifiedState,
        description: impl Into<String>,
        tags: BTreeSet<String>,
        now: u64,
    ) -> Result<SaveOutcome, PersistenceError> {
        let record = SnapshotRecord {
            id: SnapshotId::new(),
            version: state.version,
            timestamp: now,
            description: description.into(),
            tags,
            payload: state.payload.clone(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| PersistenceError::SaveFailed {
            snapshot_id: record.id,
            message: e.to_string(),
        })?;
        let size = bytes.len() as u64;

        self.storage
            .store(&storage_key(record.id), bytes)
            .await
            .map_err(|e| {
                tracing::error!(snapshot_id = %record.id, error = %e, "snapshot write rejected");
                PersistenceError::SaveFailed {
                    snapshot_id: record.id,
                    message: e.to_string(),
                }
            })?;

        let snapshot = record.metadata(size);
        self.index.push(snapshot.clone());
        self.sort_index();
        let evicted = self.evict().await;

        let usage = self.usage();
        if usage.warning {
            tracing::warn!(
                used_bytes = usage.used_bytes,
                quota_bytes = usage.quota_bytes,
                "snapshot storage above warning threshold"
            );
        }
        tracing::info!(
            snapshot_id = %snapshot.id,
            version = snapshot.version,
            size,
            evicted = evicted.len(),
            "snapshot saved"
        );

        Ok(SaveOutcome {
            snapshot,
            evicted,
            usage,
        })
    }

    async fn evict(&mut self) -> Vec<SnapshotId> {
        let mut evicted = Vec::new();
        while self.index.len() > self.config.max_snapshots {
            let oldest = self.index.remove(0);
            if let Err(error) = self.storage.remove(&storage_key(oldest.id)).await {
                tracing::warn!(snapshot_id = %oldest.id, error = %error, "failed to remove evicted snapshot");
            }
            tracing::debug!(snapshot_id = %oldest.id, "snapshot evicted");
            evicted.push(oldest.id);
        }
        evicted
    }

    /// Read and decode one snapshot record
    pub async fn load(&self, id: SnapshotId) -> Result<SnapshotRecord, PersistenceError> {
        if self.get(id).is_none() {
            return Err(PersistenceError::NotFound { snapshot_id: id });
        }
        let restore_failed = |message: String| PersistenceError::RestoreFailed {
            snapshot_id: id,
            message,
        };

        let bytes = self
            .storage
            .retrieve(&storage_key(id))
            .await
            .map_err(|e| restore_failed(e.to_string()))?
            .ok_or_else(|| restore_failed("record missing from storage".to_string()))?;
        let record: SnapshotRecord =
            serde_json::from_slice(&bytes).map_err(|e| restore_failed(format!("corrupt record: {e}")))?;
        if record.id != id {
            return Err(restore_failed(format!("record holds {}", record.id)));
        }
        Ok(record)
    }

    /// Build the state produced by restoring snapshot `id` over `current`.
    ///
    /// The result's version is `max(current.version, snapshot.version) + 1`.
    /// Components whose content changes become local edits.
    pub async fn restore(
        &self,
        id: SnapshotId,
        current: &UnifiedState,
        now: u64,
    ) -> Result<UnifiedState, PersistenceError> {
        let record = self.load(id).await?;

        let mut restored = current.clone();
        restored
            .local_edits
            .extend(record.payload.diff(&current.payload));
        restored.payload = record.payload;
        restored.version = current.version.max(record.version) + 1;
        restored.updated_at = now.max(current.updated_at);
        restored.persistence_status = PersistenceStatus::Saved;
        if restored.has_local_edits() {
            restored.sync_status = SyncStatus::Syncing;
        }

        tracing::info!(
            snapshot_id = %id,
            snapshot_version = record.version,
            version = restored.version,
            "snapshot restored"
        );
        Ok(restored)
    }

    /// Delete a snapshot
    pub async fn delete(&mut self, id: SnapshotId) -> Result<(), PersistenceError> {
        let position = self
            .index
            .iter()
            .position(|s| s.id == id)
            .ok_or(PersistenceError::NotFound { snapshot_id: id })?;
        self.storage.remove(&storage_key(id)).await?;
        self.index.remove(position);
        tracing::debug!(snapshot_id = %id, "snapshot deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshotStorage;
    use assert_matches::assert_matches;
    use roomstate_core::Payload;
    use serde_json::json;

    fn state(version: u64, round: u64) -> UnifiedState {
        UnifiedState::authoritative(version, Payload::from_components([("round", json!(round))]), 0)
    }

    fn store(max_snapshots: usize) -> (SnapshotStore, Arc<MemorySnapshotStorage>) {
        let storage = Arc::new(MemorySnapshotStorage::new());
        let config = SnapshotConfig {
            max_snapshots,
            ..SnapshotConfig::default()
        };
        (SnapshotStore::new(storage.clone(), config), storage)
    }

    #[tokio::test]
    async fn save_then_restore_round_trips_payload() {
        let (mut store, _) = store(10);
        let saved = state(7, 3);
        let outcome = store.save(&saved, "round 3", BTreeSet::new(), 100).await.unwrap();
        assert_eq!(outcome.snapshot.version, 7);
        assert!(outcome.snapshot.size > 0);

        let restored = store.restore(outcome.snapshot.id, &saved, 200).await.unwrap();
        assert_eq!(restored.payload, saved.payload);
        assert_eq!(restored.version, 8);
        assert!(restored.local_edits.is_empty());
    }

    #[tokio::test]
    async fn restore_advances_past_current_version() {
        let (mut store, _) = store(10);
        let outcome = store.save(&state(3, 1), "early", BTreeSet::new(), 100).await.unwrap();

        let current = state(12, 5);
        let restored = store.restore(outcome.snapshot.id, &current, 200).await.unwrap();
        assert_eq!(restored.version, 13);
        assert_eq!(restored.payload.get("round"), Some(&json!(1)));
        assert!(restored.local_edits.contains("round"));
    }

    #[tokio::test]
    async fn eviction_keeps_newest() {
        let (mut store, storage) = store(3);
        let mut ids = Vec::new();
        for i in 0..5u64 {
            let outcome = store.save(&state(i, i), "s", BTreeSet::new(), i * 10).await.unwrap();
            ids.push(outcome.snapshot.id);
        }

        let listed: Vec<_> = store.list().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, ids[2..].to_vec());
        assert_eq!(storage.list_keys().await.unwrap().len(), 3);
        assert_matches!(
            store.restore(ids[0], &state(9, 9), 100).await,
            Err(PersistenceError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn latest_before_picks_newest_not_after_timestamp() {
        let (mut store, _) = store(10);
        let mut ids = Vec::new();
        for (version, at) in [(1, 100), (2, 200), (3, 300)] {
            let outcome = store
                .save(&state(version, version), "s", BTreeSet::new(), at)
                .await
                .unwrap();
            ids.push(outcome.snapshot.id);
        }

        assert!(store.latest_before(99).is_none());
        assert_eq!(store.latest_before(100).map(|s| s.id), Some(ids[0]));
        assert_eq!(store.latest_before(250).map(|s| s.id), Some(ids[1]));
        assert_eq!(store.latest_before(u64::MAX).map(|s| s.id), Some(ids[2]));
    }

    #[tokio::test]
    async fn corrupt_record_fails_restore() {
        let (mut store, storage) = store(10);
        let outcome = store.save(&state(1, 1), "s", BTreeSet::new(), 10).await.unwrap();
        storage
            .store(&outcome.snapshot.id.to_string(), b"not json".to_vec())
            .await
            .unwrap();

        assert_matches!(
            store.restore(outcome.snapshot.id, &state(1, 1), 20).await,
            Err(PersistenceError::RestoreFailed { .. })
        );
    }

    #[tokio::test]
    async fn quota_warning_is_reported_without_failing() {
        let storage = Arc::new(MemorySnapshotStorage::new());
        let config = SnapshotConfig {
            quota_bytes: 64,
            ..SnapshotConfig::default()
        };
        let mut store = SnapshotStore::new(storage, config);

        let outcome = store.save(&state(1, 1), "big", BTreeSet::new(), 10).await.unwrap();
        assert!(outcome.usage.warning);
        assert!(outcome.usage.used_bytes > 0);
    }

    #[tokio::test]
    async fn open_rebuilds_index() {
        let storage = Arc::new(MemorySnapshotStorage::new());
        let mut first = SnapshotStore::new(storage.clone(), SnapshotConfig::default());
        first.save(&state(1, 1), "a", BTreeSet::new(), 10).await.unwrap();
        first.save(&state(2, 2), "b", BTreeSet::new(), 20).await.unwrap();
        storage.store("garbage", b"{".to_vec()).await.unwrap();

        let reopened = SnapshotStore::open(storage, SnapshotConfig::default()).await.unwrap();
        let versions: Vec<_> = reopened.list().iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(reopened.usage().used_bytes, first.usage().used_bytes);
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let (mut store, storage) = store(10);
        let outcome = store.save(&state(1, 1), "s", BTreeSet::new(), 10).await.unwrap();

        store.delete(outcome.snapshot.id).await.unwrap();
        assert!(store.list().is_empty());
        assert!(storage.list_keys().await.unwrap().is_empty());
        assert_matches!(
            store.delete(outcome.snapshot.id).await,
            Err(PersistenceError::NotFound { .. })
        );
    }
}
