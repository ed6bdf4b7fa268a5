//! Snapshot metadata and persisted records

use crate::identifiers::SnapshotId;
use crate::state::Payload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Metadata of a persisted, immutable copy of the room state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStateSnapshot {
    /// Snapshot identifier
    pub id: SnapshotId,
    /// Creation time (ms since UNIX epoch)
    pub timestamp: u64,
    /// Version of the state at save time
    pub version: u64,
    /// Human-readable description
    pub description: String,
    /// Free-form tags (`"auto"` marks timer-driven saves)
    pub tags: BTreeSet<String>,
    /// Encoded record size in bytes
    pub size: u64,
}

/// Self-contained persisted form of one snapshot.
///
/// Records never reference each other, so each one can live in its own file
/// or row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Identifier
    pub id: SnapshotId,
    /// State version at save time
    pub version: u64,
    /// Creation time (ms since UNIX epoch)
    pub timestamp: u64,
    /// Human-readable description
    pub description: String,
    /// Tags
    pub tags: BTreeSet<String>,
    /// Room data at save time
    pub payload: Payload,
}

impl SnapshotRecord {
    /// Metadata for this record given its encoded size
    pub fn metadata(&self, size: u64) -> GameStateSnapshot {
        GameStateSnapshot {
            id: self.id,
            timestamp: self.timestamp,
            version: self.version,
            description: self.description.clone(),
            tags: self.tags.clone(),
            size,
        }
    }
}
