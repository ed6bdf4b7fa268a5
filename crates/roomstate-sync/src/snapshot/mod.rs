//! Snapshot persistence: the metadata-indexed store and its storage handlers

mod storage;
mod store;

pub use storage::{FilesystemSnapshotStorage, MemorySnapshotStorage};
pub use store::{QuotaUsage, SaveOutcome, SnapshotStore, AUTO_SAVE_TAG};
