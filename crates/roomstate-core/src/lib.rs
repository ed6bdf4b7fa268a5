//! # Roomstate Core
//!
//! Foundation types for the room state engine: the versioned state model,
//! optimistic update and conflict records, snapshot metadata, identifiers,
//! the error taxonomy and the effect interfaces for the remote authority,
//! snapshot storage and wall-clock time.
//!
//! This crate has no runtime. The engine itself lives in `roomstate-sync`.

#![forbid(unsafe_code)]

pub mod conflict;
pub mod effects;
pub mod errors;
pub mod identifiers;
pub mod snapshot;
pub mod state;
pub mod update;

pub use conflict::{
    ConflictKind, ConflictPriority, ConflictStatus, ManualResolution, ResolutionStrategy,
    StateConflict,
};
pub use effects::{
    PendingUpdateEnvelope, PhysicalClock, RemoteEndpoint, SnapshotStorage, SyncRequest,
    SyncResponse, SystemClock,
};
pub use errors::{
    ConflictResolutionError, ErrorKind, ErrorReport, OptimisticUpdateError, PersistenceError,
    Result, SessionError, StorageError, SyncError, TransportError,
};
pub use identifiers::{ConflictId, PlayerId, RoomId, SnapshotId, UpdateId};
pub use snapshot::{GameStateSnapshot, SnapshotRecord};
pub use state::{ComponentKey, Patch, Payload, PersistenceStatus, SyncStatus, UnifiedState};
pub use update::{OptimisticUpdate, UpdateKind};
