//! Common imports for session consumers
//!
//! ```rust
//! use roomstate_sync::prelude::*;
//! ```

pub use crate::config::RoomConfig;
pub use crate::session::{RoomSession, StateChange, StateChangeCause, SubscriptionId};
pub use crate::snapshot::{FilesystemSnapshotStorage, MemorySnapshotStorage};

pub use roomstate_core::{
    ComponentKey, ConflictKind, ErrorReport, GameStateSnapshot, ManualResolution, Patch, Payload,
    PlayerId, RemoteEndpoint, ResolutionStrategy, RoomId, SessionError, SnapshotId,
    SnapshotStorage, StateConflict, UnifiedState, UpdateId,
};
