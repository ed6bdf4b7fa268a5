//! Identifier types for rooms, players, updates, conflicts and snapshots
//!
//! Update and snapshot identifiers are random. Conflict identifiers are
//! derived from the diverging states so that detecting the same divergence
//! twice yields the same identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for deterministic (v5) identifiers derived inside the engine.
const ROOMSTATE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x7a, 0x3e, 0x51, 0x0c, 0x9d, 0x42, 0x4f, 0x1b, 0xa6, 0x08, 0x2c, 0xe4, 0x91, 0x5f, 0x33, 0xd7,
]);

macro_rules! uuid_identifier {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from a UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_identifier!(
    /// Identifies one game room. Every engine instance serves exactly one room.
    RoomId,
    "room"
);

uuid_identifier!(
    /// Identifies one optimistic update for its whole lifecycle.
    UpdateId,
    "update"
);

uuid_identifier!(
    /// Identifies a detected divergence between two state claims.
    ConflictId,
    "conflict"
);

uuid_identifier!(
    /// Identifies a persisted snapshot.
    SnapshotId,
    "snapshot"
);

impl ConflictId {
    /// Derive a conflict identifier from a stable description of the divergence.
    pub fn derive(label: &[u8]) -> Self {
        Self(Uuid::new_v5(&ROOMSTATE_NAMESPACE, label))
    }
}

/// Player identifier as issued by the (external) session identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Create a player identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PlayerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
