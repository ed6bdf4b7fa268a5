//! Optimistic update records

use crate::identifiers::{PlayerId, UpdateId};
use crate::state::Patch;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Game-rule defined kind of an update (e.g. `"vote"`, `"propose_team"`).
///
/// The engine never interprets the kind; it is carried for observability and
/// for the authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateKind(String);

impl UpdateKind {
    /// Create an update kind
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// Borrow the kind as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UpdateKind {
    fn from(kind: &str) -> Self {
        Self(kind.to_string())
    }
}

/// A tentative local mutation, applied before the authority confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimisticUpdate {
    /// Unique identifier
    pub id: UpdateId,
    /// Game-rule defined kind
    pub kind: UpdateKind,
    /// Player that requested the mutation
    pub player_id: PlayerId,
    /// Submission time (ms since UNIX epoch)
    pub timestamp: u64,
    /// Human-readable description
    pub description: String,
    /// Whether the authority has confirmed the update
    pub confirmed: bool,
    /// Component writes requested by the update
    pub patch: Patch,
}

impl OptimisticUpdate {
    /// Create an unconfirmed update with a fresh identifier
    pub fn new(
        kind: impl Into<UpdateKind>,
        patch: Patch,
        player_id: impl Into<PlayerId>,
        timestamp: u64,
    ) -> Self {
        let kind = kind.into();
        Self {
            id: UpdateId::new(),
            description: kind.to_string(),
            kind,
            player_id: player_id.into(),
            timestamp,
            confirmed: false,
            patch,
        }
    }

    /// Builder: set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}
