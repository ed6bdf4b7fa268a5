//! Remote synchronization endpoint
//!
//! One round trip carries the local claim plus every live optimistic update.
//! The authority answers with its canonical state and per-update verdicts.

use crate::errors::TransportError;
use crate::identifiers::{PlayerId, RoomId, UpdateId};
use crate::state::{Patch, UnifiedState};
use crate::update::{OptimisticUpdate, UpdateKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Wire form of one pending optimistic update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdateEnvelope {
    /// Update identifier
    pub id: UpdateId,
    /// Game-rule defined kind
    pub kind: UpdateKind,
    /// Requesting player
    pub player_id: PlayerId,
    /// Component writes
    pub patch: Patch,
}

impl From<&OptimisticUpdate> for PendingUpdateEnvelope {
    fn from(update: &OptimisticUpdate) -> Self {
        Self {
            id: update.id,
            kind: update.kind.clone(),
            player_id: update.player_id.clone(),
            patch: update.patch.clone(),
        }
    }
}

/// Request sent to the authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Room being synchronized
    pub room_id: RoomId,
    /// Local claim
    pub state: UnifiedState,
    /// Live optimistic updates in submission order
    pub pending: Vec<PendingUpdateEnvelope>,
}

/// Authority reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Canonical authority state
    pub state: UnifiedState,
    /// Updates the authority applied
    #[serde(default)]
    pub accepted: Vec<UpdateId>,
    /// Updates the authority refused
    #[serde(default)]
    pub rejected: Vec<UpdateId>,
    /// Players the authority considers disconnected
    #[serde(default)]
    pub disconnected_players: Vec<PlayerId>,
}

impl SyncResponse {
    /// Response carrying only a state
    pub fn state_only(state: UnifiedState) -> Self {
        Self {
            state,
            accepted: Vec::new(),
            rejected: Vec::new(),
            disconnected_players: Vec::new(),
        }
    }
}

/// The room's single authoritative peer.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Perform one synchronization round trip
    async fn exchange(&self, request: SyncRequest) -> Result<SyncResponse, TransportError>;
}

#[async_trait]
impl<T: RemoteEndpoint + ?Sized> RemoteEndpoint for std::sync::Arc<T> {
    async fn exchange(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        (**self).exchange(request).await
    }
}
