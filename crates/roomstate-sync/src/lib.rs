//! Roomstate-Sync: per-room state engine
//!
//! Keeps one game room's canonical state consistent between a local
//! participant and the room's authoritative peer.
//!
//! # Architecture Overview
//!
//! - [`synchronizer`]: periodic and on-demand exchange with the authority,
//!   with bounded exponential backoff and at most one round in flight
//! - [`detector`]: decides whether two state claims are identical, ordered,
//!   or in conflict, using the causality metadata on each state
//! - [`optimistic`]: applies local mutations immediately and keeps each one
//!   reversible until the authority confirms or rejects it
//! - [`resolver`]: conflict lifecycle and the resolution strategies
//! - [`snapshot`]: durable, restorable checkpoints with retention and quota
//! - [`session`]: the actor that owns the state and serializes every
//!   transition
//!
//! # Usage
//!
//! ```rust,no_run
//! use roomstate_sync::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! async fn join(endpoint: Arc<dyn RemoteEndpoint>) -> Result<(), SessionError> {
//!     let session = RoomSession::builder(RoomId::new(), endpoint)
//!         .with_config(RoomConfig::builder().with_max_pending(20).build()?)
//!         .spawn()
//!         .await?;
//!
//!     session.on_state_change(|change| {
//!         println!("room now at version {}", change.state.version);
//!     });
//!
//!     session
//!         .submit_update("vote", Patch::new().set("votes", json!({"p1": true})), "p1")
//!         .await?;
//!     session.shutdown().await
//! }
//! ```

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod detector;
pub mod metrics;
pub mod optimistic;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod snapshot;
pub mod synchronizer;

pub mod prelude;

pub use clock::TokioClock;
pub use config::{
    ConflictConfig, OptimisticConfig, RoomConfig, RoomConfigBuilder, SnapshotConfig, SyncConfig,
};
pub use detector::{Divergence, Side};
pub use metrics::{LatencyHistogram, SyncMetrics, SyncMetricsSnapshot};
pub use optimistic::{OptimisticUpdateManager, Rollback};
pub use resolver::{ConflictResolver, Resolution, ResolutionContext};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use session::{
    RoomSession, RoomSessionBuilder, StateChange, StateChangeCause, SubscriptionId, UpdateBacklog,
};
pub use snapshot::{
    FilesystemSnapshotStorage, MemorySnapshotStorage, QuotaUsage, SaveOutcome, SnapshotStore,
    AUTO_SAVE_TAG,
};
pub use synchronizer::{Reconciliation, StateSynchronizer, SyncRound, SyncTicket};

// Foundation types used throughout the public API
pub use roomstate_core::{
    ComponentKey, ConflictId, ErrorReport, Patch, Payload, PlayerId, RoomId, SessionError,
    SnapshotId, UnifiedState, UpdateId,
};
