//! Error taxonomy for the room state engine
//!
//! Each engine component has its own error enum. Effect boundaries (the remote
//! endpoint and snapshot storage) report [`TransportError`] and
//! [`StorageError`], which the engine maps into its own taxonomy. Every
//! terminal error reaches the session error channel as an [`ErrorReport`] so
//! consumers can offer retry or discard without knowing engine internals.

use crate::identifiers::{ConflictId, SnapshotId, UpdateId};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Effect boundary errors
// =============================================================================

/// Failure reported by a remote synchronization endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TransportError {
    /// The endpoint could not be reached
    #[error("Endpoint unreachable: {message}")]
    Unreachable {
        /// Transport-level description
        message: String,
    },

    /// The exchange did not complete in time
    #[error("Exchange timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The endpoint refused the request
    #[error("Request rejected: {message}")]
    Rejected {
        /// Reason given by the endpoint
        message: String,
    },
}

impl TransportError {
    /// Create an unreachable error
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }

    /// Create a rejection error
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }
}

/// Failure reported by a snapshot storage handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum StorageError {
    /// Writing a record failed
    #[error("Failed to write {key}: {message}")]
    WriteFailed {
        /// Storage key
        key: String,
        /// Underlying cause
        message: String,
    },

    /// Reading a record failed
    #[error("Failed to read {key}: {message}")]
    ReadFailed {
        /// Storage key
        key: String,
        /// Underlying cause
        message: String,
    },

    /// Deleting a record failed
    #[error("Failed to delete {key}: {message}")]
    DeleteFailed {
        /// Storage key
        key: String,
        /// Underlying cause
        message: String,
    },

    /// Listing records failed
    #[error("Failed to list records: {message}")]
    ListFailed {
        /// Underlying cause
        message: String,
    },

    /// The key cannot be mapped onto the backing store
    #[error("Invalid storage key: {key}")]
    InvalidKey {
        /// Offending key
        key: String,
    },
}

impl StorageError {
    /// Create a write failure
    pub fn write_failed(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::WriteFailed {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a read failure
    pub fn read_failed(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::ReadFailed {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Create a delete failure
    pub fn delete_failed(key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::DeleteFailed {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

// =============================================================================
// Engine errors
// =============================================================================

/// Synchronization failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SyncError {
    /// Transport failure; retried with backoff
    #[error("Network error on attempt {attempt}: {message}")]
    Network {
        /// Retry attempt that failed (1-based)
        attempt: u32,
        /// Transport description
        message: String,
    },

    /// The exchange exceeded the request timeout; retried with backoff
    #[error("Sync timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Retries are exhausted; sync is halted until resumed
    #[error("Sync failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of failed attempts
        attempts: u32,
        /// Last failure
        last_error: String,
    },

    /// The endpoint refused the exchange outright; sync is halted until
    /// resumed
    #[error("Sync rejected by authority: {message}")]
    Rejected {
        /// Reason given by the authority
        message: String,
    },

    /// A completion arrived for a round that is no longer in flight
    #[error("Sync round {round} is not in flight")]
    StaleRound {
        /// Round the completion belonged to
        round: u64,
    },
}

impl SyncError {
    /// Classify a transport failure for the given attempt
    pub fn from_transport(error: &TransportError, attempt: u32) -> Self {
        match error {
            TransportError::Timeout { timeout_ms } => Self::Timeout {
                timeout_ms: *timeout_ms,
            },
            TransportError::Unreachable { message } => Self::Network {
                attempt,
                message: message.clone(),
            },
            TransportError::Rejected { message } => Self::Rejected {
                message: message.clone(),
            },
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "sync.network",
            Self::Timeout { .. } => "sync.timeout",
            Self::RetriesExhausted { .. } => "sync.retries_exhausted",
            Self::Rejected { .. } => "sync.rejected",
            Self::StaleRound { .. } => "sync.stale_round",
        }
    }

    /// Whether the synchronizer will retry on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

/// Optimistic update lifecycle failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum OptimisticUpdateError {
    /// The update could not be applied to the working state
    #[error("Failed to apply update {update_id}: {message}")]
    ApplyFailed {
        /// Update identifier
        update_id: UpdateId,
        /// Reason
        message: String,
    },

    /// The update could not be rolled back
    #[error("Failed to roll back update {update_id}: {message}")]
    RollbackFailed {
        /// Update identifier
        update_id: UpdateId,
        /// Reason
        message: String,
    },

    /// The update was rolled back too many times and is dropped
    #[error("Update {update_id} exceeded {attempts} retries and was dropped")]
    MaxRetriesExceeded {
        /// Update identifier
        update_id: UpdateId,
        /// Retries attempted
        attempts: u32,
    },

    /// The pending set is full
    #[error("Too many pending updates (max {max_pending})")]
    Backpressure {
        /// Configured ceiling
        max_pending: usize,
    },

    /// A rolled-back update was evicted from the retry pool
    #[error("Rolled-back update {update_id} evicted from the retry pool")]
    Evicted {
        /// Update identifier
        update_id: UpdateId,
    },

    /// No pending or rolled-back update has this identifier
    #[error("Unknown update {update_id}")]
    UnknownUpdate {
        /// Update identifier
        update_id: UpdateId,
    },
}

impl OptimisticUpdateError {
    /// Update the error refers to, if any
    pub fn update_id(&self) -> Option<UpdateId> {
        match self {
            Self::ApplyFailed { update_id, .. }
            | Self::RollbackFailed { update_id, .. }
            | Self::MaxRetriesExceeded { update_id, .. }
            | Self::Evicted { update_id }
            | Self::UnknownUpdate { update_id } => Some(*update_id),
            Self::Backpressure { .. } => None,
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::ApplyFailed { .. } => "update.apply_failed",
            Self::RollbackFailed { .. } => "update.rollback_failed",
            Self::MaxRetriesExceeded { .. } => "update.max_retries_exceeded",
            Self::Backpressure { .. } => "update.backpressure",
            Self::Evicted { .. } => "update.evicted",
            Self::UnknownUpdate { .. } => "update.unknown",
        }
    }

    /// Whether the caller may try the same operation again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure { .. })
    }
}

/// Conflict resolution failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ConflictResolutionError {
    /// The strategy could not produce a state; the conflict stays pending
    #[error("Strategy {strategy} failed for {conflict_id}: {message}")]
    StrategyFailed {
        /// Conflict identifier
        conflict_id: ConflictId,
        /// Strategy that failed
        strategy: String,
        /// Reason
        message: String,
    },

    /// No open conflict has this identifier
    #[error("Unknown or already resolved conflict {conflict_id}")]
    UnknownConflict {
        /// Conflict identifier
        conflict_id: ConflictId,
    },

    /// The conflict waits for an explicit decision
    #[error("Conflict {conflict_id} awaits a manual decision")]
    AwaitingManualDecision {
        /// Conflict identifier
        conflict_id: ConflictId,
    },
}

impl ConflictResolutionError {
    /// Create a strategy failure
    pub fn strategy_failed(
        conflict_id: ConflictId,
        strategy: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::StrategyFailed {
            conflict_id,
            strategy: strategy.to_string(),
            message: message.into(),
        }
    }

    /// Conflict the error refers to
    pub fn conflict_id(&self) -> ConflictId {
        match self {
            Self::StrategyFailed { conflict_id, .. }
            | Self::UnknownConflict { conflict_id }
            | Self::AwaitingManualDecision { conflict_id } => *conflict_id,
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::StrategyFailed { .. } => "conflict.strategy_failed",
            Self::UnknownConflict { .. } => "conflict.unknown",
            Self::AwaitingManualDecision { .. } => "conflict.awaiting_manual_decision",
        }
    }
}

/// Snapshot persistence failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum PersistenceError {
    /// The storage rejected a snapshot write
    #[error("Snapshot save failed: {message}")]
    SaveFailed {
        /// Snapshot being saved
        snapshot_id: SnapshotId,
        /// Underlying cause
        message: String,
    },

    /// The snapshot could not be read or decoded
    #[error("Snapshot {snapshot_id} restore failed: {message}")]
    RestoreFailed {
        /// Snapshot being restored
        snapshot_id: SnapshotId,
        /// Underlying cause
        message: String,
    },

    /// No snapshot with this identifier exists
    #[error("Snapshot {snapshot_id} not found")]
    NotFound {
        /// Snapshot identifier
        snapshot_id: SnapshotId,
    },

    /// Removing or listing snapshots failed
    #[error("Snapshot storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PersistenceError {
    /// Snapshot the error refers to, if any
    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        match self {
            Self::SaveFailed { snapshot_id, .. }
            | Self::RestoreFailed { snapshot_id, .. }
            | Self::NotFound { snapshot_id } => Some(*snapshot_id),
            Self::Storage(_) => None,
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::SaveFailed { .. } => "persistence.save_failed",
            Self::RestoreFailed { .. } => "persistence.restore_failed",
            Self::NotFound { .. } => "persistence.not_found",
            Self::Storage(_) => "persistence.storage",
        }
    }
}

/// Umbrella error returned by the session API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SessionError {
    /// Synchronization failure
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Optimistic update failure
    #[error(transparent)]
    Update(#[from] OptimisticUpdateError),

    /// Conflict resolution failure
    #[error(transparent)]
    Conflict(#[from] ConflictResolutionError),

    /// Snapshot persistence failure
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The session has shut down
    #[error("Room session is closed")]
    Closed,

    /// Configuration rejected by validation
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong
        message: String,
    },
}

impl SessionError {
    /// Create an invalid configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sync(e) => e.code(),
            Self::Update(e) => e.code(),
            Self::Conflict(e) => e.code(),
            Self::Persistence(e) => e.code(),
            Self::Closed => "session.closed",
            Self::InvalidConfig { .. } => "session.invalid_config",
        }
    }
}

/// Result alias for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

// =============================================================================
// Error reports
// =============================================================================

/// Engine component an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// State synchronizer
    Sync,
    /// Optimistic update manager
    OptimisticUpdate,
    /// Conflict resolver
    ConflictResolution,
    /// Snapshot store
    Persistence,
    /// Session lifecycle or configuration
    Session,
}

/// Self-describing error delivered to `on_error` listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Originating component
    pub kind: ErrorKind,
    /// Stable error code
    pub code: String,
    /// Update involved, if any
    pub update_id: Option<UpdateId>,
    /// Conflict involved, if any
    pub conflict_id: Option<ConflictId>,
    /// Snapshot involved, if any
    pub snapshot_id: Option<SnapshotId>,
    /// Human-readable message
    pub message: String,
    /// Whether repeating the triggering operation may succeed
    pub retryable: bool,
    /// Whether the engine has given up on the operation
    pub terminal: bool,
}

impl From<&SessionError> for ErrorReport {
    fn from(error: &SessionError) -> Self {
        let mut report = ErrorReport {
            kind: ErrorKind::Session,
            code: error.code().to_string(),
            update_id: None,
            conflict_id: None,
            snapshot_id: None,
            message: error.to_string(),
            retryable: false,
            terminal: true,
        };
        match error {
            SessionError::Sync(e) => {
                report.kind = ErrorKind::Sync;
                report.retryable = e.is_retryable();
                report.terminal = !e.is_retryable();
            }
            SessionError::Update(e) => {
                report.kind = ErrorKind::OptimisticUpdate;
                report.update_id = e.update_id();
                report.retryable = e.is_retryable()
                    || matches!(e, OptimisticUpdateError::RollbackFailed { .. });
            }
            SessionError::Conflict(e) => {
                report.kind = ErrorKind::ConflictResolution;
                report.conflict_id = Some(e.conflict_id());
                // A failed strategy leaves the conflict pending
                report.terminal = !matches!(e, ConflictResolutionError::StrategyFailed { .. });
            }
            SessionError::Persistence(e) => {
                report.kind = ErrorKind::Persistence;
                report.snapshot_id = e.snapshot_id();
                report.retryable = matches!(e, PersistenceError::SaveFailed { .. });
            }
            SessionError::Closed | SessionError::InvalidConfig { .. } => {}
        }
        report
    }
}

macro_rules! report_from {
    ($($error:ty),* $(,)?) => {
        $(
            impl From<$error> for ErrorReport {
                fn from(error: $error) -> Self {
                    ErrorReport::from(&SessionError::from(error))
                }
            }
        )*
    };
}

report_from!(
    SyncError,
    OptimisticUpdateError,
    ConflictResolutionError,
    PersistenceError,
);

impl From<SessionError> for ErrorReport {
    fn from(error: SessionError) -> Self {
        ErrorReport::from(&error)
    }
}
