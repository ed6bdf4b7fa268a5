//! Change notifications and listener registry

use parking_lot::RwLock;
use roomstate_core::{
    ConflictId, ErrorReport, ResolutionStrategy, SnapshotId, StateConflict, UnifiedState, UpdateId,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What caused a committed state transition
#[derive(Debug, Clone, PartialEq)]
pub enum StateChangeCause {
    /// An optimistic update was applied
    UpdateApplied {
        /// Update identifier
        update_id: UpdateId,
    },
    /// A rolled-back update was re-applied
    UpdateRetried {
        /// Update identifier
        update_id: UpdateId,
    },
    /// The authority confirmed an update
    UpdateConfirmed {
        /// Update identifier
        update_id: UpdateId,
    },
    /// An update was rolled back (rejected or timed out)
    UpdateRolledBack {
        /// Update identifier
        update_id: UpdateId,
        /// Whether the payload changed
        changed: bool,
    },
    /// The authority's state was adopted
    RemoteAdopted {
        /// Authority version adopted
        authority_version: u64,
    },
    /// A conflict was resolved
    ConflictResolved {
        /// Conflict identifier
        conflict_id: ConflictId,
        /// Strategy applied
        strategy: ResolutionStrategy,
        /// Whether the auto-resolution timeout forced the outcome
        forced: bool,
    },
    /// A snapshot was restored
    SnapshotRestored {
        /// Snapshot identifier
        snapshot_id: SnapshotId,
    },
}

impl StateChangeCause {
    /// Whether the transition originated locally and should be pushed to the
    /// authority right away
    pub fn is_local(&self) -> bool {
        match self {
            StateChangeCause::UpdateApplied { .. }
            | StateChangeCause::UpdateRetried { .. }
            | StateChangeCause::ConflictResolved { .. }
            | StateChangeCause::SnapshotRestored { .. } => true,
            StateChangeCause::UpdateRolledBack { changed, .. } => *changed,
            StateChangeCause::UpdateConfirmed { .. } | StateChangeCause::RemoteAdopted { .. } => {
                false
            }
        }
    }
}

/// A committed transition of the canonical state
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Version before the transition
    pub previous_version: u64,
    /// State after the transition
    pub state: UnifiedState,
    /// Cause
    pub cause: StateChangeCause,
}

/// Handle returned by listener registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription-{}", self.0)
    }
}

/// State change callback
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;
/// Conflict callback
pub type ConflictListener = Arc<dyn Fn(&StateConflict) + Send + Sync>;
/// Error callback
pub type ErrorListener = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// Listener registry shared by the session actor and its handles.
///
/// Callbacks run on the actor task after the lock is released, so a listener
/// may unsubscribe itself. Long-running callbacks delay the actor.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    state: RwLock<Vec<(SubscriptionId, StateListener)>>,
    conflict: RwLock<Vec<(SubscriptionId, ConflictListener)>>,
    error: RwLock<Vec<(SubscriptionId, ErrorListener)>>,
}

impl Listeners {
    fn next(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn add_state(&self, listener: StateListener) -> SubscriptionId {
        let id = self.next();
        self.state.write().push((id, listener));
        id
    }

    pub(crate) fn add_conflict(&self, listener: ConflictListener) -> SubscriptionId {
        let id = self.next();
        self.conflict.write().push((id, listener));
        id
    }

    pub(crate) fn add_error(&self, listener: ErrorListener) -> SubscriptionId {
        let id = self.next();
        self.error.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.state.write().retain(|(sid, _)| {
            let keep = *sid != id;
            removed |= !keep;
            keep
        });
        self.conflict.write().retain(|(sid, _)| {
            let keep = *sid != id;
            removed |= !keep;
            keep
        });
        self.error.write().retain(|(sid, _)| {
            let keep = *sid != id;
            removed |= !keep;
            keep
        });
        removed
    }

    pub(crate) fn emit_state(&self, change: &StateChange) {
        let listeners: Vec<StateListener> =
            self.state.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(change);
        }
    }

    pub(crate) fn emit_conflict(&self, conflict: &StateConflict) {
        let listeners: Vec<ConflictListener> =
            self.conflict.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(conflict);
        }
    }

    pub(crate) fn emit_error(&self, report: &ErrorReport) {
        let listeners: Vec<ErrorListener> =
            self.error.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in listeners {
            listener(report);
        }
    }
}
