//! Optimistic update manager
//!
//! The working state is the last authority-derived payload plus an ordered
//! list of reversible deltas, one per pending update. Each pending entry keeps
//! the inverse patch of its own writes, so rolling back one update restores
//! exactly its pre-image and leaves newer, independent updates untouched.
//!
//! When an older update is rolled back and a newer pending update wrote the
//! same component afterwards, the older pre-image is handed down to the newer
//! entry instead of being written to the payload: the newer value stays
//! visible, and rolling back the newer update later restores the value that
//! existed before both.
//!
//! Every operation takes the current state by reference and returns a new
//! state value; the caller decides whether to commit it.

use crate::config::OptimisticConfig;
use roomstate_core::{
    ComponentKey, OptimisticUpdate, OptimisticUpdateError, Patch, Payload, PendingUpdateEnvelope,
    PersistenceStatus, PlayerId, SyncStatus, UnifiedState, UpdateId,
};
use std::collections::{BTreeSet, VecDeque};

/// Inverse of one update's writes, relative to the working payload
#[derive(Debug, Clone, Default)]
struct PreImage {
    patch: Patch,
    /// Components that were already local edits before the update applied
    prior_local_edits: BTreeSet<ComponentKey>,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    update: OptimisticUpdate,
    pre_image: PreImage,
    deadline_at: u64,
    retries: u32,
    /// The update's delta lost a conflict resolution and is no longer visible
    superseded: bool,
}

#[derive(Debug, Clone)]
struct RolledBackEntry {
    update: OptimisticUpdate,
    retries: u32,
}

/// Result of rolling back one update
#[derive(Debug, Clone)]
pub struct Rollback {
    /// State after the rollback
    pub state: UnifiedState,
    /// The rolled-back update
    pub update: OptimisticUpdate,
    /// Whether the payload changed
    pub changed: bool,
    /// Rolled-back update evicted from the retry pool to make room
    pub evicted: Option<UpdateId>,
}

/// Tracks pending optimistic updates for one room
#[derive(Debug)]
pub struct OptimisticUpdateManager {
    config: OptimisticConfig,
    pending: VecDeque<PendingEntry>,
    rolled_back: VecDeque<RolledBackEntry>,
}

impl OptimisticUpdateManager {
    /// Create an empty manager
    pub fn new(config: OptimisticConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            rolled_back: VecDeque::new(),
        }
    }

    /// Number of unconfirmed updates
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Identifiers of unconfirmed updates in submission order
    pub fn pending_ids(&self) -> Vec<UpdateId> {
        self.pending.iter().map(|e| e.update.id).collect()
    }

    /// Identifiers of rolled-back updates awaiting retry or discard
    pub fn rolled_back_ids(&self) -> Vec<UpdateId> {
        self.rolled_back.iter().map(|e| e.update.id).collect()
    }

    /// Whether `id` is pending
    pub fn is_pending(&self, id: UpdateId) -> bool {
        self.position(id).is_some()
    }

    /// Whether `id` is pending but its delta lost a resolution
    pub fn is_superseded(&self, id: UpdateId) -> bool {
        self.position(id)
            .is_some_and(|index| self.pending[index].superseded)
    }

    /// Earliest timeout among pending updates
    pub fn next_deadline(&self) -> Option<u64> {
        self.pending.iter().map(|e| e.deadline_at).min()
    }

    /// Wire form of the updates whose delta is still visible
    pub fn envelopes(&self) -> Vec<PendingUpdateEnvelope> {
        self.pending
            .iter()
            .filter(|e| !e.superseded)
            .map(|e| PendingUpdateEnvelope::from(&e.update))
            .collect()
    }

    /// Components written by visible pending updates
    pub fn live_components(&self) -> BTreeSet<ComponentKey> {
        self.pending
            .iter()
            .filter(|e| !e.superseded)
            .flat_map(|e| e.update.patch.component_set())
            .collect()
    }

    /// Components written by visible pending updates of the given players
    pub fn components_edited_by(&self, players: &[PlayerId]) -> BTreeSet<ComponentKey> {
        self.pending
            .iter()
            .filter(|e| !e.superseded && players.contains(&e.update.player_id))
            .flat_map(|e| e.update.patch.component_set())
            .collect()
    }

    fn position(&self, id: UpdateId) -> Option<usize> {
        self.pending.iter().position(|e| e.update.id == id)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Apply an update to a copy of `state`.
    ///
    /// Fails fast with [`OptimisticUpdateError::Backpressure`] when the pending
    /// set is full.
    pub fn apply(
        &mut self,
        state: &UnifiedState,
        update: OptimisticUpdate,
        now: u64,
    ) -> Result<UnifiedState, OptimisticUpdateError> {
        self.apply_with_retries(state, update, 0, now)
    }

    fn apply_with_retries(
        &mut self,
        state: &UnifiedState,
        update: OptimisticUpdate,
        retries: u32,
        now: u64,
    ) -> Result<UnifiedState, OptimisticUpdateError> {
        if self.pending.len() >= self.config.max_pending {
            tracing::warn!(
                update_id = %update.id,
                max_pending = self.config.max_pending,
                "rejecting update: pending set full"
            );
            return Err(OptimisticUpdateError::Backpressure {
                max_pending: self.config.max_pending,
            });
        }
        if update.patch.is_empty() {
            return Err(OptimisticUpdateError::ApplyFailed {
                update_id: update.id,
                message: "update writes no components".to_string(),
            });
        }
        if self.is_pending(update.id) {
            return Err(OptimisticUpdateError::ApplyFailed {
                update_id: update.id,
                message: "update is already pending".to_string(),
            });
        }

        let mut next = state.clone();
        let prior_local_edits = update
            .patch
            .components()
            .filter(|k| next.local_edits.contains(*k))
            .cloned()
            .collect();
        let inverse = next.payload.apply(&update.patch);
        next.local_edits.extend(update.patch.component_set());
        next.version = state.version + 1;
        next.updated_at = now.max(state.updated_at);
        next.sync_status = SyncStatus::Syncing;
        next.persistence_status = PersistenceStatus::Dirty;

        tracing::debug!(
            update_id = %update.id,
            kind = %update.kind,
            version = next.version,
            retry = retries,
            "optimistic update applied"
        );
        self.pending.push_back(PendingEntry {
            deadline_at: now + self.config.update_timeout_ms,
            update,
            pre_image: PreImage {
                patch: inverse,
                prior_local_edits,
            },
            retries,
            superseded: false,
        });
        Ok(next)
    }

    /// Mark an update confirmed and drop it from the pending set.
    ///
    /// The state is not touched; the version bump happened on apply. An update
    /// confirmed after a local rollback is dropped from the retry pool.
    pub fn confirm(&mut self, id: UpdateId) -> Result<OptimisticUpdate, OptimisticUpdateError> {
        if let Some(index) = self.position(id) {
            if let Some(entry) = self.pending.remove(index) {
                let mut update = entry.update;
                update.confirmed = true;
                tracing::debug!(update_id = %id, "optimistic update confirmed");
                return Ok(update);
            }
        }
        if let Some(index) = self.rolled_back.iter().position(|e| e.update.id == id) {
            if let Some(entry) = self.rolled_back.remove(index) {
                let mut update = entry.update;
                update.confirmed = true;
                tracing::debug!(update_id = %id, "rolled-back update confirmed by authority");
                return Ok(update);
            }
        }
        Err(OptimisticUpdateError::UnknownUpdate { update_id: id })
    }

    /// Revert only the delta of update `id`.
    pub fn rollback(
        &mut self,
        state: &UnifiedState,
        id: UpdateId,
        now: u64,
    ) -> Result<Rollback, OptimisticUpdateError> {
        let index = match self.position(id) {
            Some(index) => index,
            None if self.rolled_back.iter().any(|e| e.update.id == id) => {
                return Err(OptimisticUpdateError::RollbackFailed {
                    update_id: id,
                    message: "update is already rolled back".to_string(),
                })
            }
            None => return Err(OptimisticUpdateError::UnknownUpdate { update_id: id }),
        };
        let Some(entry) = self.pending.remove(index) else {
            return Err(OptimisticUpdateError::UnknownUpdate { update_id: id });
        };

        let mut next = state.clone();
        let mut changed = false;
        for (key, previous) in entry.pre_image.patch.iter() {
            let was_local = entry.pre_image.prior_local_edits.contains(key);
            // Newer entries from `index` on were applied after this one
            let later = self
                .pending
                .iter_mut()
                .skip(index)
                .find(|e| !e.superseded && e.update.patch.touches(key.as_str()));
            match later {
                Some(later) => {
                    later.pre_image.patch.insert_write(key.clone(), previous.clone());
                    if was_local {
                        later.pre_image.prior_local_edits.insert(key.clone());
                    } else {
                        later.pre_image.prior_local_edits.remove(key.as_str());
                    }
                }
                None => {
                    next.payload.write(key, previous.clone());
                    if !was_local {
                        next.local_edits.remove(key.as_str());
                    }
                    changed = true;
                }
            }
        }

        if changed {
            next.version = state.version + 1;
            next.updated_at = now.max(state.updated_at);
            next.persistence_status = PersistenceStatus::Dirty;
        }
        if self.pending.is_empty() && next.local_edits.is_empty() {
            next.sync_status = SyncStatus::Synchronized;
        }

        tracing::warn!(
            update_id = %id,
            version = next.version,
            superseded = entry.superseded,
            "optimistic update rolled back"
        );

        let update = entry.update.clone();
        self.rolled_back.push_back(RolledBackEntry {
            update: entry.update,
            retries: entry.retries,
        });
        let evicted = if self.rolled_back.len() > self.config.max_pending {
            self.rolled_back.pop_front().map(|e| {
                tracing::warn!(update_id = %e.update.id, "rolled-back update evicted from retry pool");
                e.update.id
            })
        } else {
            None
        };

        Ok(Rollback {
            state: next,
            update,
            changed,
            evicted,
        })
    }

    /// Roll back every update whose timeout has passed, oldest first.
    pub fn expire(&mut self, state: &UnifiedState, now: u64) -> (UnifiedState, Vec<Rollback>) {
        let expired: Vec<UpdateId> = self
            .pending
            .iter()
            .filter(|e| e.deadline_at <= now)
            .map(|e| e.update.id)
            .collect();

        let mut current = state.clone();
        let mut rollbacks = Vec::with_capacity(expired.len());
        for id in expired {
            match self.rollback(&current, id, now) {
                Ok(rollback) => {
                    current = rollback.state.clone();
                    rollbacks.push(rollback);
                }
                Err(error) => {
                    tracing::error!(update_id = %id, error = %error, "timed-out update rollback failed");
                }
            }
        }
        (current, rollbacks)
    }

    /// Re-apply a rolled-back update.
    ///
    /// After `max_retries` re-applications the update is dropped for good and
    /// [`OptimisticUpdateError::MaxRetriesExceeded`] is returned.
    pub fn retry(
        &mut self,
        state: &UnifiedState,
        id: UpdateId,
        now: u64,
    ) -> Result<UnifiedState, OptimisticUpdateError> {
        let index = self
            .rolled_back
            .iter()
            .position(|e| e.update.id == id)
            .ok_or(OptimisticUpdateError::UnknownUpdate { update_id: id })?;

        if self.rolled_back[index].retries >= self.config.max_retries {
            let attempts = self.rolled_back[index].retries;
            self.rolled_back.remove(index);
            tracing::error!(update_id = %id, attempts, "update dropped after max retries");
            return Err(OptimisticUpdateError::MaxRetriesExceeded {
                update_id: id,
                attempts,
            });
        }
        if self.pending.len() >= self.config.max_pending {
            return Err(OptimisticUpdateError::Backpressure {
                max_pending: self.config.max_pending,
            });
        }

        let Some(entry) = self.rolled_back.remove(index) else {
            return Err(OptimisticUpdateError::UnknownUpdate { update_id: id });
        };
        let mut update = entry.update;
        update.timestamp = now;
        self.apply_with_retries(state, update, entry.retries + 1, now)
    }

    /// Drop a rolled-back update without retrying it.
    pub fn discard(&mut self, id: UpdateId) -> Result<OptimisticUpdate, OptimisticUpdateError> {
        let index = self
            .rolled_back
            .iter()
            .position(|e| e.update.id == id)
            .ok_or(OptimisticUpdateError::UnknownUpdate { update_id: id })?;
        let entry = self
            .rolled_back
            .remove(index)
            .ok_or(OptimisticUpdateError::UnknownUpdate { update_id: id })?;
        tracing::debug!(update_id = %id, "rolled-back update discarded");
        Ok(entry.update)
    }

    // =========================================================================
    // Rebase
    // =========================================================================

    /// Re-apply pending updates on top of a newly adopted payload.
    ///
    /// `state` carries the adopted payload. Pending updates writing any
    /// component in `lost` are marked superseded: their delta is no longer
    /// visible, but they stay pending until confirmed or timed out. Surviving
    /// updates are replayed in submission order, with the components they write
    /// first reset to `anchor` (the authority's values), so their pre-images
    /// point at authority content.
    pub fn rebase(
        &mut self,
        state: &UnifiedState,
        lost: &BTreeSet<ComponentKey>,
        anchor: &Payload,
    ) -> UnifiedState {
        let mut next = state.clone();

        for entry in self.pending.iter_mut() {
            if !entry.superseded && entry.update.patch.components().any(|k| lost.contains(k)) {
                entry.superseded = true;
                entry.pre_image = PreImage::default();
                tracing::debug!(update_id = %entry.update.id, "pending update superseded");
            }
        }

        let replayed: BTreeSet<ComponentKey> = self
            .pending
            .iter()
            .filter(|e| !e.superseded)
            .flat_map(|e| e.update.patch.component_set())
            .collect();
        for key in &replayed {
            next.payload.write(key, anchor.get_shared(key.as_str()));
            next.local_edits.remove(key.as_str());
        }

        for entry in self.pending.iter_mut().filter(|e| !e.superseded) {
            let prior_local_edits = entry
                .update
                .patch
                .components()
                .filter(|k| next.local_edits.contains(*k))
                .cloned()
                .collect();
            let inverse = next.payload.apply(&entry.update.patch);
            next.local_edits.extend(entry.update.patch.component_set());
            entry.pre_image = PreImage {
                patch: inverse,
                prior_local_edits,
            };
        }

        next.sync_status = if next.local_edits.is_empty() && self.pending.is_empty() {
            SyncStatus::Synchronized
        } else {
            SyncStatus::Syncing
        };
        next
    }

    /// Hide every pending update's delta, e.g. after a snapshot restore
    /// replaced the payload wholesale.
    pub fn supersede_all(&mut self) {
        for entry in self.pending.iter_mut().filter(|e| !e.superseded) {
            entry.superseded = true;
            entry.pre_image = PreImage::default();
        }
    }
}
