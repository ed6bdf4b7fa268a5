//! Conflict resolver
//!
//! Each registered conflict moves `pending -> resolving -> resolved | failed`.
//! A failed strategy attempt returns the conflict to `pending`, where it waits
//! for another attempt or its auto-resolution deadline. At the deadline the
//! conflict is force-resolved with last-writer-wins, whatever the configured
//! strategy, including manual mode.
//!
//! Resolution consumes the conflict: resolving the same identifier twice
//! fails with [`ConflictResolutionError::UnknownConflict`].

use crate::config::ConflictConfig;
use roomstate_core::{
    ComponentKey, ConflictId, ConflictResolutionError, ConflictStatus, ManualResolution, Payload,
    PersistenceStatus, ResolutionStrategy, SnapshotRecord, StateConflict, SyncStatus, UnifiedState,
};
use std::collections::{BTreeSet, VecDeque};

/// Resolved identifiers remembered for duplicate suppression
const RESOLVED_HISTORY: usize = 64;

/// Inputs a strategy may need beyond the candidates
#[derive(Debug, Clone, Copy)]
pub struct ResolutionContext<'a> {
    /// Current time (ms since UNIX epoch)
    pub now: u64,
    /// Version of the canonical state at resolution time
    pub current_version: u64,
    /// Latest snapshot taken before the earliest candidate, if loaded
    pub checkpoint: Option<&'a SnapshotRecord>,
}

/// Output of a successful resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The consumed conflict
    pub conflict: StateConflict,
    /// Strategy that produced the state
    pub strategy: ResolutionStrategy,
    /// Resolved state
    pub state: UnifiedState,
    /// The authority-derived candidate the resolved state descends from
    pub authority: UnifiedState,
    /// Whether the auto-resolution timeout forced the outcome
    pub forced: bool,
}

#[derive(Debug, Clone)]
struct OpenConflict {
    conflict: StateConflict,
    status: ConflictStatus,
    deadline_at: u64,
    attempts: u32,
}

/// Registry and state machine for open conflicts
#[derive(Debug)]
pub struct ConflictResolver {
    config: ConflictConfig,
    open: Vec<OpenConflict>,
    closed: VecDeque<(ConflictId, ConflictStatus)>,
}

impl ConflictResolver {
    /// Create an empty resolver
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            config,
            open: Vec::new(),
            closed: VecDeque::new(),
        }
    }

    /// Strategy applied to newly registered conflicts
    pub fn default_strategy(&self) -> ResolutionStrategy {
        self.config.default_strategy
    }

    /// Track a conflict. Returns `false` when it is already known.
    pub fn register(&mut self, conflict: StateConflict, now: u64) -> bool {
        if self.status(conflict.id).is_some() {
            return false;
        }
        tracing::debug!(
            conflict_id = %conflict.id,
            kind = %conflict.kind,
            priority = ?conflict.priority,
            "conflict registered"
        );
        self.open.push(OpenConflict {
            deadline_at: now + self.config.auto_resolve_timeout_ms,
            conflict,
            status: ConflictStatus::Pending,
            attempts: 0,
        });
        true
    }

    /// Lifecycle status of a conflict
    pub fn status(&self, id: ConflictId) -> Option<ConflictStatus> {
        self.open
            .iter()
            .find(|c| c.conflict.id == id)
            .map(|c| c.status)
            .or_else(|| {
                self.closed
                    .iter()
                    .find(|(closed, _)| *closed == id)
                    .map(|(_, status)| *status)
            })
    }

    /// Open conflicts, most urgent first
    pub fn pending(&self) -> Vec<StateConflict> {
        let mut conflicts: Vec<_> = self.open.iter().map(|c| c.conflict.clone()).collect();
        conflicts.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.raised_at.cmp(&b.raised_at)));
        conflicts
    }

    /// An open conflict by identifier
    pub fn get(&self, id: ConflictId) -> Option<&StateConflict> {
        self.open.iter().find(|c| c.conflict.id == id).map(|c| &c.conflict)
    }

    /// Whether any conflict is open
    pub fn has_open(&self) -> bool {
        !self.open.is_empty()
    }

    /// Earliest auto-resolution deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.open.iter().map(|c| c.deadline_at).min()
    }

    /// Conflicts whose auto-resolution deadline has passed
    pub fn expired(&self, now: u64) -> Vec<ConflictId> {
        self.open
            .iter()
            .filter(|c| c.deadline_at <= now)
            .map(|c| c.conflict.id)
            .collect()
    }

    /// Resolve with the configured default strategy.
    ///
    /// In manual mode this returns
    /// [`ConflictResolutionError::AwaitingManualDecision`] and leaves the
    /// conflict pending.
    pub fn resolve(
        &mut self,
        id: ConflictId,
        ctx: ResolutionContext<'_>,
    ) -> Result<Resolution, ConflictResolutionError> {
        let strategy = self.config.default_strategy;
        if strategy == ResolutionStrategy::ManualResolution {
            self.open_mut(id)?;
            return Err(ConflictResolutionError::AwaitingManualDecision { conflict_id: id });
        }
        self.run(id, strategy, None, ctx, false)
    }

    /// Resolve with an explicit decision
    pub fn resolve_with(
        &mut self,
        id: ConflictId,
        decision: ManualResolution,
        ctx: ResolutionContext<'_>,
    ) -> Result<Resolution, ConflictResolutionError> {
        match decision {
            ManualResolution::State(state) => {
                self.run(id, ResolutionStrategy::ManualResolution, Some(state), ctx, false)
            }
            ManualResolution::Strategy(ResolutionStrategy::ManualResolution) => {
                Err(ConflictResolutionError::strategy_failed(
                    id,
                    ResolutionStrategy::ManualResolution,
                    "manual resolution requires a state",
                ))
            }
            ManualResolution::Strategy(strategy) => self.run(id, strategy, None, ctx, false),
        }
    }

    /// Force-resolve with last-writer-wins after the auto-resolution timeout
    pub fn force_resolve(
        &mut self,
        id: ConflictId,
        ctx: ResolutionContext<'_>,
    ) -> Result<Resolution, ConflictResolutionError> {
        self.run(id, ResolutionStrategy::LastWriterWins, None, ctx, true)
    }

    /// Give up on one open conflict. Returns `false` when it is not open.
    pub fn abandon(&mut self, id: ConflictId) -> bool {
        let before = self.open.len();
        self.open.retain(|c| c.conflict.id != id);
        if self.open.len() == before {
            return false;
        }
        tracing::warn!(conflict_id = %id, "conflict abandoned");
        self.remember(id, ConflictStatus::Failed);
        true
    }

    /// Drop abandoned conflicts from the history so the same divergence can be
    /// registered again. Returns how many were forgotten.
    pub fn forget_failed(&mut self) -> usize {
        let before = self.closed.len();
        self.closed.retain(|(_, status)| *status != ConflictStatus::Failed);
        before - self.closed.len()
    }

    /// Give up on every open conflict (room teardown)
    pub fn abandon_all(&mut self) -> Vec<ConflictId> {
        let abandoned: Vec<ConflictId> = self.open.drain(..).map(|c| c.conflict.id).collect();
        for id in &abandoned {
            tracing::warn!(conflict_id = %id, "conflict abandoned");
            self.remember(*id, ConflictStatus::Failed);
        }
        abandoned
    }

    fn open_mut(&mut self, id: ConflictId) -> Result<&mut OpenConflict, ConflictResolutionError> {
        self.open
            .iter_mut()
            .find(|c| c.conflict.id == id)
            .ok_or(ConflictResolutionError::UnknownConflict { conflict_id: id })
    }

    fn remember(&mut self, id: ConflictId, status: ConflictStatus) {
        self.closed.push_back((id, status));
        while self.closed.len() > RESOLVED_HISTORY {
            self.closed.pop_front();
        }
    }

    fn run(
        &mut self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        manual: Option<UnifiedState>,
        ctx: ResolutionContext<'_>,
        forced: bool,
    ) -> Result<Resolution, ConflictResolutionError> {
        let entry = self.open_mut(id)?;
        entry.status = ConflictStatus::Resolving;
        entry.attempts += 1;
        let attempts = entry.attempts;
        let conflict = entry.conflict.clone();

        match apply_strategy(&conflict, strategy, manual.as_ref(), &ctx) {
            Ok((state, authority)) => {
                self.open.retain(|c| c.conflict.id != id);
                self.remember(id, ConflictStatus::Resolved);
                tracing::info!(
                    conflict_id = %id,
                    strategy = %strategy,
                    version = state.version,
                    forced,
                    attempts,
                    "conflict resolved"
                );
                Ok(Resolution {
                    conflict,
                    strategy,
                    state,
                    authority,
                    forced,
                })
            }
            Err(message) => {
                if let Ok(entry) = self.open_mut(id) {
                    entry.status = ConflictStatus::Pending;
                }
                tracing::error!(
                    conflict_id = %id,
                    strategy = %strategy,
                    attempts,
                    error = %message,
                    "conflict resolution strategy failed"
                );
                Err(ConflictResolutionError::strategy_failed(id, strategy, message))
            }
        }
    }
}

// =============================================================================
// Strategies
// =============================================================================

/// Index of the last writer: greatest `updated_at`, then greatest version,
/// then lowest candidate index.
pub fn last_writer(candidates: &[UnifiedState]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            a.updated_at
                .cmp(&b.updated_at)
                .then(a.version.cmp(&b.version))
                .then(ib.cmp(ia))
        })
        .map(|(i, _)| i)
}

/// Index of the first writer: smallest `updated_at`, then greatest version,
/// then lowest candidate index.
pub fn first_writer(candidates: &[UnifiedState]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(a.version.cmp(&b.version))
                .then(ib.cmp(ia))
        })
        .map(|(i, _)| i)
}

/// Per-component union of the candidates' edits.
///
/// A component edited by exactly one candidate takes that candidate's value.
/// A component edited by several candidates, or by none, takes the value of
/// the last writer among them (or overall).
pub fn merge_changes(
    candidates: &[UnifiedState],
    affected: &BTreeSet<ComponentKey>,
) -> Option<Payload> {
    let overall = last_writer(candidates)?;
    let base = candidates.iter().map(|c| c.base_version).min()?;
    let edits: Vec<BTreeSet<ComponentKey>> =
        candidates.iter().map(|c| c.edits_since(base)).collect();

    let mut merged = candidates[overall].payload.clone();
    for key in affected {
        let touching: Vec<usize> = (0..candidates.len())
            .filter(|&i| edits[i].contains(key))
            .collect();
        let source = match touching.as_slice() {
            [] => overall,
            [only] => *only,
            several => {
                let subset: Vec<UnifiedState> =
                    several.iter().map(|&i| candidates[i].clone()).collect();
                last_writer(&subset).map(|i| several[i]).unwrap_or(overall)
            }
        };
        merged.write(key, candidates[source].payload.get_shared(key.as_str()));
    }
    Some(merged)
}

fn apply_strategy(
    conflict: &StateConflict,
    strategy: ResolutionStrategy,
    manual: Option<&UnifiedState>,
    ctx: &ResolutionContext<'_>,
) -> Result<(UnifiedState, UnifiedState), String> {
    let candidates = &conflict.conflicting_states;
    if candidates.is_empty() {
        return Err("conflict has no candidates".to_string());
    }
    if let Some(bad) = candidates.iter().find(|c| c.base_version > c.version) {
        return Err(format!(
            "malformed candidate: base version {} ahead of version {}",
            bad.base_version, bad.version
        ));
    }

    let payload = match strategy {
        ResolutionStrategy::LastWriterWins => {
            last_writer(candidates).map(|i| candidates[i].payload.clone())
        }
        ResolutionStrategy::FirstWriterWins => {
            first_writer(candidates).map(|i| candidates[i].payload.clone())
        }
        ResolutionStrategy::MergeChanges => {
            merge_changes(candidates, &conflict.affected_components)
        }
        ResolutionStrategy::ManualResolution => match manual {
            Some(state) => Some(state.payload.clone()),
            None => return Err("no manual decision supplied".to_string()),
        },
        ResolutionStrategy::RollbackToCheckpoint => {
            let earliest = conflict.earliest_candidate_at().unwrap_or(0);
            match ctx.checkpoint {
                Some(record) if record.timestamp <= earliest => Some(record.payload.clone()),
                Some(record) => {
                    return Err(format!(
                        "checkpoint {} is newer than the earliest candidate",
                        record.id
                    ))
                }
                None => return Err("no checkpoint precedes the conflict".to_string()),
            }
        }
    }
    .ok_or_else(|| "strategy selected no candidate".to_string())?;

    // Latest authority claim; ties prefer the later (remote) candidate
    let authority = candidates
        .iter()
        .max_by_key(|c| c.base_version)
        .cloned()
        .ok_or_else(|| "conflict has no candidates".to_string())?;

    let max_version = candidates
        .iter()
        .map(|c| c.version)
        .max()
        .unwrap_or(0)
        .max(ctx.current_version);

    let mut resolved = authority.clone();
    resolved.local_edits = payload.diff(&authority.payload);
    resolved.payload = payload;
    resolved.version = max_version + 1;
    resolved.updated_at = ctx.now.max(conflict.raised_at);
    resolved.persistence_status = PersistenceStatus::Dirty;
    resolved.sync_status = if resolved.local_edits.is_empty() {
        SyncStatus::Synchronized
    } else {
        SyncStatus::Syncing
    };
    Ok((resolved, authority))
}
