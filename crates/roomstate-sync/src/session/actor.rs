//! Session actor
//!
//! Owns the canonical state together with the synchronizer, the optimistic
//! update manager, the conflict resolver and the snapshot store. Every
//! mutation enters through the command channel, a sync completion, or a timer,
//! and is committed from this one task.
//!
//! The sync round trip runs on a spawned task that only holds a copy of the
//! request. Its result comes back on the completion channel, so aborting the
//! task on shutdown leaves nothing half-applied.

use super::events::{Listeners, StateChange, StateChangeCause};
use crate::config::RoomConfig;
use crate::metrics::SyncMetrics;
use crate::optimistic::{OptimisticUpdateManager, Rollback};
use crate::resolver::{ConflictResolver, Resolution, ResolutionContext};
use crate::snapshot::{QuotaUsage, SnapshotStore, AUTO_SAVE_TAG};
use crate::synchronizer::{exchange_with_timeout, Reconciliation, StateSynchronizer};
use roomstate_core::{
    ComponentKey, ConflictId, ConflictResolutionError, GameStateSnapshot, ManualResolution,
    OptimisticUpdate, OptimisticUpdateError, Patch, PersistenceError, PersistenceStatus,
    PhysicalClock, PlayerId, RemoteEndpoint, ResolutionStrategy, RoomId, SessionError, SnapshotId,
    SnapshotRecord, StateConflict, SyncError, SyncResponse, SyncStatus, TransportError,
    UnifiedState, UpdateId, UpdateKind,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Wake-up period when no timer is armed
const IDLE_WAKEUP_MS: u64 = 60_000;

/// Unconfirmed and rolled-back updates of a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBacklog {
    /// Pending updates in submission order
    pub pending: Vec<UpdateId>,
    /// Rolled-back updates awaiting retry or discard
    pub rolled_back: Vec<UpdateId>,
}

pub(crate) type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    Submit {
        kind: UpdateKind,
        patch: Patch,
        player_id: PlayerId,
        description: Option<String>,
        reply: Reply<Result<UpdateId, SessionError>>,
    },
    Retry {
        update_id: UpdateId,
        reply: Reply<Result<(), SessionError>>,
    },
    Discard {
        update_id: UpdateId,
        reply: Reply<Result<(), SessionError>>,
    },
    Backlog {
        reply: Reply<UpdateBacklog>,
    },
    PendingConflicts {
        reply: Reply<Vec<StateConflict>>,
    },
    ResolveWith {
        conflict_id: ConflictId,
        decision: ManualResolution,
        reply: Reply<Result<UnifiedState, SessionError>>,
    },
    SaveSnapshot {
        description: String,
        tags: BTreeSet<String>,
        reply: Reply<Result<GameStateSnapshot, SessionError>>,
    },
    ListSnapshots {
        reply: Reply<Vec<GameStateSnapshot>>,
    },
    RestoreSnapshot {
        snapshot_id: SnapshotId,
        reply: Reply<Result<UnifiedState, SessionError>>,
    },
    DeleteSnapshot {
        snapshot_id: SnapshotId,
        reply: Reply<Result<(), SessionError>>,
    },
    SnapshotUsage {
        reply: Reply<QuotaUsage>,
    },
    SyncNow {
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

struct SyncCompletion {
    round: u64,
    result: Result<SyncResponse, TransportError>,
}

enum Decision {
    Default,
    Explicit(ManualResolution),
    Forced,
}

pub(crate) struct SessionActor {
    room_id: RoomId,
    clock: Arc<dyn PhysicalClock>,
    endpoint: Arc<dyn RemoteEndpoint>,
    state: UnifiedState,
    state_tx: watch::Sender<UnifiedState>,
    synchronizer: StateSynchronizer,
    optimistic: OptimisticUpdateManager,
    resolver: ConflictResolver,
    snapshots: SnapshotStore,
    listeners: Arc<Listeners>,
    autosave_interval_ms: Option<u64>,
    next_autosave_at: Option<u64>,
    sync_task: Option<JoinHandle<()>>,
    completions_tx: mpsc::UnboundedSender<SyncCompletion>,
    completions_rx: mpsc::UnboundedReceiver<SyncCompletion>,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        room_id: RoomId,
        config: &RoomConfig,
        clock: Arc<dyn PhysicalClock>,
        endpoint: Arc<dyn RemoteEndpoint>,
        state: UnifiedState,
        state_tx: watch::Sender<UnifiedState>,
        snapshots: SnapshotStore,
        listeners: Arc<Listeners>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let now = clock.now_ms();
        let autosave_interval_ms = config
            .snapshot
            .autosave_interval()
            .map(|interval| interval.as_millis() as u64);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            room_id,
            synchronizer: StateSynchronizer::new(room_id, &config.sync, metrics, now),
            optimistic: OptimisticUpdateManager::new(config.optimistic.clone()),
            resolver: ConflictResolver::new(config.conflict.clone()),
            clock,
            endpoint,
            state,
            state_tx,
            snapshots,
            listeners,
            autosave_interval_ms,
            next_autosave_at: autosave_interval_ms.map(|interval| now + interval),
            sync_task: None,
            completions_tx,
            completions_rx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::info!(room = %self.room_id, version = self.state.version, "room session started");
        loop {
            let now = self.clock.now_ms();
            self.on_timers(now).await;
            self.maybe_start_sync(now);

            let delay = self
                .next_wakeup()
                .map_or(IDLE_WAKEUP_MS, |at| at.saturating_sub(self.clock.now_ms()));
            let sleep = tokio::time::sleep(Duration::from_millis(delay));

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(done) = self.completions_rx.recv() => self.on_sync_complete(done).await,
                () = sleep => {}
            }
        }
    }

    fn next_wakeup(&self) -> Option<u64> {
        let sync_due = if self.resolver.has_open() {
            None
        } else {
            self.synchronizer.next_due_at()
        };
        [
            sync_due,
            self.optimistic.next_deadline(),
            self.resolver.next_deadline(),
            self.next_autosave_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle(&mut self, command: Command) {
        let now = self.clock.now_ms();
        match command {
            Command::Submit {
                kind,
                patch,
                player_id,
                description,
                reply,
            } => {
                let _ = reply.send(self.submit(kind, patch, player_id, description, now));
            }
            Command::Retry { update_id, reply } => {
                let _ = reply.send(self.retry(update_id, now));
            }
            Command::Discard { update_id, reply } => {
                let result = self
                    .optimistic
                    .discard(update_id)
                    .map(|_| ())
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::Backlog { reply } => {
                let _ = reply.send(UpdateBacklog {
                    pending: self.optimistic.pending_ids(),
                    rolled_back: self.optimistic.rolled_back_ids(),
                });
            }
            Command::PendingConflicts { reply } => {
                let _ = reply.send(self.resolver.pending());
            }
            Command::ResolveWith {
                conflict_id,
                decision,
                reply,
            } => {
                let result = self
                    .resolve_conflict(conflict_id, Decision::Explicit(decision), now)
                    .await
                    .map_err(|error| self.report(error));
                let _ = reply.send(result);
            }
            Command::SaveSnapshot {
                description,
                tags,
                reply,
            } => {
                let result = self
                    .save_snapshot(description, tags, now)
                    .await
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::ListSnapshots { reply } => {
                let _ = reply.send(self.snapshots.list());
            }
            Command::RestoreSnapshot { snapshot_id, reply } => {
                let result = self
                    .restore_snapshot(snapshot_id, now)
                    .await
                    .map_err(|error| self.report(error));
                let _ = reply.send(result);
            }
            Command::DeleteSnapshot { snapshot_id, reply } => {
                let result = self
                    .snapshots
                    .delete(snapshot_id)
                    .await
                    .map_err(SessionError::from);
                let _ = reply.send(result);
            }
            Command::SnapshotUsage { reply } => {
                let _ = reply.send(self.snapshots.usage());
            }
            Command::SyncNow { reply } => {
                let forgotten = self.resolver.forget_failed();
                if forgotten > 0 {
                    tracing::info!(room = %self.room_id, forgotten, "abandoned conflicts may be raised again");
                }
                self.synchronizer.resume(now);
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn submit(
        &mut self,
        kind: UpdateKind,
        patch: Patch,
        player_id: PlayerId,
        description: Option<String>,
        now: u64,
    ) -> Result<UpdateId, SessionError> {
        let mut update = OptimisticUpdate::new(kind, patch, player_id, now);
        if let Some(description) = description {
            update = update.with_description(description);
        }
        let update_id = update.id;
        let next = self.optimistic.apply(&self.state, update, now)?;
        self.commit(next, StateChangeCause::UpdateApplied { update_id }, now);
        Ok(update_id)
    }

    fn retry(&mut self, update_id: UpdateId, now: u64) -> Result<(), SessionError> {
        match self.optimistic.retry(&self.state, update_id, now) {
            Ok(next) => {
                self.commit(next, StateChangeCause::UpdateRetried { update_id }, now);
                Ok(())
            }
            Err(error @ OptimisticUpdateError::MaxRetriesExceeded { .. }) => {
                Err(self.report(error))
            }
            Err(error) => Err(error.into()),
        }
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Replace the canonical state without notifying listeners. Refuses
    /// version regressions.
    fn publish(&mut self, next: UnifiedState) -> bool {
        if next.version < self.state.version {
            tracing::error!(
                room = %self.room_id,
                version = self.state.version,
                rejected_version = next.version,
                "refusing to commit a version regression"
            );
            return false;
        }
        self.state = next;
        self.state_tx.send_replace(self.state.clone());
        true
    }

    fn commit(&mut self, next: UnifiedState, cause: StateChangeCause, now: u64) {
        let previous_version = self.state.version;
        if !self.publish(next) {
            return;
        }
        tracing::debug!(
            room = %self.room_id,
            version = self.state.version,
            previous_version,
            cause = ?cause,
            "state committed"
        );
        if cause.is_local() {
            self.synchronizer.request_immediate(now);
        }
        self.listeners.emit_state(&StateChange {
            previous_version,
            state: self.state.clone(),
            cause,
        });
    }

    fn commit_rollback(&mut self, rollback: Rollback, now: u64) {
        let cause = StateChangeCause::UpdateRolledBack {
            update_id: rollback.update.id,
            changed: rollback.changed,
        };
        self.commit(rollback.state, cause, now);
        if let Some(update_id) = rollback.evicted {
            self.report(OptimisticUpdateError::Evicted { update_id });
        }
    }

    fn set_status(&mut self, sync: Option<SyncStatus>, persistence: Option<PersistenceStatus>) {
        let mut next = self.state.clone();
        if let Some(status) = sync {
            next.sync_status = status;
        }
        if let Some(status) = persistence {
            next.persistence_status = status;
        }
        self.publish(next);
    }

    /// Deliver an error to `on_error` listeners and hand it back.
    fn report(&self, error: impl Into<SessionError>) -> SessionError {
        let error = error.into();
        self.listeners.emit_error(&(&error).into());
        error
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn on_timers(&mut self, now: u64) {
        let (_, rollbacks) = self.optimistic.expire(&self.state, now);
        for rollback in rollbacks {
            self.commit_rollback(rollback, now);
        }

        for conflict_id in self.resolver.expired(now) {
            if let Err(error) = self.resolve_conflict(conflict_id, Decision::Forced, now).await {
                // A forced outcome that fails would fire again on every tick.
                // The divergence stays flagged until sync_now.
                self.resolver.abandon(conflict_id);
                self.set_status(Some(SyncStatus::Error), None);
                self.report(error);
            }
        }

        if self.next_autosave_at.is_some_and(|at| at <= now) {
            if self.state.persistence_status == PersistenceStatus::Dirty {
                let tags = BTreeSet::from([AUTO_SAVE_TAG.to_string()]);
                if let Err(error) = self.save_snapshot("auto-save".to_string(), tags, now).await {
                    self.report(error);
                }
            }
            self.next_autosave_at = self.autosave_interval_ms.map(|interval| now + interval);
        }
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    fn maybe_start_sync(&mut self, now: u64) {
        if self.resolver.has_open() || !self.synchronizer.is_due(now) {
            return;
        }
        let Some(ticket) = self
            .synchronizer
            .begin(&self.state, self.optimistic.envelopes(), now)
        else {
            return;
        };

        let round = ticket.round();
        let endpoint = Arc::clone(&self.endpoint);
        let timeout = self.synchronizer.request_timeout();
        let completions = self.completions_tx.clone();
        self.sync_task = Some(tokio::spawn(async move {
            let result = exchange_with_timeout(endpoint.as_ref(), ticket.request, timeout).await;
            let _ = completions.send(SyncCompletion { round, result });
        }));
    }

    async fn on_sync_complete(&mut self, done: SyncCompletion) {
        self.sync_task = None;
        let now = self.clock.now_ms();
        match self.synchronizer.complete(done.round, done.result, now) {
            Ok(response) => self.apply_response(response, now).await,
            Err(error @ SyncError::StaleRound { .. }) => {
                tracing::debug!(room = %self.room_id, error = %error, "sync round did not complete");
            }
            Err(error) if error.is_retryable() => {
                tracing::debug!(room = %self.room_id, error = %error, "sync round will be retried");
            }
            // Exhausted retries or a refusal: halted until sync_now
            Err(error) => {
                self.set_status(Some(SyncStatus::Error), None);
                self.report(error);
            }
        }
    }

    async fn apply_response(&mut self, response: SyncResponse, now: u64) {
        for &update_id in &response.rejected {
            if !self.optimistic.is_pending(update_id) {
                continue;
            }
            match self.optimistic.rollback(&self.state, update_id, now) {
                Ok(rollback) => self.commit_rollback(rollback, now),
                Err(error) => {
                    self.report(error);
                }
            }
        }

        for &update_id in &response.accepted {
            match self.optimistic.confirm(update_id) {
                Ok(_) => {
                    let state = self.state.clone();
                    self.commit(state, StateChangeCause::UpdateConfirmed { update_id }, now);
                }
                Err(error) => {
                    tracing::debug!(room = %self.room_id, error = %error, "ignoring confirmation");
                }
            }
        }

        let disconnected = self
            .optimistic
            .components_edited_by(&response.disconnected_players);
        let remote = response.state;
        match self
            .synchronizer
            .reconcile(&self.state, &remote, &disconnected)
        {
            Reconciliation::InSync | Reconciliation::LocalAhead => self.adopt_metadata(&remote, now),
            Reconciliation::FastForward => self.fast_forward(&remote, now),
            Reconciliation::Conflicted(conflict) => self.raise_conflict(conflict, now).await,
        }
    }

    /// Keep the local payload and take the authority's causality metadata.
    fn adopt_metadata(&mut self, remote: &UnifiedState, now: u64) {
        let differing = self.state.payload.diff(&remote.payload);
        let mut next = self.state.clone();
        if remote.base_version >= next.base_version {
            next.base_version = remote.base_version;
            next.component_versions = remote.component_versions.clone();
        }
        next.version = next.version.max(next.base_version);
        next.local_edits = self
            .state
            .local_edits
            .intersection(&differing)
            .cloned()
            .collect();
        next.local_edits.extend(self.optimistic.live_components());
        next.last_synced_at = Some(now);
        next.sync_status = if next.local_edits.is_empty() && self.optimistic.pending_len() == 0 {
            SyncStatus::Synchronized
        } else {
            SyncStatus::Syncing
        };
        self.publish(next);
    }

    fn fast_forward(&mut self, remote: &UnifiedState, now: u64) {
        let mut adopted = remote.clone();
        adopted.version = remote.version.max(self.state.version + 1);
        adopted.local_edits.clear();
        adopted.last_synced_at = Some(now);
        adopted.persistence_status = PersistenceStatus::Dirty;
        let next = self
            .optimistic
            .rebase(&adopted, &BTreeSet::new(), &remote.payload);
        self.commit(
            next,
            StateChangeCause::RemoteAdopted {
                authority_version: remote.version,
            },
            now,
        );
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    async fn raise_conflict(&mut self, conflict: StateConflict, now: u64) {
        let conflict_id = conflict.id;
        if !self.resolver.register(conflict.clone(), now) {
            tracing::debug!(room = %self.room_id, conflict_id = %conflict_id, "conflict already known");
            return;
        }
        self.set_status(Some(SyncStatus::Conflict), None);
        self.listeners.emit_conflict(&conflict);

        match self.resolve_conflict(conflict_id, Decision::Default, now).await {
            Ok(_) => {}
            Err(ConflictResolutionError::AwaitingManualDecision { .. }) => {
                tracing::info!(room = %self.room_id, conflict_id = %conflict_id, "conflict awaiting manual decision");
            }
            Err(error) => {
                self.report(error);
            }
        }
    }

    async fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        decision: Decision,
        now: u64,
    ) -> Result<UnifiedState, ConflictResolutionError> {
        let strategy = match &decision {
            Decision::Default => self.resolver.default_strategy(),
            Decision::Explicit(ManualResolution::Strategy(strategy)) => *strategy,
            Decision::Explicit(ManualResolution::State(_)) => ResolutionStrategy::ManualResolution,
            Decision::Forced => ResolutionStrategy::LastWriterWins,
        };
        let checkpoint = if strategy == ResolutionStrategy::RollbackToCheckpoint {
            self.load_checkpoint(conflict_id).await
        } else {
            None
        };

        let ctx = ResolutionContext {
            now,
            current_version: self.state.version,
            checkpoint: checkpoint.as_ref(),
        };
        let resolution = match decision {
            Decision::Default => self.resolver.resolve(conflict_id, ctx),
            Decision::Explicit(decision) => self.resolver.resolve_with(conflict_id, decision, ctx),
            Decision::Forced => self.resolver.force_resolve(conflict_id, ctx),
        }?;
        Ok(self.apply_resolution(resolution, now))
    }

    async fn load_checkpoint(&self, conflict_id: ConflictId) -> Option<SnapshotRecord> {
        let earliest = self.resolver.get(conflict_id)?.earliest_candidate_at()?;
        let snapshot_id = self.snapshots.latest_before(earliest)?.id;
        match self.snapshots.load(snapshot_id).await {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(
                    room = %self.room_id,
                    conflict_id = %conflict_id,
                    snapshot_id = %snapshot_id,
                    error = %error,
                    "checkpoint unavailable"
                );
                None
            }
        }
    }

    fn apply_resolution(&mut self, resolution: Resolution, now: u64) -> UnifiedState {
        let lost: BTreeSet<ComponentKey> = resolution
            .conflict
            .affected_components
            .iter()
            .filter(|key| {
                !resolution
                    .state
                    .payload
                    .same_component(&self.state.payload, key.as_str())
            })
            .cloned()
            .collect();

        let mut resolved = resolution.state;
        resolved.version = resolved.version.max(self.state.version + 1);
        let next = self
            .optimistic
            .rebase(&resolved, &lost, &resolution.authority.payload);
        self.commit(
            next,
            StateChangeCause::ConflictResolved {
                conflict_id: resolution.conflict.id,
                strategy: resolution.strategy,
                forced: resolution.forced,
            },
            now,
        );
        self.state.clone()
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    async fn save_snapshot(
        &mut self,
        description: String,
        tags: BTreeSet<String>,
        now: u64,
    ) -> Result<GameStateSnapshot, PersistenceError> {
        self.set_status(None, Some(PersistenceStatus::Saving));
        match self
            .snapshots
            .save(&self.state, description, tags, now)
            .await
        {
            Ok(outcome) => {
                self.set_status(None, Some(PersistenceStatus::Saved));
                Ok(outcome.snapshot)
            }
            Err(error) => {
                self.set_status(None, Some(PersistenceStatus::Error));
                Err(error)
            }
        }
    }

    async fn restore_snapshot(
        &mut self,
        snapshot_id: SnapshotId,
        now: u64,
    ) -> Result<UnifiedState, PersistenceError> {
        let restored = self.snapshots.restore(snapshot_id, &self.state, now).await?;
        self.optimistic.supersede_all();
        self.commit(restored, StateChangeCause::SnapshotRestored { snapshot_id }, now);
        Ok(self.state.clone())
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.sync_task.take() {
            task.abort();
        }
        self.synchronizer.cancel();
        let abandoned = self.resolver.abandon_all();
        tracing::info!(
            room = %self.room_id,
            version = self.state.version,
            pending_updates = self.optimistic.pending_len(),
            abandoned_conflicts = abandoned.len(),
            "room session stopped"
        );
    }
}
