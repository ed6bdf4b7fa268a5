//! Consumer-facing session handle

use super::actor::{Command, SessionActor, UpdateBacklog};
use super::events::{Listeners, StateChange, SubscriptionId};
use crate::clock::TokioClock;
use crate::config::RoomConfig;
use crate::metrics::{SyncMetrics, SyncMetricsSnapshot};
use crate::snapshot::{MemorySnapshotStorage, QuotaUsage, SnapshotStore};
use parking_lot::Mutex;
use roomstate_core::{
    ConflictId, ErrorReport, GameStateSnapshot, ManualResolution, Patch, Payload, PhysicalClock,
    PlayerId, RemoteEndpoint, RoomId, SessionError, SnapshotId, SnapshotStorage, StateConflict,
    UnifiedState, UpdateId, UpdateKind,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const COMMAND_BUFFER: usize = 64;

/// Builder for [`RoomSession`]
pub struct RoomSessionBuilder {
    room_id: RoomId,
    endpoint: Arc<dyn RemoteEndpoint>,
    initial_state: Option<UnifiedState>,
    config: RoomConfig,
    storage: Option<Arc<dyn SnapshotStorage>>,
    clock: Option<Arc<dyn PhysicalClock>>,
}

impl RoomSessionBuilder {
    /// Start from the state the room is joined with. Defaults to an empty
    /// genesis state.
    pub fn with_initial_state(mut self, state: UnifiedState) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Engine configuration
    pub fn with_config(mut self, config: RoomConfig) -> Self {
        self.config = config;
        self
    }

    /// Snapshot storage backend. Defaults to in-memory storage.
    pub fn with_storage(mut self, storage: Arc<dyn SnapshotStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Wall clock. Defaults to [`TokioClock`].
    pub fn with_clock(mut self, clock: Arc<dyn PhysicalClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration, rebuild the snapshot index and start the
    /// session task on the current tokio runtime.
    pub async fn spawn(self) -> Result<RoomSession, SessionError> {
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(TokioClock::new()));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemorySnapshotStorage::new()));
        let snapshots = SnapshotStore::open(storage, self.config.snapshot.clone()).await?;
        let state = self
            .initial_state
            .unwrap_or_else(|| UnifiedState::genesis(Payload::new(), clock.now_ms()));

        let metrics = Arc::new(SyncMetrics::new());
        let listeners = Arc::new(Listeners::default());
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let actor = SessionActor::new(
            self.room_id,
            &self.config,
            clock,
            self.endpoint,
            state,
            state_tx,
            snapshots,
            Arc::clone(&listeners),
            Arc::clone(&metrics),
        );
        let task = tokio::spawn(actor.run(command_rx));

        Ok(RoomSession {
            room_id: self.room_id,
            commands,
            state_rx,
            listeners,
            metrics,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Handle to one room's state engine.
///
/// Cloning the handle is cheap; all clones talk to the same session task.
/// Once every handle is dropped the session shuts down.
#[derive(Clone)]
pub struct RoomSession {
    room_id: RoomId,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<UnifiedState>,
    listeners: Arc<Listeners>,
    metrics: Arc<SyncMetrics>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.room_id)
            .field("version", &self.state_rx.borrow().version)
            .finish_non_exhaustive()
    }
}

impl RoomSession {
    /// Builder for a session synchronizing with `endpoint`
    pub fn builder(room_id: RoomId, endpoint: Arc<dyn RemoteEndpoint>) -> RoomSessionBuilder {
        RoomSessionBuilder {
            room_id,
            endpoint,
            initial_state: None,
            config: RoomConfig::default(),
            storage: None,
            clock: None,
        }
    }

    /// Start a session with explicit parts
    pub async fn spawn(
        room_id: RoomId,
        initial_state: UnifiedState,
        config: RoomConfig,
        endpoint: Arc<dyn RemoteEndpoint>,
        storage: Arc<dyn SnapshotStorage>,
    ) -> Result<Self, SessionError> {
        Self::builder(room_id, endpoint)
            .with_initial_state(initial_state)
            .with_config(config)
            .with_storage(storage)
            .spawn()
            .await
    }

    /// Room identifier
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Current canonical state
    pub fn get_state(&self) -> UnifiedState {
        self.state_rx.borrow().clone()
    }

    /// Receiver that observes every published state
    pub fn watch_state(&self) -> watch::Receiver<UnifiedState> {
        self.state_rx.clone()
    }

    /// Apply a mutation optimistically and queue it for the authority.
    ///
    /// Fails fast with a backpressure error when too many updates are
    /// unconfirmed.
    pub async fn submit_update(
        &self,
        kind: impl Into<UpdateKind>,
        patch: Patch,
        player_id: impl Into<PlayerId>,
    ) -> Result<UpdateId, SessionError> {
        let (kind, player_id) = (kind.into(), player_id.into());
        self.request(|reply| Command::Submit {
            kind,
            patch,
            player_id,
            description: None,
            reply,
        })
        .await?
    }

    /// Like [`Self::submit_update`] with a human-readable description
    pub async fn submit_described_update(
        &self,
        kind: impl Into<UpdateKind>,
        patch: Patch,
        player_id: impl Into<PlayerId>,
        description: impl Into<String>,
    ) -> Result<UpdateId, SessionError> {
        let (kind, player_id, description) = (kind.into(), player_id.into(), description.into());
        self.request(|reply| Command::Submit {
            kind,
            patch,
            player_id,
            description: Some(description),
            reply,
        })
        .await?
    }

    /// Re-apply a rolled-back update
    pub async fn retry_update(&self, update_id: UpdateId) -> Result<(), SessionError> {
        self.request(|reply| Command::Retry { update_id, reply })
            .await?
    }

    /// Drop a rolled-back update
    pub async fn discard_update(&self, update_id: UpdateId) -> Result<(), SessionError> {
        self.request(|reply| Command::Discard { update_id, reply })
            .await?
    }

    /// Pending and rolled-back update identifiers
    pub async fn update_backlog(&self) -> Result<UpdateBacklog, SessionError> {
        self.request(|reply| Command::Backlog { reply }).await
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Called on every committed transition
    pub fn on_state_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.listeners.add_state(Arc::new(listener))
    }

    /// Called when a conflict is detected
    pub fn on_conflict<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StateConflict) + Send + Sync + 'static,
    {
        self.listeners.add_conflict(Arc::new(listener))
    }

    /// Called with every surfaced error
    pub fn on_error<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.listeners.add_error(Arc::new(listener))
    }

    /// Remove a listener. Returns `false` if it was already removed.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.listeners.remove(subscription)
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    /// Open conflicts, most urgent first
    pub async fn pending_conflicts(&self) -> Result<Vec<StateConflict>, SessionError> {
        self.request(|reply| Command::PendingConflicts { reply })
            .await
    }

    /// Resolve a conflict with a strategy or a caller-supplied state
    pub async fn resolve_with(
        &self,
        conflict_id: ConflictId,
        decision: impl Into<ManualResolution>,
    ) -> Result<UnifiedState, SessionError> {
        let decision = decision.into();
        self.request(|reply| Command::ResolveWith {
            conflict_id,
            decision,
            reply,
        })
        .await?
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Save the current state
    pub async fn save_snapshot(
        &self,
        description: impl Into<String>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<GameStateSnapshot, SessionError> {
        let description = description.into();
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        self.request(|reply| Command::SaveSnapshot {
            description,
            tags,
            reply,
        })
        .await?
    }

    /// Snapshot metadata, oldest first
    pub async fn list_snapshots(&self) -> Result<Vec<GameStateSnapshot>, SessionError> {
        self.request(|reply| Command::ListSnapshots { reply }).await
    }

    /// Restore a snapshot as the next version
    pub async fn restore_snapshot(
        &self,
        snapshot_id: SnapshotId,
    ) -> Result<UnifiedState, SessionError> {
        self.request(|reply| Command::RestoreSnapshot { snapshot_id, reply })
            .await?
    }

    /// Delete a snapshot
    pub async fn delete_snapshot(&self, snapshot_id: SnapshotId) -> Result<(), SessionError> {
        self.request(|reply| Command::DeleteSnapshot { snapshot_id, reply })
            .await?
    }

    /// Snapshot storage usage against the quota
    pub async fn snapshot_usage(&self) -> Result<QuotaUsage, SessionError> {
        self.request(|reply| Command::SnapshotUsage { reply }).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Request a sync round now. Also resumes a synchronizer halted after
    /// exhausting its retries or a refusal, and lets conflicts abandoned after
    /// a failed forced resolution be raised again.
    pub async fn sync_now(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::SyncNow { reply }).await
    }

    /// Synchronizer metrics
    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop the session: cancels the in-flight sync round and drops all
    /// timers. Idempotent.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        // A closed channel means the session already stopped
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::error!(room = %self.room_id, error = %error, "room session task failed");
            }
        }
        Ok(())
    }
}
