//! In-process authorities implementing [`RemoteEndpoint`]
//!
//! [`LoopbackAuthority`] behaves like a real room authority: it applies the
//! pending updates it receives, answers with its canonical state, and can be
//! told to fail, reject, lag or diverge. [`ScriptedEndpoint`] replays a fixed
//! list of responses for scenarios that need exact remote states.

use async_trait::async_trait;
use parking_lot::Mutex;
use roomstate_core::{
    ComponentKey, Patch, PlayerId, RemoteEndpoint, SyncRequest, SyncResponse, TransportError,
    UnifiedState, UpdateId,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug)]
struct AuthorityInner {
    state: UnifiedState,
    accepted: BTreeSet<UpdateId>,
    rejected_kinds: BTreeSet<String>,
    disconnected: Vec<PlayerId>,
    failures: VecDeque<TransportError>,
    offline: bool,
    latency: Option<Duration>,
    requests: Vec<SyncRequest>,
}

/// Authority that lives in the test process
#[derive(Debug)]
pub struct LoopbackAuthority {
    inner: Mutex<AuthorityInner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LoopbackAuthority {
    /// Authority holding `state`
    pub fn new(state: UnifiedState) -> Self {
        Self {
            inner: Mutex::new(AuthorityInner {
                state,
                accepted: BTreeSet::new(),
                rejected_kinds: BTreeSet::new(),
                disconnected: Vec::new(),
                failures: VecDeque::new(),
                offline: false,
                latency: None,
                requests: Vec::new(),
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Canonical state
    pub fn state(&self) -> UnifiedState {
        self.inner.lock().state.clone()
    }

    /// Commit a change made by another participant
    pub fn commit(&self, patch: &Patch, at_ms: u64) -> UnifiedState {
        let mut inner = self.inner.lock();
        inner.state = inner.state.commit_authoritative(patch, at_ms);
        inner.state.clone()
    }

    /// Fail the next `count` exchanges with `error`
    pub fn fail_next(&self, count: usize, error: TransportError) {
        let mut inner = self.inner.lock();
        inner.failures.extend(std::iter::repeat(error).take(count));
    }

    /// Fail every exchange while offline
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Refuse pending updates of this kind
    pub fn reject_kind(&self, kind: &str) {
        self.inner.lock().rejected_kinds.insert(kind.to_string());
    }

    /// Report `player` as disconnected in every response
    pub fn disconnect(&self, player: impl Into<PlayerId>) {
        self.inner.lock().disconnected.push(player.into());
    }

    /// Delay every response by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    /// Requests received, including failed ones
    pub fn requests(&self) -> Vec<SyncRequest> {
        self.inner.lock().requests.clone()
    }

    /// Number of requests received
    pub fn request_count(&self) -> usize {
        self.inner.lock().requests.len()
    }

    /// Highest number of exchanges observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        let mut inner = self.inner.lock();
        inner.requests.push(request.clone());
        if inner.offline {
            return Err(TransportError::unreachable("authority offline"));
        }
        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }

        let now = request.state.updated_at.max(inner.state.updated_at);

        // Direct local edits (restores, resolutions) are adopted when the
        // claim descends from the current authority version
        if request.state.base_version == inner.state.version {
            let covered: BTreeSet<ComponentKey> = request
                .pending
                .iter()
                .flat_map(|envelope| envelope.patch.component_set())
                .collect();
            let mut adopted = Patch::new();
            for key in request
                .state
                .local_edits
                .iter()
                .filter(|key| !covered.contains(*key))
            {
                adopted.insert_write(key.clone(), request.state.payload.get_shared(key.as_str()));
            }
            if !adopted.is_empty() {
                inner.state = inner.state.commit_authoritative(&adopted, now);
            }
        }

        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for envelope in &request.pending {
            if inner.accepted.contains(&envelope.id) {
                accepted.push(envelope.id);
            } else if inner.rejected_kinds.contains(envelope.kind.as_str()) {
                rejected.push(envelope.id);
            } else {
                inner.state = inner.state.commit_authoritative(&envelope.patch, now);
                inner.accepted.insert(envelope.id);
                accepted.push(envelope.id);
            }
        }

        tracing::trace!(
            version = inner.state.version,
            accepted = accepted.len(),
            rejected = rejected.len(),
            "loopback authority answered"
        );
        Ok(SyncResponse {
            state: inner.state.clone(),
            accepted,
            rejected,
            disconnected_players: inner.disconnected.clone(),
        })
    }
}

#[async_trait]
impl RemoteEndpoint for LoopbackAuthority {
    async fn exchange(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.answer(request)
    }
}

#[derive(Debug, Default)]
struct ScriptInner {
    script: VecDeque<Result<SyncResponse, TransportError>>,
    last: Option<SyncResponse>,
    requests: Vec<SyncRequest>,
}

/// Endpoint replaying queued responses in order.
///
/// Once the script runs out, the last successful response repeats. With no
/// successful response yet, exchanges fail as unreachable.
#[derive(Debug, Default)]
pub struct ScriptedEndpoint {
    inner: Mutex<ScriptInner>,
}

impl ScriptedEndpoint {
    /// Empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response
    pub fn respond(&self, response: SyncResponse) {
        self.inner.lock().script.push_back(Ok(response));
    }

    /// Queue a response carrying only `state`
    pub fn respond_with_state(&self, state: UnifiedState) {
        self.respond(SyncResponse::state_only(state));
    }

    /// Queue a transport failure
    pub fn fail(&self, error: TransportError) {
        self.inner.lock().script.push_back(Err(error));
    }

    /// Requests received
    pub fn requests(&self) -> Vec<SyncRequest> {
        self.inner.lock().requests.clone()
    }

    /// Number of requests received
    pub fn request_count(&self) -> usize {
        self.inner.lock().requests.len()
    }
}

#[async_trait]
impl RemoteEndpoint for ScriptedEndpoint {
    async fn exchange(&self, request: SyncRequest) -> Result<SyncResponse, TransportError> {
        let mut inner = self.inner.lock();
        inner.requests.push(request);
        match inner.script.pop_front() {
            Some(Ok(response)) => {
                inner.last = Some(response.clone());
                Ok(response)
            }
            Some(Err(error)) => Err(error),
            None => inner
                .last
                .clone()
                .ok_or_else(|| TransportError::unreachable("script exhausted")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use roomstate_core::{PendingUpdateEnvelope, RoomId};
    use serde_json::json;

    fn request(state: UnifiedState, pending: Vec<PendingUpdateEnvelope>) -> SyncRequest {
        SyncRequest {
            room_id: RoomId::new(),
            state,
            pending,
        }
    }

    fn envelope(kind: &str, key: &str) -> PendingUpdateEnvelope {
        PendingUpdateEnvelope {
            id: UpdateId::new(),
            kind: kind.into(),
            player_id: "p1".into(),
            patch: Patch::new().set(key, json!(true)),
        }
    }

    #[tokio::test]
    async fn applies_pending_updates_once() {
        let authority = LoopbackAuthority::new(fixtures::authoritative_state(5, 1_000));
        let vote = envelope("vote", "votes");

        let first = authority
            .exchange(request(authority.state(), vec![vote.clone()]))
            .await
            .unwrap();
        assert_eq!(first.accepted, vec![vote.id]);
        assert_eq!(first.state.version, 6);

        let again = authority
            .exchange(request(authority.state(), vec![vote.clone()]))
            .await
            .unwrap();
        assert_eq!(again.accepted, vec![vote.id]);
        assert_eq!(again.state.version, 6);
    }

    #[tokio::test]
    async fn rejects_configured_kinds() {
        let authority = LoopbackAuthority::new(fixtures::authoritative_state(5, 1_000));
        authority.reject_kind("cheat");
        authority.disconnect("p3");
        let cheat = envelope("cheat", "round");

        let response = authority
            .exchange(request(authority.state(), vec![cheat.clone()]))
            .await
            .unwrap();
        assert_eq!(response.rejected, vec![cheat.id]);
        assert_eq!(response.state.version, 5);
        assert_eq!(response.disconnected_players, vec![PlayerId::from("p3")]);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let authority = LoopbackAuthority::new(fixtures::authoritative_state(5, 1_000));
        authority.fail_next(2, TransportError::unreachable("down"));

        for _ in 0..2 {
            assert!(authority.exchange(request(authority.state(), vec![])).await.is_err());
        }
        assert!(authority.exchange(request(authority.state(), vec![])).await.is_ok());
        assert_eq!(authority.request_count(), 3);
    }

    #[tokio::test]
    async fn script_repeats_last_response() {
        let endpoint = ScriptedEndpoint::new();
        assert!(endpoint
            .exchange(request(fixtures::authoritative_state(1, 0), vec![]))
            .await
            .is_err());

        endpoint.fail(TransportError::unreachable("flaky"));
        endpoint.respond_with_state(fixtures::authoritative_state(6, 2_000));
        assert!(endpoint
            .exchange(request(fixtures::authoritative_state(1, 0), vec![]))
            .await
            .is_err());
        for _ in 0..2 {
            let response = endpoint
                .exchange(request(fixtures::authoritative_state(1, 0), vec![]))
                .await
                .unwrap();
            assert_eq!(response.state.version, 6);
        }
        assert_eq!(endpoint.request_count(), 4);
    }
}
