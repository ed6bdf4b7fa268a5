//! State synchronizer
//!
//! Drives the exchange with the room authority. A round is split into three
//! steps so the network wait can run outside the session's critical section:
//!
//! 1. [`StateSynchronizer::begin`] claims the single in-flight slot and builds
//!    the request
//! 2. the request is exchanged with the endpoint ([`exchange_with_timeout`])
//! 3. [`StateSynchronizer::complete`] records the outcome (latency, retry
//!    budget, backoff) and [`StateSynchronizer::reconcile`] compares the
//!    authority state with the local one
//!
//! [`StateSynchronizer::sync`] runs all steps back to back for callers that
//! own the synchronizer exclusively.

use crate::config::SyncConfig;
use crate::detector::{self, Divergence, Side};
use crate::metrics::SyncMetrics;
use crate::retry::{RetryDecision, RetryPolicy, RetryState};
use roomstate_core::{
    ComponentKey, ConflictKind, PendingUpdateEnvelope, PhysicalClock, RemoteEndpoint, RoomId,
    StateConflict, SyncError, SyncRequest, SyncResponse, TransportError, UnifiedState,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Claim on the in-flight slot for one round
#[derive(Debug)]
pub struct SyncTicket {
    round: u64,
    /// Request to send to the authority
    pub request: SyncRequest,
}

impl SyncTicket {
    /// Round number
    pub fn round(&self) -> u64 {
        self.round
    }
}

/// How the local claim relates to the authority's state
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Same payload
    InSync,
    /// The authority is strictly ahead
    FastForward,
    /// Local edits are not yet reflected by the authority
    LocalAhead,
    /// The claims conflict
    Conflicted(StateConflict),
}

/// Result of a full round run through [`StateSynchronizer::sync`]
#[derive(Debug, Clone)]
pub struct SyncRound {
    /// Authority reply
    pub response: SyncResponse,
    /// Comparison with the local claim
    pub reconciliation: Reconciliation,
}

/// Exchange a request with the endpoint, bounded by `timeout`.
pub async fn exchange_with_timeout<E>(
    endpoint: &E,
    request: SyncRequest,
    timeout: Duration,
) -> Result<SyncResponse, TransportError>
where
    E: RemoteEndpoint + ?Sized,
{
    match tokio::time::timeout(timeout, endpoint.exchange(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    round: u64,
    started_at: u64,
}

/// Per-room synchronization state machine
#[derive(Debug)]
pub struct StateSynchronizer {
    room_id: RoomId,
    interval_ms: u64,
    request_timeout: Duration,
    retry: RetryState,
    metrics: Arc<SyncMetrics>,
    next_round: u64,
    in_flight: Option<InFlight>,
    next_due_at: u64,
    backoff_until: Option<u64>,
    /// A round was requested while another was in flight
    expedite: bool,
    halted: bool,
    partition_suspected: bool,
}

impl StateSynchronizer {
    /// Create a synchronizer whose first round is due at `now`
    pub fn new(room_id: RoomId, config: &SyncConfig, metrics: Arc<SyncMetrics>, now: u64) -> Self {
        Self {
            room_id,
            interval_ms: config.interval_ms,
            request_timeout: config.request_timeout(),
            retry: RetryState::new(RetryPolicy::from_config(config)),
            metrics,
            next_round: 0,
            in_flight: None,
            next_due_at: now,
            backoff_until: None,
            expedite: false,
            halted: false,
            partition_suspected: false,
        }
    }

    /// Round-trip timeout
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Whether a round is outstanding
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether retries are exhausted and sync is halted
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Consecutive failed rounds
    pub fn retry_count(&self) -> u32 {
        self.retry.retry_count()
    }

    /// When the next round may start, `None` while in flight or halted
    pub fn next_due_at(&self) -> Option<u64> {
        if self.halted || self.in_flight.is_some() {
            None
        } else {
            Some(self.next_due_at)
        }
    }

    /// Whether a round should start at `now`
    pub fn is_due(&self, now: u64) -> bool {
        self.next_due_at().is_some_and(|due| due <= now)
    }

    /// Pull the next round forward to `now` unless backing off. While a
    /// round is in flight the next one starts as soon as it completes.
    pub fn request_immediate(&mut self, now: u64) {
        if self.in_flight.is_some() {
            self.expedite = true;
        } else if self.backoff_until.is_none() {
            self.next_due_at = self.next_due_at.min(now);
        }
    }

    /// Clear the halt and the retry budget; the next round is due at `now`
    pub fn resume(&mut self, now: u64) {
        if self.halted {
            tracing::info!(room = %self.room_id, "sync resumed");
        }
        self.halted = false;
        self.retry.record_success();
        self.backoff_until = None;
        self.next_due_at = now;
    }

    /// Abandon the outstanding round, if any
    pub fn cancel(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            tracing::debug!(room = %self.room_id, round = in_flight.round, "sync round cancelled");
        }
    }

    /// Start a round.
    ///
    /// Returns `None` while another round is outstanding, while backing off
    /// after a failure, or while halted.
    pub fn begin(
        &mut self,
        state: &UnifiedState,
        pending: Vec<PendingUpdateEnvelope>,
        now: u64,
    ) -> Option<SyncTicket> {
        if self.in_flight.is_some() || self.halted {
            return None;
        }
        if self.backoff_until.is_some_and(|until| now < until) {
            return None;
        }

        let round = self.next_round;
        self.next_round += 1;
        self.in_flight = Some(InFlight {
            round,
            started_at: now,
        });
        self.backoff_until = None;
        self.metrics.round_started();
        tracing::debug!(
            room = %self.room_id,
            round,
            version = state.version,
            pending = pending.len(),
            "sync round started"
        );

        Some(SyncTicket {
            round,
            request: SyncRequest {
                room_id: self.room_id,
                state: state.clone(),
                pending,
            },
        })
    }

    /// Record the outcome of a round.
    ///
    /// Retryable transport failures consume the retry budget; once it is spent
    /// the synchronizer halts and [`SyncError::RetriesExhausted`] is returned.
    /// A refusal from the authority halts at once without backing off.
    pub fn complete(
        &mut self,
        round: u64,
        result: Result<SyncResponse, TransportError>,
        now: u64,
    ) -> Result<SyncResponse, SyncError> {
        let started_at = match self.in_flight {
            Some(in_flight) if in_flight.round == round => in_flight.started_at,
            _ => {
                tracing::debug!(room = %self.room_id, round, "ignoring stale sync completion");
                return Err(SyncError::StaleRound { round });
            }
        };
        self.in_flight = None;

        match result {
            Ok(response) => {
                let latency_ms = now.saturating_sub(started_at);
                self.retry.record_success();
                self.metrics.round_completed(latency_ms);
                self.next_due_at = if std::mem::take(&mut self.expedite) {
                    now
                } else {
                    now + self.interval_ms
                };
                tracing::debug!(
                    room = %self.room_id,
                    round,
                    latency_ms,
                    remote_version = response.state.version,
                    accepted = response.accepted.len(),
                    rejected = response.rejected.len(),
                    "sync round completed"
                );
                Ok(response)
            }
            Err(error) => {
                let attempt = self.retry.retry_count() + 1;
                let sync_error = SyncError::from_transport(&error, attempt);
                if !sync_error.is_retryable() {
                    self.halted = true;
                    self.backoff_until = None;
                    self.metrics.round_failed(self.retry.retry_count());
                    tracing::error!(
                        room = %self.room_id,
                        round,
                        error = %sync_error,
                        "sync refused by authority, halting"
                    );
                    return Err(sync_error);
                }
                let decision = self.retry.record_failure();
                self.metrics.round_failed(self.retry.retry_count());

                match decision {
                    RetryDecision::RetryAfter(delay) => {
                        let until = now + delay.as_millis() as u64;
                        self.backoff_until = Some(until);
                        self.next_due_at = until;
                        tracing::warn!(
                            room = %self.room_id,
                            round,
                            retry = attempt,
                            backoff_ms = delay.as_millis() as u64,
                            error = %sync_error,
                            "sync round failed, backing off"
                        );
                        Err(sync_error)
                    }
                    RetryDecision::GiveUp => {
                        self.halted = true;
                        self.partition_suspected = true;
                        tracing::error!(
                            room = %self.room_id,
                            attempts = attempt,
                            error = %sync_error,
                            "sync retries exhausted, halting"
                        );
                        Err(SyncError::RetriesExhausted {
                            attempts: attempt,
                            last_error: sync_error.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Compare the local claim with the authority state.
    ///
    /// `disconnected_edits` are components locally edited by players the
    /// authority reports as disconnected.
    pub fn reconcile(
        &mut self,
        local: &UnifiedState,
        remote: &UnifiedState,
        disconnected_edits: &BTreeSet<ComponentKey>,
    ) -> Reconciliation {
        let partition = std::mem::take(&mut self.partition_suspected);

        match detector::compare(local, remote) {
            Divergence::Identical => Reconciliation::InSync,
            Divergence::Dominated {
                winner: Side::Remote,
                ..
            } => Reconciliation::FastForward,
            Divergence::Dominated {
                winner: Side::Local,
                ..
            } => Reconciliation::LocalAhead,
            Divergence::Conflict(conflict) => {
                let conflict = if partition {
                    conflict.reclassify(ConflictKind::NetworkPartition)
                } else if conflict
                    .affected_components
                    .iter()
                    .any(|c| disconnected_edits.contains(c))
                {
                    conflict.reclassify(ConflictKind::PlayerDisconnect)
                } else {
                    conflict
                };
                self.metrics.conflict_raised();
                tracing::warn!(
                    room = %self.room_id,
                    conflict_id = %conflict.id,
                    kind = %conflict.kind,
                    local_version = local.version,
                    remote_version = remote.version,
                    components = conflict.affected_components.len(),
                    "sync detected conflict"
                );
                Reconciliation::Conflicted(conflict)
            }
        }
    }

    /// Run one full round against `endpoint`.
    ///
    /// Returns `Ok(None)` when a round cannot start (see [`Self::begin`]).
    pub async fn sync<E, C>(
        &mut self,
        endpoint: &E,
        clock: &C,
        current: &UnifiedState,
        pending: Vec<PendingUpdateEnvelope>,
    ) -> Result<Option<SyncRound>, SyncError>
    where
        E: RemoteEndpoint + ?Sized,
        C: PhysicalClock + ?Sized,
    {
        let Some(ticket) = self.begin(current, pending, clock.now_ms()) else {
            return Ok(None);
        };
        let round = ticket.round;
        let result = exchange_with_timeout(endpoint, ticket.request, self.request_timeout).await;
        let response = self.complete(round, result, clock.now_ms())?;
        let reconciliation = self.reconcile(current, &response.state, &BTreeSet::new());
        Ok(Some(SyncRound {
            response,
            reconciliation,
        }))
    }
}
