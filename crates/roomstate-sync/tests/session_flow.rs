//! End-to-end session behavior against in-process authorities.
//!
//! All tests run on a paused tokio clock, so timers fire deterministically as
//! the test sleeps.

use assert_matches::assert_matches;
use parking_lot::Mutex;
use roomstate_core::{
    ConflictKind, ErrorKind, ErrorReport, ManualResolution, OptimisticUpdateError,
    RemoteEndpoint, ResolutionStrategy, StateConflict, SyncResponse, SyncStatus, TransportError,
};
use roomstate_sync::{
    RoomConfig, RoomId, RoomSession, SessionError, StateChange, StateChangeCause, TokioClock,
    UnifiedState,
};
use roomstate_testkit::{fixtures, init_test_tracing, LoopbackAuthority, ScriptedEndpoint};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const BASE: u64 = 1_000_000;

async fn spawn(
    endpoint: Arc<dyn RemoteEndpoint>,
    initial: UnifiedState,
    config: RoomConfig,
) -> RoomSession {
    init_test_tracing();
    RoomSession::builder(RoomId::new(), endpoint)
        .with_initial_state(initial)
        .with_config(config)
        .with_clock(Arc::new(TokioClock::with_base(BASE)))
        .spawn()
        .await
        .unwrap()
}

fn record_changes(session: &RoomSession) -> Arc<Mutex<Vec<StateChange>>> {
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    session.on_state_change(move |change| sink.lock().push(change.clone()));
    changes
}

fn record_conflicts(session: &RoomSession) -> Arc<Mutex<Vec<StateConflict>>> {
    let conflicts = Arc::new(Mutex::new(Vec::new()));
    let sink = conflicts.clone();
    session.on_conflict(move |conflict| sink.lock().push(conflict.clone()));
    conflicts
}

fn record_errors(session: &RoomSession) -> Arc<Mutex<Vec<ErrorReport>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    session.on_error(move |report| sink.lock().push(report.clone()));
    errors
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn optimistic_update_is_visible_then_confirmed() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    let session = spawn(authority.clone(), initial, RoomConfig::default()).await;
    let changes = record_changes(&session);

    let id = session
        .submit_update("propose_team", fixtures::set("team", json!(["p1", "p2"])), "p1")
        .await
        .unwrap();

    let applied = session.get_state();
    assert_eq!(applied.version, 6);
    assert_eq!(applied.payload.get("team"), Some(&json!(["p1", "p2"])));
    assert!(applied.local_edits.contains("team"));

    settle(200).await;

    let state = session.get_state();
    assert_eq!(state.sync_status, SyncStatus::Synchronized);
    assert!(state.local_edits.is_empty());
    assert_eq!(authority.state().payload.get("team"), Some(&json!(["p1", "p2"])));
    assert!(session.update_backlog().await.unwrap().pending.is_empty());
    assert!(changes
        .lock()
        .iter()
        .any(|c| c.cause == StateChangeCause::UpdateConfirmed { update_id: id }));

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn remote_conflict_resolves_by_last_writer_and_timer_drops_superseded_update() {
    let initial = fixtures::authoritative_state(5, BASE);
    let remote = fixtures::remote_edit(&initial, "votes", json!({"p3": "reject"}), BASE + 500);

    let endpoint = Arc::new(ScriptedEndpoint::new());
    endpoint.respond_with_state(initial.clone());
    endpoint.respond_with_state(remote.clone());

    let session = spawn(endpoint.clone(), initial, RoomConfig::default()).await;
    let changes = record_changes(&session);
    let conflicts = record_conflicts(&session);

    let id = session
        .submit_update("propose_team", fixtures::set("team", json!(["p1", "p2"])), "p1")
        .await
        .unwrap();
    assert_eq!(session.get_state().version, 6);

    settle(100).await;

    // Remote edit is newer, so its payload wins and the local update is
    // superseded but still pending
    let resolved = session.get_state();
    assert_eq!(resolved.version, 7);
    assert_eq!(resolved.payload, remote.payload);
    assert_eq!(session.update_backlog().await.unwrap().pending, vec![id]);
    assert!(session.pending_conflicts().await.unwrap().is_empty());
    {
        let conflicts = conflicts.lock();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::VersionMismatch);
    }
    assert!(changes.lock().iter().any(|c| matches!(
        c.cause,
        StateChangeCause::ConflictResolved {
            strategy: ResolutionStrategy::LastWriterWins,
            forced: false,
            ..
        }
    )));

    settle(6_000).await;

    let settled = session.get_state();
    assert_eq!(settled.version, 7);
    assert_eq!(settled.payload, remote.payload);
    let backlog = session.update_backlog().await.unwrap();
    assert!(backlog.pending.is_empty());
    assert_eq!(backlog.rolled_back, vec![id]);
    assert!(changes.lock().iter().any(|c| c.cause
        == StateChangeCause::UpdateRolledBack {
            update_id: id,
            changed: false
        }));

    // Superseded updates are not offered to the authority again
    let last = endpoint.requests().pop().unwrap();
    assert!(last.pending.is_empty());

    session.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn conflict_on_disconnected_player_edit_is_classified() {
    let initial = fixtures::authoritative_state(5, BASE);
    let remote = fixtures::remote_edit(&initial, "round", json!(2), BASE + 500);

    let endpoint = Arc::new(ScriptedEndpoint::new());
    endpoint.respond_with_state(initial.clone());
    endpoint.respond(SyncResponse {
        disconnected_players: vec!["p2".into()],
        ..SyncResponse::state_only(remote)
    });

    let session = spawn(endpoint, initial, RoomConfig::default()).await;
    let conflicts = record_conflicts(&session);

    session
        .submit_update("vote", fixtures::set("votes", json!({"p2": "approve"})), "p2")
        .await
        .unwrap();
    settle(100).await;

    let conflicts = conflicts.lock();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::PlayerDisconnect);
}

#[tokio::test(start_paused = true)]
async fn rejected_update_rolls_back_and_can_be_discarded() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    authority.reject_kind("skip_vote");
    let session = spawn(authority.clone(), initial.clone(), RoomConfig::default()).await;
    let changes = record_changes(&session);

    let id = session
        .submit_update("skip_vote", fixtures::set("phase", json!("mission")), "p4")
        .await
        .unwrap();
    settle(200).await;

    let state = session.get_state();
    assert_eq!(state.payload, initial.payload);
    assert_eq!(state.version, 7);
    assert_eq!(session.update_backlog().await.unwrap().rolled_back, vec![id]);
    assert!(changes.lock().iter().any(|c| c.cause
        == StateChangeCause::UpdateRolledBack {
            update_id: id,
            changed: true
        }));

    session.discard_update(id).await.unwrap();
    assert_matches!(
        session.retry_update(id).await,
        Err(SessionError::Update(OptimisticUpdateError::UnknownUpdate { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn retries_are_capped_with_terminal_report() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    authority.reject_kind("skip_vote");
    let session = spawn(authority, initial, RoomConfig::default()).await;
    let errors = record_errors(&session);

    let id = session
        .submit_update("skip_vote", fixtures::set("phase", json!("mission")), "p4")
        .await
        .unwrap();
    settle(200).await;

    for _ in 0..3 {
        session.retry_update(id).await.unwrap();
        settle(200).await;
    }
    assert_matches!(
        session.retry_update(id).await,
        Err(SessionError::Update(OptimisticUpdateError::MaxRetriesExceeded { attempts: 3, .. }))
    );

    let errors = errors.lock();
    let report = errors.last().unwrap();
    assert_eq!(report.kind, ErrorKind::OptimisticUpdate);
    assert_eq!(report.update_id, Some(id));
    assert!(report.terminal);
}

#[tokio::test(start_paused = true)]
async fn submissions_beyond_pending_ceiling_fail_fast() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    authority.set_offline(true);
    let config = RoomConfig::builder().with_max_pending(3).build().unwrap();
    let session = spawn(authority, initial, config).await;

    for i in 0..3 {
        session
            .submit_update("vote", fixtures::set("votes", json!({"n": i})), "p1")
            .await
            .unwrap();
    }
    assert_matches!(
        session
            .submit_update("vote", fixtures::set("votes", json!({"n": 3})), "p1")
            .await,
        Err(SessionError::Update(OptimisticUpdateError::Backpressure { max_pending: 3 }))
    );
    assert_eq!(session.get_state().version, 8);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_sync_round_in_flight() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    authority.set_latency(Some(Duration::from_millis(1_500)));
    let config = RoomConfig::builder()
        .with_sync_interval(Duration::from_millis(100))
        .build()
        .unwrap();
    let session = spawn(authority.clone(), initial, config).await;

    for i in 0..5 {
        session
            .submit_update("vote", fixtures::set("votes", json!({"n": i})), "p1")
            .await
            .unwrap();
        session.sync_now().await.unwrap();
        settle(300).await;
    }
    settle(4_000).await;

    assert!(authority.request_count() >= 2);
    assert_eq!(authority.max_in_flight(), 1);
    assert_eq!(authority.state().payload.get("votes"), Some(&json!({"n": 4})));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_halt_until_sync_now() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    authority.set_offline(true);
    let config = RoomConfig::builder()
        .with_max_sync_retries(2)
        .with_backoff(Duration::from_millis(100), Duration::from_millis(1_000))
        .build()
        .unwrap();
    let session = spawn(authority.clone(), initial, config).await;
    let errors = record_errors(&session);

    settle(2_000).await;

    assert_eq!(authority.request_count(), 3);
    assert_eq!(session.get_state().sync_status, SyncStatus::Error);
    assert_eq!(session.metrics().rounds_failed, 3);
    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Sync);
        assert_eq!(errors[0].code, "sync.retries_exhausted");
        assert!(errors[0].terminal);
    }

    // Halted: nothing more goes out
    settle(5_000).await;
    assert_eq!(authority.request_count(), 3);

    authority.set_offline(false);
    session.sync_now().await.unwrap();
    settle(100).await;

    assert_eq!(authority.request_count(), 4);
    assert_eq!(session.get_state().sync_status, SyncStatus::Synchronized);
    assert_eq!(session.metrics().rounds_completed, 1);
}

#[tokio::test(start_paused = true)]
async fn refused_exchange_is_reported_and_halts_sync() {
    let initial = fixtures::authoritative_state(5, BASE);
    let endpoint = Arc::new(ScriptedEndpoint::new());
    endpoint.fail(TransportError::rejected("room closed by host"));
    endpoint.respond_with_state(initial.clone());
    let session = spawn(endpoint.clone(), initial, RoomConfig::default()).await;
    let errors = record_errors(&session);

    settle(100).await;

    assert_eq!(endpoint.request_count(), 1);
    assert_eq!(session.get_state().sync_status, SyncStatus::Error);
    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Sync);
        assert_eq!(errors[0].code, "sync.rejected");
        assert!(errors[0].terminal);
    }

    // No backoff retries behind the caller's back
    settle(10_000).await;
    assert_eq!(endpoint.request_count(), 1);
    assert_eq!(session.metrics().rounds_failed, 1);

    session.sync_now().await.unwrap();
    settle(100).await;
    assert_eq!(endpoint.request_count(), 2);
    assert_eq!(session.get_state().sync_status, SyncStatus::Synchronized);
    assert_eq!(errors.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn conflict_rolls_back_to_preceding_checkpoint() {
    let initial = fixtures::authoritative_state(5, BASE);
    let remote = fixtures::remote_edit(&initial, "votes", json!({"p3": "reject"}), BASE + 500);
    let endpoint = Arc::new(ScriptedEndpoint::new());
    endpoint.respond_with_state(initial.clone());
    endpoint.respond_with_state(remote.clone());

    let config = RoomConfig::builder()
        .with_strategy(ResolutionStrategy::RollbackToCheckpoint)
        .build()
        .unwrap();
    let session = spawn(endpoint, initial.clone(), config).await;
    let changes = record_changes(&session);
    let checkpoint = session
        .save_snapshot("start of round", ["checkpoint"])
        .await
        .unwrap();
    assert_eq!(checkpoint.version, 5);

    session
        .submit_update("propose_team", fixtures::set("team", json!(["p1", "p2"])), "p1")
        .await
        .unwrap();
    settle(100).await;

    let state = session.get_state();
    assert_eq!(state.version, 7);
    assert_eq!(state.payload, initial.payload);
    assert!(session.pending_conflicts().await.unwrap().is_empty());
    assert!(changes.lock().iter().any(|c| matches!(
        c.cause,
        StateChangeCause::ConflictResolved {
            strategy: ResolutionStrategy::RollbackToCheckpoint,
            forced: false,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn merge_keeps_disjoint_local_and_remote_edits() {
    let initial = fixtures::authoritative_state(5, BASE);
    let remote = fixtures::remote_edit(&initial, "votes", json!({"p3": "reject"}), BASE + 500);
    let endpoint = Arc::new(ScriptedEndpoint::new());
    endpoint.respond_with_state(initial.clone());
    endpoint.respond_with_state(remote);

    let config = RoomConfig::builder()
        .with_strategy(ResolutionStrategy::MergeChanges)
        .build()
        .unwrap();
    let session = spawn(endpoint, initial, config).await;
    let changes = record_changes(&session);

    let id = session
        .submit_update("propose_team", fixtures::set("team", json!(["p1", "p2"])), "p1")
        .await
        .unwrap();
    settle(100).await;

    let state = session.get_state();
    assert_eq!(state.version, 7);
    assert_eq!(state.payload.get("team"), Some(&json!(["p1", "p2"])));
    assert_eq!(state.payload.get("votes"), Some(&json!({"p3": "reject"})));
    assert!(state.local_edits.contains("team"));
    assert!(!state.local_edits.contains("votes"));
    assert_eq!(session.update_backlog().await.unwrap().pending, vec![id]);
    assert!(changes.lock().iter().any(|c| matches!(
        c.cause,
        StateChangeCause::ConflictResolved {
            strategy: ResolutionStrategy::MergeChanges,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn unresolvable_conflict_is_flagged_until_sync_now() {
    let initial = fixtures::authoritative_state(5, BASE);
    let mut malformed = fixtures::remote_edit(&initial, "votes", json!({"p3": "reject"}), BASE + 500);
    malformed.base_version = malformed.version + 1;
    let endpoint = Arc::new(ScriptedEndpoint::new());
    endpoint.respond_with_state(initial.clone());
    endpoint.respond_with_state(malformed);

    let config = RoomConfig::builder()
        .with_strategy(ResolutionStrategy::ManualResolution)
        .with_conflict_timeout(Duration::from_millis(2_000))
        .build()
        .unwrap();
    let session = spawn(endpoint, initial, config).await;
    let conflicts = record_conflicts(&session);
    let errors = record_errors(&session);

    session
        .submit_update("propose_team", fixtures::set("team", json!(["p1", "p2"])), "p1")
        .await
        .unwrap();
    settle(100).await;
    assert_eq!(session.get_state().sync_status, SyncStatus::Conflict);

    // The forced outcome fails, so the conflict is given up and flagged
    settle(2_900).await;
    assert!(session.pending_conflicts().await.unwrap().is_empty());
    assert_eq!(session.get_state().sync_status, SyncStatus::Error);
    assert_eq!(conflicts.lock().len(), 1);
    {
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::ConflictResolution);
        assert_eq!(errors[0].code, "conflict.strategy_failed");
    }

    session.sync_now().await.unwrap();
    settle(100).await;
    assert_eq!(conflicts.lock().len(), 2);
    assert_eq!(session.pending_conflicts().await.unwrap().len(), 1);
    assert_eq!(session.get_state().sync_status, SyncStatus::Conflict);
}

#[tokio::test(start_paused = true)]
async fn manual_mode_waits_for_decision_and_suspends_sync() {
    let initial = fixtures::authoritative_state(5, BASE);
    let remote = fixtures::remote_edit(&initial, "votes", json!({"p3": "reject"}), BASE + 500);
    let endpoint = Arc::new(ScriptedEndpoint::new());
    endpoint.respond_with_state(initial.clone());
    endpoint.respond_with_state(remote.clone());

    let config = RoomConfig::builder()
        .with_strategy(ResolutionStrategy::ManualResolution)
        .build()
        .unwrap();
    let session = spawn(endpoint.clone(), initial, config).await;

    session
        .submit_update("propose_team", fixtures::set("team", json!(["p1", "p2"])), "p1")
        .await
        .unwrap();
    settle(100).await;

    let open = session.pending_conflicts().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(session.get_state().sync_status, SyncStatus::Conflict);

    let requests = endpoint.request_count();
    settle(3_000).await;
    assert_eq!(endpoint.request_count(), requests);

    let before = session.get_state().version;
    let mut decided = remote.clone();
    decided.payload.set("team", json!(["p1", "p3"]));
    let resolved = session
        .resolve_with(open[0].id, ManualResolution::State(decided))
        .await
        .unwrap();

    assert!(resolved.version > before);
    assert_eq!(resolved.payload.get("team"), Some(&json!(["p1", "p3"])));
    assert!(session.pending_conflicts().await.unwrap().is_empty());
    assert_matches!(
        session
            .resolve_with(open[0].id, ResolutionStrategy::LastWriterWins)
            .await,
        Err(SessionError::Conflict(_))
    );

    settle(1_500).await;
    assert!(endpoint.request_count() > requests);
}

#[tokio::test(start_paused = true)]
async fn manual_conflict_is_forced_after_timeout() {
    let initial = fixtures::authoritative_state(5, BASE);
    let remote = fixtures::remote_edit(&initial, "votes", json!({"p3": "reject"}), BASE + 500);
    let endpoint = Arc::new(ScriptedEndpoint::new());
    endpoint.respond_with_state(initial.clone());
    endpoint.respond_with_state(remote.clone());

    let config = RoomConfig::builder()
        .with_strategy(ResolutionStrategy::ManualResolution)
        .with_conflict_timeout(Duration::from_millis(2_000))
        .build()
        .unwrap();
    let session = spawn(endpoint, initial, config).await;
    let changes = record_changes(&session);

    session
        .submit_update("propose_team", fixtures::set("team", json!(["p1", "p2"])), "p1")
        .await
        .unwrap();
    settle(3_000).await;

    assert!(session.pending_conflicts().await.unwrap().is_empty());
    assert_eq!(session.get_state().payload, remote.payload);
    assert!(changes.lock().iter().any(|c| matches!(
        c.cause,
        StateChangeCause::ConflictResolved { forced: true, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn remote_progress_fast_forwards_and_keeps_local_work() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    authority.set_latency(Some(Duration::from_millis(50)));
    let session = spawn(authority.clone(), initial, RoomConfig::default()).await;
    settle(100).await;

    authority.commit(&fixtures::set("round", json!(2)), BASE + 200);
    session
        .submit_update("vote", fixtures::set("votes", json!({"p1": "approve"})), "p1")
        .await
        .unwrap();
    settle(500).await;

    let state = session.get_state();
    assert_eq!(state.payload.get("round"), Some(&json!(2)));
    assert_eq!(state.payload.get("votes"), Some(&json!({"p1": "approve"})));
    assert_eq!(state.payload, authority.state().payload);
    assert!(state.version >= authority.state().version);
}

#[tokio::test(start_paused = true)]
async fn versions_never_decrease() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    authority.reject_kind("skip_vote");
    let session = spawn(authority.clone(), initial, RoomConfig::default()).await;
    let changes = record_changes(&session);
    let mut watch = session.watch_state();
    let observed = Arc::new(Mutex::new(vec![watch.borrow().version]));
    let sink = observed.clone();
    let watcher = tokio::spawn(async move {
        while watch.changed().await.is_ok() {
            let version = watch.borrow().version;
            sink.lock().push(version);
        }
    });

    for step in 0..12u64 {
        let kind = if step % 3 == 0 { "skip_vote" } else { "vote" };
        session
            .submit_update(kind, fixtures::set("votes", json!({"step": step})), "p1")
            .await
            .unwrap();
        if step % 4 == 0 {
            authority.commit(&fixtures::set("round", json!(step)), BASE + step * 100);
        }
        settle(150).await;
    }
    settle(6_000).await;
    session.shutdown().await.unwrap();
    watcher.abort();

    let observed = observed.lock();
    assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    for change in changes.lock().iter() {
        assert!(change.state.version >= change.previous_version);
    }
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_listener_and_closed_session() {
    let initial = fixtures::authoritative_state(5, BASE);
    let authority = Arc::new(LoopbackAuthority::new(initial.clone()));
    let session = spawn(authority, initial, RoomConfig::default()).await;

    let seen = Arc::new(Mutex::new(0usize));
    let counter = seen.clone();
    let subscription = session.on_state_change(move |_| *counter.lock() += 1);
    session
        .submit_update("vote", fixtures::set("votes", json!({"p1": 1})), "p1")
        .await
        .unwrap();
    assert!(session.unsubscribe(subscription));
    let after_first = *seen.lock();
    session
        .submit_update("vote", fixtures::set("votes", json!({"p1": 2})), "p1")
        .await
        .unwrap();
    settle(200).await;
    assert_eq!(*seen.lock(), after_first);

    session.shutdown().await.unwrap();
    session.shutdown().await.unwrap();
    assert_matches!(
        session
            .submit_update("vote", fixtures::set("votes", json!({})), "p1")
            .await,
        Err(SessionError::Closed)
    );
}
