//! State fixtures modelled on a hidden-role voting game room

use roomstate_core::{Patch, Payload, UnifiedState};
use serde_json::{json, Value};

/// Room payload at the start of a round
pub fn room_payload() -> Payload {
    Payload::from_components([
        ("phase", json!("team_building")),
        ("round", json!(1)),
        ("leader", json!("p1")),
        ("team", json!([])),
        ("votes", json!({})),
    ])
}

/// [`room_payload`] as published by the authority at `version`
pub fn authoritative_state(version: u64, at_ms: u64) -> UnifiedState {
    UnifiedState::authoritative(version, room_payload(), at_ms)
}

/// Single-component patch
pub fn set(key: &str, value: Value) -> Patch {
    Patch::new().set(key, value)
}

/// A local claim: `state` with one unacknowledged edit on top
pub fn local_edit(state: &UnifiedState, key: &str, value: Value, at_ms: u64) -> UnifiedState {
    let mut next = state.clone();
    next.payload.apply(&set(key, value));
    next.local_edits.insert(key.into());
    next.version = state.version + 1;
    next.updated_at = at_ms;
    next
}

/// An authority claim: `state` with one committed change on top
pub fn remote_edit(state: &UnifiedState, key: &str, value: Value, at_ms: u64) -> UnifiedState {
    state.commit_authoritative(&set(key, value), at_ms)
}
