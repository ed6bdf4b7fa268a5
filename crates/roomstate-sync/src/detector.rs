//! Conflict detection
//!
//! Pure comparison of two state claims. Two claims diverge when their
//! payloads differ on at least one component. Whether that divergence is a
//! conflict depends on who changed the differing components since the claims'
//! common authority base:
//!
//! - only one side edited them: that side dominates, no conflict
//! - both sides edited the same component: `simultaneous_action`
//! - both sides edited, but disjoint components: `version_mismatch`
//! - neither side edited them: `data_corruption`
//!
//! The detector never mutates its inputs and never performs I/O.

use roomstate_core::{ComponentKey, ConflictId, ConflictKind, StateConflict, UnifiedState};
use std::collections::BTreeSet;

/// Which claim carries the newer content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The first (local) claim
    Local,
    /// The second (remote) claim
    Remote,
}

/// Outcome of comparing two claims
#[derive(Debug, Clone, PartialEq)]
pub enum Divergence {
    /// Payloads are identical
    Identical,
    /// One side strictly dominates on every differing component
    Dominated {
        /// The dominating side
        winner: Side,
        /// Components that differ
        components: BTreeSet<ComponentKey>,
    },
    /// The claims conflict
    Conflict(StateConflict),
}

/// Compare a local claim against a remote claim.
pub fn compare(local: &UnifiedState, remote: &UnifiedState) -> Divergence {
    let differing = local.payload.diff(&remote.payload);
    if differing.is_empty() {
        return Divergence::Identical;
    }

    let base = local.base_version.min(remote.base_version);
    let local_edits: BTreeSet<_> = local
        .edits_since(base)
        .intersection(&differing)
        .cloned()
        .collect();
    let remote_edits: BTreeSet<_> = remote
        .edits_since(base)
        .intersection(&differing)
        .cloned()
        .collect();

    let kind = match (local_edits.is_empty(), remote_edits.is_empty()) {
        (true, true) => ConflictKind::DataCorruption,
        (true, false) => {
            return Divergence::Dominated {
                winner: Side::Remote,
                components: differing,
            }
        }
        (false, true) => {
            return Divergence::Dominated {
                winner: Side::Local,
                components: differing,
            }
        }
        (false, false) => {
            if local_edits.intersection(&remote_edits).next().is_some() {
                ConflictKind::SimultaneousAction
            } else {
                ConflictKind::VersionMismatch
            }
        }
    };

    Divergence::Conflict(build_conflict(kind, local, remote, differing))
}

/// Detect conflicts between two claims.
///
/// Returns at most one conflict covering every differing component.
pub fn detect(local: &UnifiedState, remote: &UnifiedState) -> Vec<StateConflict> {
    match compare(local, remote) {
        Divergence::Conflict(conflict) => vec![conflict],
        Divergence::Identical | Divergence::Dominated { .. } => Vec::new(),
    }
}

fn build_conflict(
    kind: ConflictKind,
    local: &UnifiedState,
    remote: &UnifiedState,
    affected: BTreeSet<ComponentKey>,
) -> StateConflict {
    let components: Vec<&str> = affected.iter().map(ComponentKey::as_str).collect();
    let label = format!(
        "{}/{}:{}/{}:{}",
        local.version,
        local.base_version,
        remote.version,
        remote.base_version,
        components.join(",")
    );

    StateConflict {
        id: ConflictId::derive(label.as_bytes()),
        kind,
        priority: kind.priority(),
        raised_at: local.updated_at.max(remote.updated_at),
        conflicting_states: vec![local.clone(), remote.clone()],
        affected_components: affected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomstate_core::{ConflictPriority, Patch, Payload};
    use serde_json::json;

    fn base() -> UnifiedState {
        UnifiedState::authoritative(
            5,
            Payload::from_components([("team", json!([])), ("votes", json!({}))]),
            1_000,
        )
    }

    fn local_edit(state: &UnifiedState, key: &str, value: serde_json::Value) -> UnifiedState {
        let mut next = state.clone();
        next.payload.apply(&Patch::new().set(key, value));
        next.version += 1;
        next.local_edits.insert(key.into());
        next
    }

    #[test]
    fn identical_payloads_do_not_conflict() {
        let a = base();
        let mut b = base();
        b.version = 9;
        assert!(detect(&a, &b).is_empty());
        assert_eq!(compare(&a, &b), Divergence::Identical);
    }

    #[test]
    fn remote_only_edits_dominate() {
        let local = base();
        let remote = local.commit_authoritative(&Patch::new().set("team", json!(["a"])), 2_000);

        assert!(detect(&local, &remote).is_empty());
        assert!(matches!(
            compare(&local, &remote),
            Divergence::Dominated { winner: Side::Remote, .. }
        ));
    }

    #[test]
    fn local_only_edits_dominate() {
        let local = local_edit(&base(), "votes", json!({"p1": true}));
        assert!(matches!(
            compare(&local, &base()),
            Divergence::Dominated { winner: Side::Local, .. }
        ));
    }

    #[test]
    fn disjoint_edits_are_version_mismatch() {
        let local = local_edit(&base(), "votes", json!({"p1": true}));
        let remote = base().commit_authoritative(&Patch::new().set("team", json!(["a"])), 2_000);

        let conflicts = detect(&local, &remote);
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::VersionMismatch);
        assert_eq!(conflict.priority, ConflictPriority::Medium);
        assert_eq!(conflict.affected_components.len(), 2);
        assert_eq!(conflict.raised_at, 2_000);
        assert_eq!(conflict.conflicting_states[0], local);
    }

    #[test]
    fn overlapping_edits_are_simultaneous_action() {
        let local = local_edit(&base(), "votes", json!({"p1": true}));
        let remote =
            base().commit_authoritative(&Patch::new().set("votes", json!({"p2": false})), 2_000);

        let conflicts = detect(&local, &remote);
        assert_eq!(conflicts[0].kind, ConflictKind::SimultaneousAction);
    }

    #[test]
    fn unexplained_difference_is_corruption() {
        let local = base();
        let mut remote = base();
        remote.payload.set("votes", json!("garbage"));

        let conflicts = detect(&local, &remote);
        assert_eq!(conflicts[0].kind, ConflictKind::DataCorruption);
        assert_eq!(conflicts[0].priority, ConflictPriority::Critical);
    }

    #[test]
    fn detection_is_deterministic_and_pure() {
        let local = local_edit(&base(), "votes", json!({"p1": true}));
        let remote = base().commit_authoritative(&Patch::new().set("team", json!(["a"])), 2_000);
        let before = (local.clone(), remote.clone());

        let first = detect(&local, &remote);
        let second = detect(&local, &remote);
        assert_eq!(first, second);
        assert_eq!((local, remote), before);
    }
}
