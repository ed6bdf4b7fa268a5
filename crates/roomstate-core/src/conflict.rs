//! Conflict records and resolution strategies

use crate::identifiers::ConflictId;
use crate::state::{ComponentKey, UnifiedState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Classification of a detected divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both claims edited the same component after their common base
    SimultaneousAction,
    /// Both claims advanced past their common base on disjoint components
    VersionMismatch,
    /// Payloads differ although neither claim edited the differing components
    DataCorruption,
    /// Divergence detected right after the authority was unreachable
    NetworkPartition,
    /// Divergence on components edited by a player who has since disconnected
    PlayerDisconnect,
}

impl ConflictKind {
    /// Default priority of this kind of conflict
    pub fn priority(self) -> ConflictPriority {
        match self {
            ConflictKind::DataCorruption => ConflictPriority::Critical,
            ConflictKind::SimultaneousAction | ConflictKind::NetworkPartition => {
                ConflictPriority::High
            }
            ConflictKind::VersionMismatch => ConflictPriority::Medium,
            ConflictKind::PlayerDisconnect => ConflictPriority::Low,
        }
    }

    /// Stable snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::SimultaneousAction => "simultaneous_action",
            ConflictKind::VersionMismatch => "version_mismatch",
            ConflictKind::DataCorruption => "data_corruption",
            ConflictKind::NetworkPartition => "network_partition",
            ConflictKind::PlayerDisconnect => "player_disconnect",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict priority, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPriority {
    /// Can wait for the auto-resolution timeout
    Low,
    /// Normal divergence
    Medium,
    /// Competing player actions
    High,
    /// Data integrity is in doubt
    Critical,
}

/// A detected disagreement between two claims about the room state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConflict {
    /// Identifier derived from the diverging claims
    pub id: ConflictId,
    /// Classification
    pub kind: ConflictKind,
    /// Urgency
    pub priority: ConflictPriority,
    /// Candidate states, local claim first
    pub conflicting_states: Vec<UnifiedState>,
    /// Components whose content differs between the candidates
    pub affected_components: BTreeSet<ComponentKey>,
    /// Latest `updated_at` among the candidates
    pub raised_at: u64,
}

impl StateConflict {
    /// Reclassify the conflict, updating its priority to match
    pub fn reclassify(mut self, kind: ConflictKind) -> Self {
        self.kind = kind;
        self.priority = kind.priority();
        self
    }

    /// Earliest `updated_at` among the candidates
    pub fn earliest_candidate_at(&self) -> Option<u64> {
        self.conflicting_states.iter().map(|s| s.updated_at).min()
    }
}

/// Per-conflict lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Waiting for a resolution attempt
    Pending,
    /// A resolution attempt is running
    Resolving,
    /// Resolved and consumed
    Resolved,
    /// Abandoned without a resolution
    Failed,
}

/// How a conflict is turned back into a single state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Greatest `updated_at` wins
    #[default]
    LastWriterWins,
    /// Earliest `updated_at` wins
    FirstWriterWins,
    /// Per-component union; contested components fall back to last writer wins
    MergeChanges,
    /// Wait for an explicit decision
    ManualResolution,
    /// Restore the latest snapshot taken before the earliest candidate
    RollbackToCheckpoint,
}

impl ResolutionStrategy {
    /// Stable snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriterWins => "last_writer_wins",
            ResolutionStrategy::FirstWriterWins => "first_writer_wins",
            ResolutionStrategy::MergeChanges => "merge_changes",
            ResolutionStrategy::ManualResolution => "manual_resolution",
            ResolutionStrategy::RollbackToCheckpoint => "rollback_to_checkpoint",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision supplied to `resolve_with`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualResolution {
    /// Adopt this state verbatim (its version is advanced by the resolver)
    State(UnifiedState),
    /// Run this automatic strategy now
    Strategy(ResolutionStrategy),
}

impl From<ResolutionStrategy> for ManualResolution {
    fn from(strategy: ResolutionStrategy) -> Self {
        ManualResolution::Strategy(strategy)
    }
}

impl From<UnifiedState> for ManualResolution {
    fn from(state: UnifiedState) -> Self {
        ManualResolution::State(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_follow_kind() {
        assert_eq!(ConflictKind::DataCorruption.priority(), ConflictPriority::Critical);
        assert_eq!(ConflictKind::SimultaneousAction.priority(), ConflictPriority::High);
        assert_eq!(ConflictKind::VersionMismatch.priority(), ConflictPriority::Medium);
        assert_eq!(ConflictKind::PlayerDisconnect.priority(), ConflictPriority::Low);
        assert!(ConflictPriority::Critical > ConflictPriority::Low);
    }

    #[test]
    fn strategy_names_match_serde() {
        let encoded = serde_json::to_string(&ResolutionStrategy::MergeChanges).unwrap();
        assert_eq!(encoded, "\"merge_changes\"");
        assert_eq!(
            ResolutionStrategy::RollbackToCheckpoint.to_string(),
            "rollback_to_checkpoint"
        );
    }
}
