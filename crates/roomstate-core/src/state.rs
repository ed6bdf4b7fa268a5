//! Versioned room state
//!
//! [`UnifiedState`] is the value every component passes around. Its payload is
//! a map from [`ComponentKey`] (the sub-region granularity declared by the
//! game-rule modules) to a shared JSON value. Component values are reference
//! counted, so copying a state costs one pointer per component and never
//! deep-clones game data.
//!
//! Besides the payload, a state carries the causality metadata the conflict
//! detector needs:
//!
//! - `version`: local monotone counter, bumped on every accepted mutation
//! - `base_version`: the authority version this state descends from
//! - `component_versions`: authority version at which each component last changed
//! - `local_edits`: components changed locally and not yet acknowledged

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Name of one independently diffable sub-region of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentKey(String);

impl ComponentKey {
    /// Create a component key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ComponentKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ComponentKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Opaque room data, keyed by component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    components: BTreeMap<ComponentKey, Arc<Value>>,
}

impl Payload {
    /// Create an empty payload
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a payload from `(key, value)` pairs
    pub fn from_components<K, I>(components: I) -> Self
    where
        K: Into<ComponentKey>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self {
            components: components
                .into_iter()
                .map(|(k, v)| (k.into(), Arc::new(v)))
                .collect(),
        }
    }

    /// Value of one component
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.components.get(key).map(Arc::as_ref)
    }

    /// Shared handle to one component's value
    pub fn get_shared(&self, key: &str) -> Option<Arc<Value>> {
        self.components.get(key).cloned()
    }

    /// Set a component value
    pub fn set(&mut self, key: impl Into<ComponentKey>, value: Value) {
        self.components.insert(key.into(), Arc::new(value));
    }

    /// Remove a component, returning its previous value
    pub fn remove(&mut self, key: &str) -> Option<Arc<Value>> {
        self.components.remove(key)
    }

    /// Whether the payload holds the component
    pub fn contains(&self, key: &str) -> bool {
        self.components.contains_key(key)
    }

    /// Component keys in order
    pub fn keys(&self) -> impl Iterator<Item = &ComponentKey> {
        self.components.keys()
    }

    /// Iterate `(key, value)` pairs in key order
    pub fn iter(&self) -> impl Iterator<Item = (&ComponentKey, &Value)> {
        self.components.iter().map(|(k, v)| (k, v.as_ref()))
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the payload has no components
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Components whose value differs between `self` and `other`, including
    /// components present on only one side.
    pub fn diff(&self, other: &Payload) -> BTreeSet<ComponentKey> {
        let mut changed = BTreeSet::new();
        for (key, value) in &self.components {
            match other.components.get(key) {
                Some(theirs) if Arc::ptr_eq(value, theirs) || value == theirs => {}
                _ => {
                    changed.insert(key.clone());
                }
            }
        }
        for key in other.components.keys() {
            if !self.components.contains_key(key) {
                changed.insert(key.clone());
            }
        }
        changed
    }

    /// Whether `self` and `other` hold the same value for `key`
    pub fn same_component(&self, other: &Payload, key: &str) -> bool {
        match (self.components.get(key), other.components.get(key)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a == b,
            (None, None) => true,
            _ => false,
        }
    }

    /// Apply a patch in place and return its inverse.
    ///
    /// Applying the returned patch restores every component the patch touched
    /// to its previous value (or removes it if it did not exist).
    pub fn apply(&mut self, patch: &Patch) -> Patch {
        let mut inverse = Patch::new();
        for (key, write) in &patch.writes {
            let previous = match write {
                Some(value) => self.components.insert(key.clone(), Arc::clone(value)),
                None => self.components.remove(key.as_str()),
            };
            inverse.writes.insert(key.clone(), previous);
        }
        inverse
    }

    /// Write one component from an optional shared value
    pub fn write(&mut self, key: &ComponentKey, value: Option<Arc<Value>>) {
        match value {
            Some(value) => {
                self.components.insert(key.clone(), value);
            }
            None => {
                self.components.remove(key.as_str());
            }
        }
    }
}

// =============================================================================
// Patch
// =============================================================================

/// A set of component writes. `None` removes the component.
///
/// On the wire each write is tagged (`{"set": value}` or `"remove"`), so a
/// component set to JSON `null` stays distinct from a removal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(with = "tagged_writes")]
    writes: BTreeMap<ComponentKey, Option<Arc<Value>>>,
}

mod tagged_writes {
    use super::ComponentKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Write {
        Set(Arc<Value>),
        Remove,
    }

    pub fn serialize<S: Serializer>(
        writes: &BTreeMap<ComponentKey, Option<Arc<Value>>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(writes.iter().map(|(key, write)| {
            let write = match write {
                Some(value) => Write::Set(Arc::clone(value)),
                None => Write::Remove,
            };
            (key, write)
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ComponentKey, Option<Arc<Value>>>, D::Error> {
        let writes = BTreeMap::<ComponentKey, Write>::deserialize(deserializer)?;
        Ok(writes
            .into_iter()
            .map(|(key, write)| match write {
                Write::Set(value) => (key, Some(value)),
                Write::Remove => (key, None),
            })
            .collect())
    }
}

impl Patch {
    /// Create an empty patch
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a component
    pub fn set(mut self, key: impl Into<ComponentKey>, value: Value) -> Self {
        self.writes.insert(key.into(), Some(Arc::new(value)));
        self
    }

    /// Builder: remove a component
    pub fn remove(mut self, key: impl Into<ComponentKey>) -> Self {
        self.writes.insert(key.into(), None);
        self
    }

    /// Record a write, replacing any earlier write to the same component
    pub fn insert_write(&mut self, key: ComponentKey, value: Option<Arc<Value>>) {
        self.writes.insert(key, value);
    }

    /// The write recorded for `key`, if any
    pub fn write_for(&self, key: &str) -> Option<&Option<Arc<Value>>> {
        self.writes.get(key)
    }

    /// Whether the patch writes `key`
    pub fn touches(&self, key: &str) -> bool {
        self.writes.contains_key(key)
    }

    /// Components written by this patch
    pub fn components(&self) -> impl Iterator<Item = &ComponentKey> {
        self.writes.keys()
    }

    /// Components written by this patch, collected
    pub fn component_set(&self) -> BTreeSet<ComponentKey> {
        self.writes.keys().cloned().collect()
    }

    /// Iterate writes in component order
    pub fn iter(&self) -> impl Iterator<Item = (&ComponentKey, &Option<Arc<Value>>)> {
        self.writes.iter()
    }

    /// Number of writes
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the patch writes nothing
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

// =============================================================================
// Status enums
// =============================================================================

/// Synchronization status of a state value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local view agrees with the last authority response
    #[default]
    Synchronized,
    /// Local edits are waiting for the authority
    Syncing,
    /// A detected conflict is awaiting resolution
    Conflict,
    /// Synchronization failed terminally
    Error,
}

/// Persistence status of a state value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceStatus {
    /// The current payload is covered by a snapshot
    Saved,
    /// The payload changed since the last snapshot
    #[default]
    Dirty,
    /// A snapshot write is in progress
    Saving,
    /// The last snapshot write failed
    Error,
}

// =============================================================================
// UnifiedState
// =============================================================================

/// The room's logical state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedState {
    /// Monotone version, bumped on every accepted mutation
    pub version: u64,
    /// Game data, owned by external rule modules
    pub payload: Payload,
    /// Wall-clock time of the last mutation (ms since UNIX epoch)
    pub updated_at: u64,
    /// Wall-clock time of the last successful sync round
    pub last_synced_at: Option<u64>,
    /// Synchronization status
    pub sync_status: SyncStatus,
    /// Persistence status
    pub persistence_status: PersistenceStatus,
    /// Authority version this state descends from
    pub base_version: u64,
    /// Authority version at which each component last changed
    pub component_versions: BTreeMap<ComponentKey, u64>,
    /// Components changed locally and not yet acknowledged by the authority
    pub local_edits: BTreeSet<ComponentKey>,
}

impl UnifiedState {
    /// Initial state for a fresh room
    pub fn genesis(payload: Payload, now_ms: u64) -> Self {
        let component_versions = payload.keys().map(|k| (k.clone(), 0)).collect();
        Self {
            version: 0,
            payload,
            updated_at: now_ms,
            last_synced_at: None,
            sync_status: SyncStatus::Synchronized,
            persistence_status: PersistenceStatus::Dirty,
            base_version: 0,
            component_versions,
            local_edits: BTreeSet::new(),
        }
    }

    /// A state as published by the authority at `version`.
    ///
    /// Every component is stamped with `version`; authorities that track
    /// per-component history should use [`UnifiedState::commit_authoritative`].
    pub fn authoritative(version: u64, payload: Payload, now_ms: u64) -> Self {
        let component_versions = payload.keys().map(|k| (k.clone(), version)).collect();
        Self {
            version,
            payload,
            updated_at: now_ms,
            last_synced_at: Some(now_ms),
            sync_status: SyncStatus::Synchronized,
            persistence_status: PersistenceStatus::Saved,
            base_version: version,
            component_versions,
            local_edits: BTreeSet::new(),
        }
    }

    /// Authority-side commit: apply `patch` as the next authority version,
    /// stamping the touched components.
    pub fn commit_authoritative(&self, patch: &Patch, now_ms: u64) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.base_version = next.version;
        next.payload.apply(patch);
        for key in patch.components() {
            if next.payload.contains(key.as_str()) {
                next.component_versions.insert(key.clone(), next.version);
            } else {
                next.component_versions.remove(key.as_str());
            }
        }
        next.local_edits.clear();
        next.updated_at = now_ms;
        next
    }

    /// Whether the state carries unacknowledged local edits
    pub fn has_local_edits(&self) -> bool {
        !self.local_edits.is_empty()
    }

    /// Whether this is a pure authority claim (no local edits on top)
    pub fn is_authoritative(&self) -> bool {
        self.local_edits.is_empty() && self.base_version == self.version
    }

    /// Components this state changed after authority version `base`.
    pub fn edits_since(&self, base: u64) -> BTreeSet<ComponentKey> {
        let mut edits = self.local_edits.clone();
        edits.extend(
            self.component_versions
                .iter()
                .filter(|(_, &v)| v > base)
                .map(|(k, _)| k.clone()),
        );
        edits
    }

    /// Authority version of one component, 0 if never stamped
    pub fn component_version(&self, key: &str) -> u64 {
        self.component_versions.get(key).copied().unwrap_or(0)
    }

    /// Copy of this state with `payload` as the next version.
    pub fn successor(&self, payload: Payload, now_ms: u64) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.payload = payload;
        next.updated_at = now_ms.max(self.updated_at);
        next.persistence_status = PersistenceStatus::Dirty;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Payload {
        Payload::from_components([
            ("round", json!(1)),
            ("votes", json!({"merlin": "approve"})),
        ])
    }

    #[test]
    fn apply_returns_exact_inverse() {
        let original = payload();
        let mut working = original.clone();
        let patch = Patch::new()
            .set("round", json!(2))
            .set("leader", json!("percival"))
            .remove("votes");

        let inverse = working.apply(&patch);
        assert_eq!(working.get("round"), Some(&json!(2)));
        assert!(!working.contains("votes"));

        working.apply(&inverse);
        assert_eq!(working, original);
    }

    #[test]
    fn diff_reports_changed_added_and_removed_components() {
        let a = payload();
        let mut b = payload();
        b.set("round", json!(3));
        b.set("leader", json!("morgana"));
        b.remove("votes");

        let diff: Vec<_> = a.diff(&b).into_iter().map(|k| k.to_string()).collect();
        assert_eq!(diff, vec!["leader", "round", "votes"]);
        assert!(a.diff(&a.clone()).is_empty());
    }

    #[test]
    fn commit_authoritative_stamps_touched_components() {
        let genesis = UnifiedState::authoritative(4, payload(), 10);
        let next = genesis.commit_authoritative(&Patch::new().set("round", json!(2)), 20);

        assert_eq!(next.version, 5);
        assert_eq!(next.base_version, 5);
        assert_eq!(next.component_version("round"), 5);
        assert_eq!(next.component_version("votes"), 4);
        assert_eq!(next.edits_since(4).len(), 1);
    }

    #[test]
    fn edits_since_includes_local_edits() {
        let mut state = UnifiedState::authoritative(4, payload(), 10);
        state.local_edits.insert("votes".into());

        let edits = state.edits_since(4);
        assert!(edits.contains("votes"));
        assert!(!edits.contains("round"));
    }

    #[test]
    fn null_write_survives_serde_distinct_from_removal() {
        let patch = Patch::new().set("leader", Value::Null).remove("votes");
        let encoded = serde_json::to_value(&patch).expect("patch serializes");
        assert_eq!(
            encoded,
            json!({"writes": {"leader": {"set": null}, "votes": "remove"}})
        );

        let decoded: Patch = serde_json::from_value(encoded).expect("patch deserializes");
        assert_eq!(decoded, patch);
        assert_eq!(decoded.write_for("leader"), Some(&Some(Arc::new(Value::Null))));

        let mut working = payload();
        working.set("leader", json!("merlin"));
        working.apply(&decoded);
        assert_eq!(working.get("leader"), Some(&Value::Null));
        assert!(!working.contains("votes"));
    }

    #[test]
    fn state_serializes_with_snake_case_statuses() {
        let state = UnifiedState::genesis(payload(), 0);
        let encoded = serde_json::to_value(&state).expect("state serializes");

        assert_eq!(encoded["sync_status"], json!("synchronized"));
        assert_eq!(encoded["persistence_status"], json!("dirty"));
        let decoded: UnifiedState = serde_json::from_value(encoded).expect("state deserializes");
        assert_eq!(decoded, state);
    }
}
