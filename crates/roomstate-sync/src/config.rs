//! Room engine configuration
//!
//! Every knob has a documented default. Durations are stored as `*_ms`
//! integers so the configuration reads naturally from TOML, with `Duration`
//! accessors for the engine.

use roomstate_core::{ResolutionStrategy, SessionError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Synchronizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between periodic sync rounds
    pub interval_ms: u64,
    /// Failed rounds tolerated before sync halts
    pub max_retries: u32,
    /// Backoff after the first failure
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
    /// Timeout for one round trip
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_retries: 5,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl SyncConfig {
    /// Interval between periodic rounds
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Round-trip timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Optimistic update settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisticConfig {
    /// Time an update may stay unconfirmed before it is rolled back
    pub update_timeout_ms: u64,
    /// Ceiling on unconfirmed updates
    pub max_pending: usize,
    /// Re-applications allowed after rollbacks
    pub max_retries: u32,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            update_timeout_ms: 5_000,
            max_pending: 50,
            max_retries: 3,
        }
    }
}

/// Conflict resolver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Strategy applied when a conflict is raised
    pub default_strategy: ResolutionStrategy,
    /// Time after which an open conflict is force-resolved (last writer wins)
    pub auto_resolve_timeout_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            default_strategy: ResolutionStrategy::LastWriterWins,
            auto_resolve_timeout_ms: 10_000,
        }
    }
}

/// Snapshot store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Auto-save interval; `0` disables auto-save
    pub autosave_interval_ms: u64,
    /// Snapshots retained before oldest-first eviction
    pub max_snapshots: usize,
    /// Storage budget in bytes
    pub quota_bytes: u64,
    /// Fraction of the budget above which a warning is raised
    pub quota_warn_ratio: f64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            autosave_interval_ms: 15_000,
            max_snapshots: 10,
            quota_bytes: 5 * 1024 * 1024,
            quota_warn_ratio: 0.8,
        }
    }
}

impl SnapshotConfig {
    /// Auto-save interval, `None` when disabled
    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_interval_ms > 0).then(|| Duration::from_millis(self.autosave_interval_ms))
    }
}

/// Complete per-room configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Synchronizer settings
    pub sync: SyncConfig,
    /// Optimistic update settings
    pub optimistic: OptimisticConfig,
    /// Conflict resolver settings
    pub conflict: ConflictConfig,
    /// Snapshot store settings
    pub snapshot: SnapshotConfig,
}

impl RoomConfig {
    /// Start a builder from the defaults
    pub fn builder() -> RoomConfigBuilder {
        RoomConfigBuilder::default()
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, SessionError> {
        let config: RoomConfig = toml::from_str(content)
            .map_err(|e| SessionError::invalid_config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionError::invalid_config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.sync.interval_ms == 0 {
            return Err(SessionError::invalid_config("sync.interval_ms must be greater than 0"));
        }
        if self.sync.request_timeout_ms == 0 {
            return Err(SessionError::invalid_config(
                "sync.request_timeout_ms must be greater than 0",
            ));
        }
        if self.sync.backoff_base_ms == 0 {
            return Err(SessionError::invalid_config(
                "sync.backoff_base_ms must be greater than 0",
            ));
        }
        if self.sync.backoff_max_ms < self.sync.backoff_base_ms {
            return Err(SessionError::invalid_config(
                "sync.backoff_max_ms must be at least sync.backoff_base_ms",
            ));
        }
        if self.optimistic.update_timeout_ms == 0 {
            return Err(SessionError::invalid_config(
                "optimistic.update_timeout_ms must be greater than 0",
            ));
        }
        if self.optimistic.max_pending == 0 {
            return Err(SessionError::invalid_config(
                "optimistic.max_pending must be greater than 0",
            ));
        }
        if self.conflict.auto_resolve_timeout_ms == 0 {
            return Err(SessionError::invalid_config(
                "conflict.auto_resolve_timeout_ms must be greater than 0",
            ));
        }
        if self.snapshot.max_snapshots == 0 {
            return Err(SessionError::invalid_config(
                "snapshot.max_snapshots must be greater than 0",
            ));
        }
        if self.snapshot.quota_bytes == 0 {
            return Err(SessionError::invalid_config(
                "snapshot.quota_bytes must be greater than 0",
            ));
        }
        if !(self.snapshot.quota_warn_ratio > 0.0 && self.snapshot.quota_warn_ratio <= 1.0) {
            return Err(SessionError::invalid_config(
                "snapshot.quota_warn_ratio must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`RoomConfig`]
#[derive(Debug, Clone, Default)]
pub struct RoomConfigBuilder {
    config: RoomConfig,
}

impl RoomConfigBuilder {
    /// Set the periodic sync interval
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the number of failed sync rounds tolerated
    pub fn with_max_sync_retries(mut self, retries: u32) -> Self {
        self.config.sync.max_retries = retries;
        self
    }

    /// Set the sync backoff base and ceiling
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.sync.backoff_base_ms = base.as_millis() as u64;
        self.config.sync.backoff_max_ms = max.as_millis() as u64;
        self
    }

    /// Set the sync round-trip timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the optimistic update timeout
    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.config.optimistic.update_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the pending update ceiling
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.config.optimistic.max_pending = max_pending;
        self
    }

    /// Set the number of retries allowed per rolled-back update
    pub fn with_max_update_retries(mut self, retries: u32) -> Self {
        self.config.optimistic.max_retries = retries;
        self
    }

    /// Set the default resolution strategy
    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.config.conflict.default_strategy = strategy;
        self
    }

    /// Set the conflict auto-resolution timeout
    pub fn with_conflict_timeout(mut self, timeout: Duration) -> Self {
        self.config.conflict.auto_resolve_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the snapshot auto-save interval (`None` disables it)
    pub fn with_autosave(mut self, interval: Option<Duration>) -> Self {
        self.config.snapshot.autosave_interval_ms =
            interval.map(|d| d.as_millis() as u64).unwrap_or(0);
        self
    }

    /// Set the snapshot retention count
    pub fn with_max_snapshots(mut self, max: usize) -> Self {
        self.config.snapshot.max_snapshots = max;
        self
    }

    /// Set the snapshot storage budget
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.config.snapshot.quota_bytes = bytes;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<RoomConfig, SessionError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        let config = RoomConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.interval(), Duration::from_secs(1));
        assert_eq!(config.optimistic.max_pending, 50);
        assert_eq!(config.conflict.default_strategy, ResolutionStrategy::LastWriterWins);
        assert_eq!(config.snapshot.max_snapshots, 10);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = RoomConfig::from_toml_str(
            r#"
            [sync]
            interval_ms = 500

            [conflict]
            default_strategy = "merge_changes"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync.interval_ms, 500);
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.conflict.default_strategy, ResolutionStrategy::MergeChanges);
        assert_eq!(config.snapshot.quota_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn validation_rejects_inverted_backoff() {
        let result = RoomConfig::builder()
            .with_backoff(Duration::from_secs(2), Duration::from_secs(1))
            .build();
        assert_matches!(result, Err(SessionError::InvalidConfig { .. }));
    }

    #[test]
    fn validation_rejects_bad_warn_ratio() {
        let result = RoomConfig::from_toml_str("[snapshot]\nquota_warn_ratio = 1.5\n");
        assert_matches!(result, Err(SessionError::InvalidConfig { .. }));
    }

    #[test]
    fn load_from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("room.toml");
        std::fs::write(&path, "[optimistic]\nmax_pending = 8\n").unwrap();

        let config = RoomConfig::load_from_file(&path).unwrap();
        assert_eq!(config.optimistic.max_pending, 8);
    }
}
