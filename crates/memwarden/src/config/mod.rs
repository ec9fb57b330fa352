use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::resource::ResourceTypeDescriptor;

/// Main configuration structure for memwarden
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Per-resource lock configuration
    #[serde(default)]
    pub locks: LockConfig,
    /// Pre-release snapshot configuration
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    /// Registry, expiry sweep and pressure pipeline configuration
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Release scoring weights
    #[serde(default)]
    pub scoring: ScoringWeights,
    /// Compaction configuration
    #[serde(default)]
    pub defrag: DefragConfig,
    /// Resource type table
    #[serde(default = "default_types")]
    pub types: Vec<ResourceTypeDescriptor>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            locks: LockConfig::default(),
            snapshots: SnapshotConfig::default(),
            tracker: TrackerConfig::default(),
            scoring: ScoringWeights::default(),
            defrag: DefragConfig::default(),
            types: default_types(),
        }
    }
}

impl Config {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| WardenError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, or from the first default location that exists.
    ///
    /// Falls back to [`Config::default`] when no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::read_file(path);
        }

        for candidate in default_config_paths() {
            if candidate.exists() {
                tracing::info!("Loading config from: {}", candidate.display());
                return Self::read_file(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check cross-field invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for descriptor in &self.types {
            if descriptor.type_name.is_empty() || descriptor.type_name.contains(':') {
                return Err(WardenError::Config(format!(
                    "Invalid type name: {:?}",
                    descriptor.type_name
                )));
            }
            if !seen.insert(descriptor.type_name.as_str()) {
                return Err(WardenError::Config(format!(
                    "Duplicate type name: {}",
                    descriptor.type_name
                )));
            }
        }

        if self.locks.timeout_secs == 0 {
            return Err(WardenError::Config("locks.timeout_secs must be > 0".into()));
        }
        if self.snapshots.max_snapshots == 0 {
            return Err(WardenError::Config(
                "snapshots.max_snapshots must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.tracker.incremental_pressure_ratio) {
            return Err(WardenError::Config(
                "tracker.incremental_pressure_ratio must be within 0.0..=1.0".into(),
            ));
        }
        if !(self.tracker.incremental_fraction > 0.0 && self.tracker.incremental_fraction <= 1.0)
        {
            return Err(WardenError::Config(
                "tracker.incremental_fraction must be within (0.0, 1.0]".into(),
            ));
        }
        Ok(())
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    [
        dirs::home_dir().map(|h| h.join(".memwarden").join("config.toml")),
        dirs::config_dir().map(|c| c.join("memwarden").join("config.toml")),
        Some(PathBuf::from("memwarden.toml")),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Per-resource lock configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Maximum time a lock may be held before it is force-released
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,
    /// How often the lock monitor scans held locks
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Number of timeout violations kept for inspection
    #[serde(default = "default_violation_history")]
    pub violation_history: usize,
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout_secs(),
            monitor_interval_ms: default_monitor_interval_ms(),
            violation_history: default_violation_history(),
        }
    }
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_violation_history() -> usize {
    100
}

/// Pre-release snapshot configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// Types whose priority is strictly below this value are snapshotted
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: u32,
    /// Snapshot retention
    #[serde(default = "default_snapshot_ttl_secs")]
    pub ttl_secs: u64,
    /// Maximum number of snapshots kept (oldest evicted first)
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    /// How long `take` waits for a read lock
    #[serde(default = "default_read_lock_timeout_ms")]
    pub read_lock_timeout_ms: u64,
    /// Background purge interval
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl SnapshotConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn read_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.read_lock_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            priority_threshold: default_priority_threshold(),
            ttl_secs: default_snapshot_ttl_secs(),
            max_snapshots: default_max_snapshots(),
            read_lock_timeout_ms: default_read_lock_timeout_ms(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_priority_threshold() -> u32 {
    4
}

fn default_snapshot_ttl_secs() -> u64 {
    600
}

fn default_max_snapshots() -> usize {
    20
}

fn default_read_lock_timeout_ms() -> u64 {
    100
}

fn default_cleanup_interval_secs() -> u64 {
    120
}

/// Registry and release pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Expiry sweep interval
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long the reaper waits for a write lock before aborting a release
    #[serde(default = "default_release_lock_timeout_ms")]
    pub release_lock_timeout_ms: u64,
    /// Pressure at or below this share of tracked bytes counts as moderate
    #[serde(default = "default_incremental_pressure_ratio")]
    pub incremental_pressure_ratio: f64,
    /// Share of an incrementally releasable resource discarded under moderate pressure
    #[serde(default = "default_incremental_fraction")]
    pub incremental_fraction: f64,
    /// Number of release events kept in the history
    #[serde(default = "default_event_history")]
    pub event_history: usize,
}

impl TrackerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn release_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.release_lock_timeout_ms)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            release_lock_timeout_ms: default_release_lock_timeout_ms(),
            incremental_pressure_ratio: default_incremental_pressure_ratio(),
            incremental_fraction: default_incremental_fraction(),
            event_history: default_event_history(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_release_lock_timeout_ms() -> u64 {
    250
}

fn default_incremental_pressure_ratio() -> f64 {
    0.25
}

fn default_incremental_fraction() -> f64 {
    0.5
}

fn default_event_history() -> usize {
    200
}

/// Weights of the release score. Lower scores are released first.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ScoringWeights {
    /// Multiplier applied to the type priority
    #[serde(default = "default_base_weight")]
    pub base_weight: f64,
    /// Points subtracted per second since last access
    #[serde(default = "default_age_weight")]
    pub age_per_second: f64,
    /// Points subtracted per MiB of footprint
    #[serde(default = "default_size_weight")]
    pub size_per_mib: f64,
    /// Points added while a resource is in use
    #[serde(default = "default_active_penalty")]
    pub active_penalty: f64,
    /// Points subtracted once a resource outlives its retain time
    #[serde(default = "default_expired_bonus")]
    pub expired_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            base_weight: default_base_weight(),
            age_per_second: default_age_weight(),
            size_per_mib: default_size_weight(),
            active_penalty: default_active_penalty(),
            expired_bonus: default_expired_bonus(),
        }
    }
}

fn default_base_weight() -> f64 {
    1000.0
}

fn default_age_weight() -> f64 {
    0.1
}

fn default_size_weight() -> f64 {
    0.5
}

fn default_active_penalty() -> f64 {
    1_000_000.0
}

fn default_expired_bonus() -> f64 {
    100_000.0
}

/// Compaction configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DefragConfig {
    /// Timer-driven compaction interval
    #[serde(default = "default_defrag_interval_secs")]
    pub interval_secs: u64,
    /// Cumulative released bytes that trigger a compaction
    #[serde(default = "default_release_threshold_bytes")]
    pub release_threshold_bytes: u64,
}

impl DefragConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for DefragConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_defrag_interval_secs(),
            release_threshold_bytes: default_release_threshold_bytes(),
        }
    }
}

fn default_defrag_interval_secs() -> u64 {
    3600
}

fn default_release_threshold_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_types() -> Vec<ResourceTypeDescriptor> {
    vec![
        ResourceTypeDescriptor::new("temp_buffers", 1, 60),
        ResourceTypeDescriptor::new("render_cache", 2, 300).compressible(),
        ResourceTypeDescriptor::new("audio_buffers", 3, 120),
        ResourceTypeDescriptor::new("index_structures", 4, 1800).incremental(),
        ResourceTypeDescriptor::new("model_shards", 5, 3600).compressible(),
    ]
}
