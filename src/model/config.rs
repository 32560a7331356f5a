use serde::{Deserialize, Serialize};

/// Configuration from sync.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Folder (relative to the workspace root) holding one document per project
    #[serde(default = "default_sync_dir")]
    pub sync_dir: String,
    /// Push local edits back to the remote service
    #[serde(default = "default_true")]
    pub bidirectional: bool,
    /// Deadline for the remote fetch, in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Number of backup archives kept
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    #[serde(default)]
    pub incremental: IncrementalConfig,
    /// Insert tasks that are already completed the first time they are seen
    #[serde(default)]
    pub include_completed: bool,
    /// Version stamped into backup metadata
    #[serde(default = "default_plugin_version")]
    pub plugin_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Below this many tasks a full pass is always used
    #[serde(default = "default_min_sample")]
    pub min_sample: usize,
    /// Changed fraction at or above which a full pass is used
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            sync_dir: default_sync_dir(),
            bidirectional: true,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            backup_retention: default_backup_retention(),
            incremental: IncrementalConfig::default(),
            include_completed: false,
            plugin_version: default_plugin_version(),
        }
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        IncrementalConfig {
            enabled: true,
            min_sample: default_min_sample(),
            change_threshold: default_change_threshold(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sync_dir() -> String {
    "Tasks".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_backup_retention() -> usize {
    10
}

fn default_min_sample() -> usize {
    20
}

fn default_change_threshold() -> f64 {
    0.30
}

fn default_plugin_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
