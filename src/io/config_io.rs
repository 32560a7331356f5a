use std::fs;
use std::path::{Path, PathBuf};

use crate::io::atomic_write;
use crate::model::config::SyncConfig;

/// Default state directory, relative to the workspace root
pub const STATE_DIR: &str = ".tasksync";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid sync.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0} already exists")]
    AlreadyInitialized(PathBuf),
}

const DEFAULT_CONFIG: &str = r#"# tasksync configuration

# Folder holding one markdown document per project
sync_dir = "Tasks"

# Push local edits back to the remote service
bidirectional = true

# Seconds allowed for fetching the remote state
fetch_timeout_secs = 30

# Backup archives kept in <state dir>/backups
backup_retention = 10

# Insert tasks that are already completed when first seen
include_completed = false

[incremental]
enabled = true
# Below this many tasks every run is a full pass
min_sample = 20
# Changed fraction at or above which a full pass is used
change_threshold = 0.30
"#;

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join("sync.toml")
}

pub fn mapping_path(state_dir: &Path) -> PathBuf {
    state_dir.join("mappings.json")
}

pub fn backup_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("backups")
}

/// Read `sync.toml`. A missing file yields the defaults.
pub fn read_config(state_dir: &Path) -> Result<SyncConfig, ConfigError> {
    let path = config_path(state_dir);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(toml::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyncConfig::default()),
        Err(e) => Err(ConfigError::Read { path, source: e }),
    }
}

/// Create the state directory and a commented default `sync.toml`
pub fn write_default_config(state_dir: &Path) -> Result<PathBuf, ConfigError> {
    let path = config_path(state_dir);
    if path.exists() {
        return Err(ConfigError::AlreadyInitialized(path));
    }
    let write_err = |e| ConfigError::Write {
        path: path.clone(),
        source: e,
    };
    fs::create_dir_all(state_dir).map_err(write_err)?;
    atomic_write(&path, DEFAULT_CONFIG.as_bytes()).map_err(write_err)?;
    Ok(path)
}
