use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::io::atomic_write;
use crate::io::remote::{Deadline, RemoteError, RemoteTaskService};
use crate::model::remote::RemoteSnapshot;

/// Current version of the backup record format
pub const BACKUP_VERSION: u32 = 1;

const FILE_PREFIX: &str = "backup-";

/// Error type for backup operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("backup is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("backup record is malformed: {0}")]
    InvalidShape(String),
    #[error("backup version {0} is not supported")]
    UnsupportedVersion(u64),
    #[error("could not fetch remote state: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub total_tasks: usize,
    pub total_projects: usize,
    pub backup_reason: String,
    pub plugin_version: String,
}

/// An immutable snapshot of the remote state taken before a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub data: RemoteSnapshot,
    pub metadata: BackupMetadata,
}

/// Outcome of a backup attempt. Failure is reported, never raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    pub success: bool,
    pub backup_file: Option<PathBuf>,
    pub error: Option<String>,
}

impl BackupOutcome {
    fn failed(error: impl ToString) -> Self {
        BackupOutcome {
            success: false,
            backup_file: None,
            error: Some(error.to_string()),
        }
    }
}

/// A backup archive on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

/// Writes timestamped backup archives into a directory and keeps only the
/// most recent `retention` of them.
pub struct BackupArchiver {
    dir: PathBuf,
    retention: usize,
    plugin_version: String,
}

impl BackupArchiver {
    pub fn new(dir: &Path, retention: usize, plugin_version: &str) -> Self {
        BackupArchiver {
            dir: dir.to_path_buf(),
            retention: retention.max(1),
            plugin_version: plugin_version.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch the full remote entity set and archive it
    pub async fn create_pre_sync_backup(
        &self,
        remote: &dyn RemoteTaskService,
        deadline: Deadline,
        reason: &str,
    ) -> BackupOutcome {
        let fetched = tokio::time::timeout_at(deadline.instant(), remote.fetch_all(deadline)).await;
        match fetched {
            Ok(Ok(snapshot)) => self.archive_snapshot(&snapshot, reason),
            Ok(Err(e)) => {
                warn!(error = %e, "backup fetch failed");
                BackupOutcome::failed(BackupError::Remote(e))
            }
            Err(_) => {
                warn!("backup fetch timed out");
                BackupOutcome::failed(BackupError::Remote(RemoteError::Timeout))
            }
        }
    }

    /// Archive an already-fetched snapshot
    pub fn archive_snapshot(&self, snapshot: &RemoteSnapshot, reason: &str) -> BackupOutcome {
        let record = BackupRecord {
            timestamp: Utc::now(),
            version: BACKUP_VERSION,
            data: snapshot.clone(),
            metadata: BackupMetadata {
                total_tasks: snapshot.tasks.len(),
                total_projects: snapshot.projects.len(),
                backup_reason: reason.to_string(),
                plugin_version: self.plugin_version.clone(),
            },
        };

        match self.write_record(&record) {
            Ok(path) => {
                info!(file = %path.display(), tasks = snapshot.tasks.len(), "backup created");
                if let Err(e) = self.prune() {
                    warn!(error = %e, "could not prune old backups");
                }
                BackupOutcome {
                    success: true,
                    backup_file: Some(path),
                    error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "backup failed");
                BackupOutcome::failed(e)
            }
        }
    }

    fn write_record(&self, record: &BackupRecord) -> Result<PathBuf, BackupError> {
        fs::create_dir_all(&self.dir).map_err(|e| self.io_err(&self.dir, e))?;
        let stamp = record.timestamp.format("%Y%m%dT%H%M%S%3fZ").to_string();
        let mut path = self.dir.join(format!("{}{}.json", FILE_PREFIX, stamp));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{}{}-{}.json", FILE_PREFIX, stamp, n));
            n += 1;
        }
        let text = serde_json::to_string_pretty(record)?;
        atomic_write(&path, text.as_bytes()).map_err(|e| self.io_err(&path, e))?;
        Ok(path)
    }

    /// All archives, newest first
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut backups: Vec<(SystemTime, BackupInfo)> = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| self.io_err(&self.dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| self.io_err(&self.dir, e))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let meta = entry.metadata().map_err(|e| self.io_err(&path, e))?;
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            backups.push((
                modified,
                BackupInfo {
                    path,
                    modified: DateTime::<Utc>::from(modified),
                    size: meta.len(),
                },
            ));
        }
        // Names embed the write time, so they break mtime ties
        backups.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| name_key(&b.1.path).cmp(&name_key(&a.1.path)))
        });
        Ok(backups.into_iter().map(|(_, info)| info).collect())
    }

    /// Delete archives beyond the retention count, oldest first
    pub fn prune(&self) -> Result<usize, BackupError> {
        let backups = self.list_backups()?;
        let mut removed = 0;
        for old in backups.iter().skip(self.retention) {
            fs::remove_file(&old.path).map_err(|e| self.io_err(&old.path, e))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Read and validate an archive. The shape is checked before the record
    /// is accepted.
    pub fn restore_from_backup(&self, path: &Path) -> Result<BackupRecord, BackupError> {
        let text = fs::read_to_string(path).map_err(|e| self.io_err(path, e))?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        validate_shape(&value)?;
        let record: BackupRecord = serde_json::from_value(value)?;
        info!(
            file = %path.display(),
            tasks = record.data.tasks.len(),
            reason = %record.metadata.backup_reason,
            "backup validated"
        );
        Ok(record)
    }

    fn io_err(&self, path: &Path, source: std::io::Error) -> BackupError {
        BackupError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// `(stamp, collision counter)` parsed from a backup file name
fn name_key(path: &Path) -> (String, u32) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = name
        .strip_prefix(FILE_PREFIX)
        .and_then(|s| s.strip_suffix(".json"))
        .unwrap_or(&name);
    match stem.rsplit_once('-') {
        Some((stamp, n)) if n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty() => {
            (stamp.to_string(), n.parse().unwrap_or(0))
        }
        _ => (stem.to_string(), 0),
    }
}

fn validate_shape(value: &serde_json::Value) -> Result<(), BackupError> {
    let obj = value
        .as_object()
        .ok_or_else(|| BackupError::InvalidShape("top level is not an object".into()))?;

    if !obj.get("timestamp").is_some_and(|v| v.is_string()) {
        return Err(BackupError::InvalidShape("missing timestamp".into()));
    }
    let version = obj
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| BackupError::InvalidShape("missing version".into()))?;
    if version == 0 || version > u64::from(BACKUP_VERSION) {
        return Err(BackupError::UnsupportedVersion(version));
    }

    let data = obj
        .get("data")
        .and_then(|v| v.as_object())
        .ok_or_else(|| BackupError::InvalidShape("missing data".into()))?;
    for key in ["tasks", "projects", "sections", "labels"] {
        if !data.get(key).is_some_and(|v| v.is_array()) {
            return Err(BackupError::InvalidShape(format!("data.{} is not an array", key)));
        }
    }

    if !obj.get("metadata").is_some_and(|v| v.is_object()) {
        return Err(BackupError::InvalidShape("missing metadata".into()));
    }
    Ok(())
}
