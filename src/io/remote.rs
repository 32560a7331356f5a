use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::io::atomic_write;
use crate::model::remote::{RemoteMeta, RemoteSnapshot};
use crate::model::task::{Due, Priority, Task, TaskDuration};

/// Error type for remote service calls
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("remote service unavailable: {0}")]
    Unavailable(String),
    #[error("remote service is not ready")]
    NotReady,
    #[error("remote request timed out")]
    Timeout,
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("remote rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    /// Errors worth retrying on a later run
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Unavailable(_) | RemoteError::NotReady | RemoteError::Timeout
        )
    }
}

/// A single point in time by which a remote call must finish. Owned by the
/// caller and handed to the callee so it can stop paginating early.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: tokio::time::Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: tokio::time::Instant::now() + timeout,
        }
    }

    pub fn instant(&self) -> tokio::time::Instant {
        self.at
    }

    pub fn is_expired(&self) -> bool {
        tokio::time::Instant::now() >= self.at
    }
}

/// Remote-only fields a write must leave exactly as they were
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedFields {
    pub order: i64,
    pub meta: RemoteMeta,
}

impl PreservedFields {
    pub fn of(task: &Task) -> Self {
        PreservedFields {
            order: task.order,
            meta: task.meta.clone(),
        }
    }
}

/// The one field a remote update touches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldUpdate {
    Content(String),
    Priority(Priority),
    DueDate(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub field: FieldUpdate,
    pub preserve: PreservedFields,
}

/// Everything but the content of a task to create
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub description: String,
    pub priority: Priority,
    pub due_date: Option<NaiveDate>,
    pub duration: Option<TaskDuration>,
    pub labels: Vec<String>,
    pub project_id: String,
    pub section_id: Option<String>,
    pub parent_id: Option<String>,
}

/// The remote task service
#[async_trait]
pub trait RemoteTaskService: Send + Sync {
    async fn is_ready(&self) -> bool;
    /// Fetch every task (open and completed), project, section and label
    async fn fetch_all(&self, deadline: Deadline) -> Result<RemoteSnapshot, RemoteError>;
    async fn close(&self, id: &str) -> Result<(), RemoteError>;
    async fn create(&self, content: &str, opts: &CreateOptions) -> Result<Task, RemoteError>;
    async fn update(&self, id: &str, update: &TaskUpdate) -> Result<Task, RemoteError>;
}

/// A remote service backed by an in-memory snapshot, optionally persisted
/// to a JSON file after every mutation. Serves offline use and tests.
pub struct SnapshotRemote {
    state: Mutex<RemoteSnapshot>,
    path: Option<PathBuf>,
}

impl SnapshotRemote {
    pub fn in_memory(snapshot: RemoteSnapshot) -> Self {
        SnapshotRemote {
            state: Mutex::new(snapshot),
            path: None,
        }
    }

    /// Open a snapshot file. A missing file starts empty.
    pub fn open(path: &Path) -> Result<Self, RemoteError> {
        let snapshot = match fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                RemoteError::Unavailable(format!("could not parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RemoteSnapshot::default(),
            Err(e) => {
                return Err(RemoteError::Unavailable(format!(
                    "could not read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        Ok(SnapshotRemote {
            state: Mutex::new(snapshot),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn snapshot(&self) -> RemoteSnapshot {
        self.lock().clone()
    }

    /// Replace the whole remote state (used when restoring a backup)
    pub fn replace(&self, snapshot: RemoteSnapshot) -> Result<(), RemoteError> {
        let mut state = self.lock();
        *state = snapshot;
        self.persist(&state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteSnapshot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, snapshot: &RemoteSnapshot) -> Result<(), RemoteError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(snapshot)
            .map_err(|e| RemoteError::Rejected(e.to_string()))?;
        atomic_write(path, text.as_bytes())
            .map_err(|e| RemoteError::Unavailable(format!("{}: {}", path.display(), e)))
    }
}

#[async_trait]
impl RemoteTaskService for SnapshotRemote {
    async fn is_ready(&self) -> bool {
        true
    }

    async fn fetch_all(&self, deadline: Deadline) -> Result<RemoteSnapshot, RemoteError> {
        if deadline.is_expired() {
            return Err(RemoteError::Timeout);
        }
        Ok(self.snapshot())
    }

    async fn close(&self, id: &str) -> Result<(), RemoteError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        task.is_completed = true;
        self.persist(&state)
    }

    async fn create(&self, content: &str, opts: &CreateOptions) -> Result<Task, RemoteError> {
        let mut state = self.lock();
        let next_id = state
            .tasks
            .iter()
            .filter_map(|t| t.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let order = state
            .tasks
            .iter()
            .filter(|t| t.project_id == opts.project_id && t.parent_id == opts.parent_id)
            .map(|t| t.order)
            .max()
            .unwrap_or(0)
            + 1;

        let mut task = Task::new(&next_id.to_string(), content, &opts.project_id);
        task.description = opts.description.clone();
        task.priority = opts.priority;
        task.due = opts.due_date.map(Due::on);
        task.duration = opts.duration;
        task.labels = opts.labels.clone();
        task.section_id = opts.section_id.clone();
        task.parent_id = opts.parent_id.clone();
        task.order = order;
        task.meta.created_at = Some(Utc::now());

        state.tasks.push(task.clone());
        self.persist(&state)?;
        Ok(task)
    }

    async fn update(&self, id: &str, update: &TaskUpdate) -> Result<Task, RemoteError> {
        let mut state = self.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        if PreservedFields::of(task) != update.preserve {
            return Err(RemoteError::Rejected(format!(
                "remote-only fields of task {} changed since the update was planned",
                id
            )));
        }
        if matches!(update.field, FieldUpdate::DueDate(_)) && task.is_recurring() {
            return Err(RemoteError::Rejected(format!(
                "task {} is recurring; its due date is owned by the rule",
                id
            )));
        }
        match &update.field {
            FieldUpdate::Content(content) => task.content = content.clone(),
            FieldUpdate::Priority(priority) => task.priority = *priority,
            FieldUpdate::DueDate(date) => match task.due.as_mut() {
                Some(due) => {
                    due.date = *date;
                    due.datetime = None;
                }
                None => task.due = Some(Due::on(*date)),
            },
        }
        let updated = task.clone();
        self.persist(&state)?;
        Ok(updated)
    }
}
