use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::io::audit::{AuditCategory, AuditEntry, log_audit};
use crate::model::task::{Task, TaskView};
use crate::util::unicode::excerpt;

/// Relative change below which two contents count as the same text
pub const CONTENT_NOISE_THRESHOLD: f64 = 0.10;

/// A field both sides can edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Completion,
    Content,
    Priority,
    DueDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum ConflictKind {
    ContentModified,
    CompletionStatus,
    BothModified { field: Field },
    PriorityChanged,
    DueDateChanged,
    DeletedRemote,
    DeletedLocal,
}

impl ConflictKind {
    fn label(&self) -> &'static str {
        match self {
            ConflictKind::ContentModified => "CONTENT_MODIFIED",
            ConflictKind::CompletionStatus => "COMPLETION_STATUS",
            ConflictKind::BothModified { .. } => "BOTH_MODIFIED",
            ConflictKind::PriorityChanged => "PRIORITY_CHANGED",
            ConflictKind::DueDateChanged => "DUE_DATE_CHANGED",
            ConflictKind::DeletedRemote => "DELETED_REMOTE",
            ConflictKind::DeletedLocal => "DELETED_LOCAL",
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::BothModified { field } => write!(f, "{} ({:?})", self.label(), field),
            _ => f.write_str(self.label()),
        }
    }
}

/// Two versions of one task that disagree. Lives for a single run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub task_id: String,
    /// The local line, None when it was removed
    pub local: Option<TaskView>,
    /// The remote task, None when it was deleted remotely
    pub remote: Option<Task>,
    pub kind: ConflictKind,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(
        task_id: &str,
        local: Option<TaskView>,
        remote: Option<Task>,
        kind: ConflictKind,
    ) -> Self {
        Conflict {
            task_id: task_id.to_string(),
            local,
            remote,
            kind,
            detected_at: Utc::now(),
        }
    }

    /// The local content, or the remote one when the line is gone
    pub fn content(&self) -> &str {
        self.local
            .as_ref()
            .map(|l| l.content.as_str())
            .or(self.remote.as_ref().map(|r| r.content.as_str()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedConflict {
    pub conflict: Conflict,
    pub winner: Side,
    pub reason: &'static str,
}

#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    pub resolved: Vec<ResolvedConflict>,
    /// Needs a human; re-evaluated next run
    pub manual: Vec<Conflict>,
    pub errors: Vec<String>,
}

/// Whether two contents differ by more than formatting noise: characters
/// outside the common prefix and suffix, over the longer length. One being
/// a substring of the other is noise.
pub fn is_significant_content_change(a: &str, b: &str) -> bool {
    let a = a.split_whitespace().collect::<Vec<_>>().join(" ");
    let b = b.split_whitespace().collect::<Vec<_>>().join(" ");
    if a == b || a.contains(&b) || b.contains(&a) {
        return false;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let differing = longest - prefix - suffix;
    differing as f64 / longest as f64 >= CONTENT_NOISE_THRESHOLD
}

/// Whether a field differs beyond noise
fn differs(field: Field, a: &TaskView, b: &TaskView) -> bool {
    match field {
        Field::Completion => a.completed != b.completed,
        Field::Content => is_significant_content_change(&a.content, &b.content),
        Field::Priority => {
            !(a.priority.is_default() && b.priority.is_default()) && a.priority != b.priority
        }
        Field::DueDate => a.due_date != b.due_date,
    }
}

fn kind_for(field: Field) -> ConflictKind {
    match field {
        Field::Completion => ConflictKind::CompletionStatus,
        Field::Content => ConflictKind::ContentModified,
        Field::Priority => ConflictKind::PriorityChanged,
        Field::DueDate => ConflictKind::DueDateChanged,
    }
}

const FIELDS: [Field; 4] = [
    Field::Completion,
    Field::Content,
    Field::Priority,
    Field::DueDate,
];

/// Every conflict between a local line and the remote task.
///
/// With a `baseline` (the line as last written), a field only conflicts if
/// the local side moved it; if both sides moved it, that is BOTH_MODIFIED.
/// Without one, every difference is a local edit.
pub fn classify_all(
    local: &TaskView,
    remote: &Task,
    baseline: Option<&TaskView>,
) -> Vec<ConflictKind> {
    let remote_view = remote.view();
    FIELDS
        .iter()
        .filter(|&&field| differs(field, local, &remote_view))
        .filter_map(|&field| {
            let Some(base) = baseline else {
                return Some(kind_for(field));
            };
            let local_moved = differs(field, base, local);
            let remote_moved = differs(field, base, &remote_view);
            match (local_moved, remote_moved) {
                (true, true) => Some(ConflictKind::BothModified { field }),
                (true, false) => Some(kind_for(field)),
                // Remote-only edits are ordinary forward sync
                (false, _) => None,
            }
        })
        .collect()
}

/// The first conflict between two versions, if any
pub fn classify(local: &TaskView, remote: &Task) -> Option<ConflictKind> {
    classify_all(local, remote, None).into_iter().next()
}

/// Applies the fixed precedence table to conflicts and logs every outcome
#[derive(Debug, Default)]
pub struct ConflictResolver {
    audit_dir: Option<PathBuf>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also append every outcome to the audit log in `state_dir`
    pub fn with_audit(state_dir: PathBuf) -> Self {
        ConflictResolver {
            audit_dir: Some(state_dir),
        }
    }

    pub fn resolve_conflicts(&self, conflicts: Vec<Conflict>) -> ResolutionOutcome {
        let mut outcome = ResolutionOutcome::default();
        for conflict in conflicts {
            match decide(&conflict) {
                Ok(Some((winner, reason))) => {
                    self.record_resolution(&conflict, winner, reason);
                    outcome.resolved.push(ResolvedConflict {
                        conflict,
                        winner,
                        reason,
                    });
                }
                Ok(None) => {
                    self.record_manual(&conflict);
                    outcome.manual.push(conflict);
                }
                Err(e) => outcome
                    .errors
                    .push(format!("task {}: {}", conflict.task_id, e)),
            }
        }
        outcome
    }

    fn record_resolution(&self, conflict: &Conflict, winner: Side, reason: &str) {
        let excerpt = excerpt(conflict.content());
        info!(
            task_id = %conflict.task_id,
            kind = %conflict.kind,
            winner = ?winner,
            excerpt = %excerpt,
            "conflict resolved"
        );
        if let Some(ref dir) = self.audit_dir {
            log_audit(
                dir,
                AuditEntry::new(AuditCategory::Resolution, reason)
                    .field("Task", &conflict.task_id)
                    .field("Kind", conflict.kind)
                    .field("Winner", format!("{:?}", winner).to_lowercase())
                    .field("Excerpt", excerpt),
            );
        }
    }

    fn record_manual(&self, conflict: &Conflict) {
        let excerpt = excerpt(conflict.content());
        info!(
            task_id = %conflict.task_id,
            kind = %conflict.kind,
            excerpt = %excerpt,
            "conflict needs manual resolution"
        );
        if let Some(ref dir) = self.audit_dir {
            log_audit(
                dir,
                AuditEntry::new(AuditCategory::Manual, "both sides changed the same field")
                    .field("Task", &conflict.task_id)
                    .field("Kind", conflict.kind)
                    .field("Excerpt", excerpt),
            );
        }
    }
}

/// `Ok(None)` means manual
fn decide(conflict: &Conflict) -> Result<Option<(Side, &'static str)>, &'static str> {
    let both = conflict.local.as_ref().zip(conflict.remote.as_ref());
    let decision = match conflict.kind {
        ConflictKind::BothModified { .. } => return Ok(None),
        ConflictKind::DeletedRemote => {
            if conflict.local.is_none() {
                return Err("deleted remotely but no local line to recreate from");
            }
            (Side::Local, "recreate remotely from the local line")
        }
        ConflictKind::DeletedLocal => {
            if conflict.remote.is_none() {
                return Err("removed locally but no remote task to close");
            }
            (Side::Local, "local removal closes the remote task")
        }
        ConflictKind::CompletionStatus => {
            let (local, _) = both.ok_or("completion conflict without both sides")?;
            if local.completed {
                (Side::Local, "local completion wins")
            } else {
                (Side::Remote, "reopening a completed task is left to the remote")
            }
        }
        ConflictKind::ContentModified => {
            both.ok_or("content conflict without both sides")?;
            (Side::Local, "local content wins")
        }
        ConflictKind::PriorityChanged => {
            let (local, remote) = both.ok_or("priority conflict without both sides")?;
            if local.priority > remote.priority {
                (Side::Local, "higher priority wins")
            } else {
                (Side::Remote, "higher priority wins")
            }
        }
        ConflictKind::DueDateChanged => {
            let (local, remote) = both.ok_or("due date conflict without both sides")?;
            match (local.due_date, remote.due_date()) {
                (Some(l), Some(r)) if l < r => (Side::Local, "earlier due date wins"),
                (Some(_), None) => (Side::Local, "due date added locally"),
                (None, Some(_)) => (Side::Remote, "due date added remotely"),
                _ => (Side::Remote, "earlier due date wins"),
            }
        }
    };
    Ok(Some(decision))
}
