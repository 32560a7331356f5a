//! Snapshot hash used to tell whether a task changed since it was last
//! written into a document.
//!
//! The digest is SHA-256 over canonical JSON of a versioned input, truncated
//! to 8 bytes. Only determinism and field sensitivity are promised; bump
//! [`HASH_VERSION`] whenever the input shape changes.

use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::task::{Task, TaskDuration};

pub const HASH_VERSION: u32 = 1;

#[derive(Serialize)]
struct HashInput<'a> {
    v: u32,
    content: String,
    description: String,
    priority: u8,
    due_date: Option<NaiveDate>,
    duration: Option<&'a TaskDuration>,
    recurring: bool,
    labels: Vec<String>,
    project_id: &'a str,
    section_id: Option<&'a str>,
    order: i64,
}

/// Digest over the tracked fields of a task. Label order and whitespace
/// runs don't affect it.
pub fn snapshot_hash(task: &Task) -> String {
    let mut labels: Vec<String> = task.labels.iter().map(|l| normalize_whitespace(l)).collect();
    labels.sort();
    labels.dedup();

    let input = HashInput {
        v: HASH_VERSION,
        content: normalize_whitespace(&task.content),
        description: normalize_whitespace(&task.description),
        priority: task.priority.value(),
        due_date: task.due_date(),
        duration: task.duration.as_ref(),
        recurring: task.is_recurring(),
        labels,
        project_id: &task.project_id,
        section_id: task.section_id.as_deref(),
        order: task.order,
    };

    let canonical = serde_json::to_vec(&input).unwrap_or_default();
    let digest = Sha256::digest(&canonical);
    hex::encode(&digest[..8])
}

/// Collapse whitespace runs to a single space and trim the ends
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
