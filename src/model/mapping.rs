use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::task::TaskView;

/// Current version of the persisted mapping record
pub const MAPPING_VERSION: u32 = 1;

/// Where a synced task lives in the document corpus, and what it looked
/// like the last time both sides agreed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMapping {
    pub task_id: String,
    pub document_path: String,
    /// 0-indexed line of the task's checkbox
    pub line_number: usize,
    /// Content at last sync
    pub content: String,
    pub last_sync_time: DateTime<Utc>,
    /// Snapshot hash at last sync
    pub checksum: String,
    /// Text-visible fields as last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<TaskView>,
}

/// The mapping file on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRecord {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub mappings: Vec<TaskMapping>,
}
