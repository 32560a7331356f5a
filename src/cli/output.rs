use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::io::audit::AuditEntry;
use crate::io::backup::BackupInfo;
use crate::model::mapping::TaskMapping;
use crate::ops::sync::SyncReport;
use crate::util::unicode::excerpt;

// ---------------------------------------------------------------------------
// JSON output structs
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusJson {
    pub mappings: usize,
    pub orphaned: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    pub backups: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_backup: Option<String>,
}

#[derive(Serialize)]
pub struct OrphanJson {
    pub task_id: String,
    pub document: String,
    pub line: usize,
    pub content: String,
}

#[derive(Serialize)]
pub struct CheckJson {
    pub orphaned: Vec<OrphanJson>,
    pub removed: usize,
}

pub fn orphan_to_json(mapping: &TaskMapping) -> OrphanJson {
    OrphanJson {
        task_id: mapping.task_id.clone(),
        document: mapping.document_path.clone(),
        line: mapping.line_number + 1,
        content: mapping.content.clone(),
    }
}

// ---------------------------------------------------------------------------
// Human-readable formatting
// ---------------------------------------------------------------------------

/// Summary printed after `tsync sync`
pub fn format_sync_report(report: &SyncReport) -> Vec<String> {
    let mut lines = Vec::new();
    let stats = &report.stats;
    lines.push(format!("sync {}", report.phase));
    lines.push(format!(
        "  {} tasks in {} projects, {} documents created, {} updated",
        stats.tasks_processed, stats.projects_processed, stats.files_created, stats.files_updated
    ));
    let changes = &report.changes;
    lines.push(format!(
        "  {} new, {} changed, {} unchanged, {} deleted ({:.0}% efficient, {} pass)",
        changes.new,
        changes.changed,
        changes.unchanged,
        changes.deleted,
        report.efficiency * 100.0,
        if report.incremental { "incremental" } else { "full" }
    ));

    if let Some(ref reverse) = report.reverse {
        lines.push(format!(
            "  pushed: {} completed, {} updated, {} created ({} conflicts)",
            reverse.completed, reverse.updated, reverse.created, reverse.conflicts
        ));
        if let Some(ref file) = reverse.backup_file {
            lines.push(format!("  backup: {}", file.display()));
        }
        if reverse.new_local_tasks > 0 {
            lines.push(format!(
                "  {} new local task line(s) not synced",
                reverse.new_local_tasks
            ));
        }
        if !reverse.skipped.is_empty() {
            lines.push("Skipped:".to_string());
            for s in &reverse.skipped {
                lines.push(format!("  {}", s));
            }
        }
    }

    if !report.manual.is_empty() {
        lines.push("Needs attention:".to_string());
        for conflict in &report.manual {
            lines.push(format!(
                "  {} {} \"{}\"",
                conflict.task_id,
                conflict.kind,
                excerpt(conflict.content())
            ));
        }
    }

    let errors: Vec<&str> = report.errors().collect();
    if !errors.is_empty() {
        lines.push("Errors:".to_string());
        for e in errors {
            lines.push(format!("  {}", e));
        }
    }
    lines
}

pub fn format_backup_line(backup: &BackupInfo) -> String {
    let name = backup
        .path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    format!(
        "{}  {}  {}",
        backup.modified.format("%Y-%m-%d %H:%M:%S"),
        format_size(backup.size),
        name
    )
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

pub fn format_audit_entry(entry: &AuditEntry) -> Vec<String> {
    let mut lines = vec![format!(
        "{} [{}] {}",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.category,
        entry.description
    )];
    for (key, value) in &entry.fields {
        lines.push(format!("  {}: {}", key, value));
    }
    lines
}
