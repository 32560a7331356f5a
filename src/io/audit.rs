use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::io::atomic_write;

/// Default number of days before entries are prunable.
pub const PRUNE_AGE_DAYS: i64 = 30;

/// Written at the top of a new audit log.
const FILE_HEADER: &str = "\
<!-- tasksync audit log: append-only record of sync decisions.
     View with: tsync log
     Prune old entries: tsync log --prune-days 30 -->

---
";

/// Category of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditCategory {
    /// A conflict was resolved automatically
    Resolution,
    /// A conflict needs a human
    Manual,
    /// A planned remote edit was refused
    Rejected,
    /// A remote operation failed
    Failure,
    Backup,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::Resolution => write!(f, "resolution"),
            AuditCategory::Manual => write!(f, "manual"),
            AuditCategory::Rejected => write!(f, "rejected"),
            AuditCategory::Failure => write!(f, "failure"),
            AuditCategory::Backup => write!(f, "backup"),
        }
    }
}

impl AuditCategory {
    pub fn parse_category(s: &str) -> Option<Self> {
        match s {
            "resolution" => Some(AuditCategory::Resolution),
            "manual" => Some(AuditCategory::Manual),
            "rejected" => Some(AuditCategory::Rejected),
            "failure" => Some(AuditCategory::Failure),
            "backup" => Some(AuditCategory::Backup),
            _ => None,
        }
    }
}

/// A single entry in the audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    pub description: String,
    pub fields: Vec<(String, String)>,
}

impl AuditEntry {
    pub fn new(category: AuditCategory, description: impl Into<String>) -> Self {
        AuditEntry {
            timestamp: Utc::now(),
            category,
            description: description.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.push((key.to_string(), value.to_string()));
        self
    }

    fn to_markdown(&self) -> String {
        let mut out = format!(
            "## {} {}: {}\n\n",
            self.timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.category,
            self.description,
        );
        for (key, value) in &self.fields {
            out.push_str(&format!("{}: {}\n", key, value));
        }
        out.push_str("\n---\n");
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        let fields: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();

        serde_json::json!({
            "timestamp": self.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "category": self.category.to_string(),
            "description": self.description,
            "fields": fields,
        })
    }
}

pub fn audit_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("audit.log")
}

/// Append an entry to the audit log. Failures are logged and otherwise ignored.
pub fn log_audit(state_dir: &Path, entry: AuditEntry) {
    if let Err(e) = append_entry(state_dir, &entry) {
        warn!(error = %e, "could not write to audit log");
    }
}

fn append_entry(state_dir: &Path, entry: &AuditEntry) -> io::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = audit_log_path(state_dir);
    let needs_header = std::fs::metadata(&path).map_or(true, |m| m.len() == 0);

    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    if needs_header {
        file.write_all(FILE_HEADER.as_bytes())?;
    }
    file.write_all(entry.to_markdown().as_bytes())
}

/// Read entries, most recent first.
pub fn read_audit_entries(
    state_dir: &Path,
    limit: Option<usize>,
    since: Option<DateTime<Utc>>,
) -> Vec<AuditEntry> {
    let Ok(content) = std::fs::read_to_string(audit_log_path(state_dir)) else {
        return Vec::new();
    };

    let mut entries = parse_entries(&content);
    if let Some(since) = since {
        entries.retain(|e| e.timestamp >= since);
    }
    entries.reverse();
    if let Some(n) = limit {
        entries.truncate(n);
    }
    entries
}

fn parse_entries(content: &str) -> Vec<AuditEntry> {
    let mut entries = Vec::new();
    let mut current: Option<AuditEntry> = None;

    for line in content.lines() {
        if let Some(header) = line.strip_prefix("## ") {
            entries.extend(current.take());
            current = parse_entry_header(header);
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if line == "---" {
            entries.extend(current.take());
            continue;
        }
        if let Some((key, value)) = line.trim().split_once(": ") {
            entry.fields.push((key.to_string(), value.to_string()));
        }
    }
    entries.extend(current);
    entries
}

/// `<timestamp> <category>: <description>`
fn parse_entry_header(header: &str) -> Option<AuditEntry> {
    let (stamp, rest) = header.split_once(' ')?;
    let timestamp = DateTime::parse_from_rfc3339(stamp).ok()?.with_timezone(&Utc);
    let (category, description) = rest.split_once(": ")?;
    Some(AuditEntry {
        timestamp,
        category: AuditCategory::parse_category(category)?,
        description: description.to_string(),
        fields: Vec::new(),
    })
}

/// Drop entries older than `before`. Returns the number removed.
pub fn prune_audit(state_dir: &Path, before: DateTime<Utc>) -> io::Result<usize> {
    let path = audit_log_path(state_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let entries = parse_entries(&content);
    let kept: Vec<&AuditEntry> = entries.iter().filter(|e| e.timestamp >= before).collect();
    let removed = entries.len() - kept.len();
    if removed == 0 {
        return Ok(0);
    }

    let mut out = String::from(FILE_HEADER);
    for entry in kept {
        out.push_str(&entry.to_markdown());
    }
    atomic_write(&path, out.as_bytes())?;
    Ok(removed)
}
