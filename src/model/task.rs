use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::model::remote::RemoteMeta;

/// Task priority, 1 (no explicit priority) through 4 (most urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

/// Glyphs in the task line, highest priority first
const PRIORITY_GLYPHS: [(&str, u8); 4] = [("🔴", 4), ("🟠", 3), ("🔵", 2), ("⚪", 1)];

impl Priority {
    pub const DEFAULT: Priority = Priority(1);
    pub const URGENT: Priority = Priority(4);

    pub fn new(value: u8) -> Option<Priority> {
        (1..=4).contains(&value).then_some(Priority(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_default(self) -> bool {
        self == Priority::DEFAULT
    }

    /// The glyph rendered for this priority. The default priority renders nothing.
    pub fn glyph(self) -> Option<&'static str> {
        if self.is_default() {
            return None;
        }
        PRIORITY_GLYPHS
            .iter()
            .find(|(_, p)| *p == self.0)
            .map(|(g, _)| *g)
    }

    /// Parse a priority glyph (all four glyphs are accepted, including the default one)
    pub fn from_glyph(s: &str) -> Option<Priority> {
        PRIORITY_GLYPHS
            .iter()
            .find(|(g, _)| *g == s)
            .map(|(_, p)| Priority(*p))
    }

    pub fn glyphs() -> impl Iterator<Item = &'static str> {
        PRIORITY_GLYPHS.iter().map(|(g, _)| *g)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value).ok_or_else(|| format!("priority out of range: {}", value))
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

/// Due information. A present `recurrence` means the date is owned by the
/// recurrence rule and must not be moved by local edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Due {
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datetime: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
}

impl Due {
    pub fn on(date: NaiveDate) -> Self {
        Due {
            date,
            datetime: None,
            recurrence: None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Minute,
    Day,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskDuration {
    pub amount: u32,
    pub unit: DurationUnit,
}

impl TaskDuration {
    pub fn minutes(amount: u32) -> Self {
        TaskDuration {
            amount,
            unit: DurationUnit::Minute,
        }
    }

    pub fn days(amount: u32) -> Self {
        TaskDuration {
            amount,
            unit: DurationUnit::Day,
        }
    }
}

/// A task as owned by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<Due>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<TaskDuration>,
    /// Label names, unique
    #[serde(default)]
    pub labels: Vec<String>,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub is_completed: bool,
    /// Fields the text format cannot carry
    #[serde(default)]
    pub meta: RemoteMeta,
}

impl Task {
    pub fn new(id: &str, content: &str, project_id: &str) -> Self {
        Task {
            id: id.to_string(),
            content: content.to_string(),
            description: String::new(),
            priority: Priority::DEFAULT,
            due: None,
            duration: None,
            labels: Vec::new(),
            project_id: project_id.to_string(),
            section_id: None,
            parent_id: None,
            order: 0,
            is_completed: false,
            meta: RemoteMeta::default(),
        }
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due.as_ref().map(|d| d.date)
    }

    pub fn recurrence(&self) -> Option<&str> {
        self.due.as_ref().and_then(|d| d.recurrence.as_deref())
    }

    pub fn is_recurring(&self) -> bool {
        self.due.as_ref().is_some_and(Due::is_recurring)
            || self.meta.recurrence.as_ref().is_some_and(|r| r.is_recurring)
    }

    /// The fields of this task that survive a trip through a task line
    pub fn view(&self) -> TaskView {
        TaskView {
            completed: self.is_completed,
            content: self.content.clone(),
            description: self.description.clone(),
            priority: self.priority,
            due_date: self.due_date(),
            recurrence: self.recurrence().map(str::to_string),
            duration: self.duration,
            labels: self.labels.iter().map(|l| label_token(l)).collect(),
        }
    }
}

/// The text-visible fields of a task: what a task line can express.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub completed: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<TaskDuration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

/// A task line found in a local document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTask {
    /// Remote id from the marker comment, None for lines typed by hand
    pub id: Option<String>,
    /// Hash recorded in the marker comment
    pub hash: Option<String>,
    pub view: TaskView,
    /// 0-indexed line of the checkbox
    pub line: usize,
    pub indent: usize,
    /// Exclusive end of the task line plus its description block
    pub block_end: usize,
    /// Exclusive end including all nested children
    pub subtree_end: usize,
    /// Id of the enclosing task line, if nested under one that has an id
    pub parent_id: Option<String>,
}

/// Label names become `#tokens`; whitespace can't survive that
pub fn label_token(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}
