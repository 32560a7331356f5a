//! Turns local edits into remote operations that cannot clobber fields the
//! task line doesn't carry.
//!
//! Without a backup from this run only user completions pass; everything
//! else is refused with [`RejectReason::NoBackup`].

use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;

use crate::io::remote::{FieldUpdate, PreservedFields, TaskUpdate};
use crate::model::task::{Priority, Task};
use crate::ops::conflict::is_significant_content_change;

/// Formatting the task line can't reproduce: bold, italic, links,
/// mentions and inline code.
static RICH_FORMATTING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\*\*[^*]+\*\*)|(__[^_]+__)|(\*[^*\s][^*]*\*)|(\b_[^_\s][^_]*_\b)|(\[[^\]]+\]\([^)]+\))|((^|\s)@\w+)|(`[^`]+`)",
    )
    .unwrap()
});

pub fn has_rich_formatting(content: &str) -> bool {
    RICH_FORMATTING.is_match(content)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The user ticked the checkbox
    UserCompletion,
    /// The user deleted the line
    Removal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Operation {
    Complete { reason: CloseReason },
    UpdateContent { content: String },
    UpdatePriority { priority: Priority },
    UpdateDueDate { date: NaiveDate },
}

impl Operation {
    /// The remote update this operation performs; None for a close
    pub fn field_update(&self) -> Option<FieldUpdate> {
        match self {
            Operation::Complete { .. } => None,
            Operation::UpdateContent { content } => Some(FieldUpdate::Content(content.clone())),
            Operation::UpdatePriority { priority } => Some(FieldUpdate::Priority(*priority)),
            Operation::UpdateDueDate { date } => Some(FieldUpdate::DueDate(*date)),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Operation::Complete { .. } => "complete",
            Operation::UpdateContent { .. } => "update content",
            Operation::UpdatePriority { .. } => "update priority",
            Operation::UpdateDueDate { .. } => "update due date",
        }
    }
}

/// An operation cleared for the remote, with the remote-only fields the
/// write must leave as they are
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeOperation {
    pub task_id: String,
    pub op: Operation,
    pub preserve: PreservedFields,
}

impl SafeOperation {
    pub fn update(&self) -> Option<TaskUpdate> {
        self.op.field_update().map(|field| TaskUpdate {
            field,
            preserve: self.preserve.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoBackup,
    AlreadyComplete,
    InsignificantContent,
    RichFormatting,
    NotHigherPriority,
    NotEarlierDate,
    Recurring,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::NoBackup => "no backup this run; only completions are pushed",
            RejectReason::AlreadyComplete => "already complete remotely",
            RejectReason::InsignificantContent => "content change is formatting noise",
            RejectReason::RichFormatting => "remote content has formatting the line can't carry",
            RejectReason::NotHigherPriority => "priority is only ever raised",
            RejectReason::NotEarlierDate => "due date is only ever added or moved earlier",
            RejectReason::Recurring => "due date of a recurring task belongs to its rule",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOperation {
    pub task_id: String,
    pub op: Operation,
    pub reason: RejectReason,
}

impl fmt::Display for RejectedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}: {} skipped: {}", self.task_id, self.op.name(), self.reason)
    }
}

#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub accepted: Vec<SafeOperation>,
    pub rejected: Vec<RejectedOperation>,
}

#[derive(Debug, Clone, Copy)]
pub struct SafeWriteFilter {
    backup_available: bool,
}

impl SafeWriteFilter {
    pub fn new(backup_available: bool) -> Self {
        SafeWriteFilter { backup_available }
    }

    /// Whether non-completion writes are allowed at all
    pub fn backup_available(&self) -> bool {
        self.backup_available
    }

    pub fn filter<'a>(
        &self,
        proposals: impl IntoIterator<Item = (&'a Task, Operation)>,
    ) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for (remote, op) in proposals {
            match self.check(remote, op) {
                Ok(safe) => outcome.accepted.push(safe),
                Err(rejected) => outcome.rejected.push(rejected),
            }
        }
        outcome
    }

    /// Accept or reject one operation against the current remote task
    pub fn check(&self, remote: &Task, op: Operation) -> Result<SafeOperation, RejectedOperation> {
        match self.rejection(remote, &op) {
            None => Ok(SafeOperation {
                task_id: remote.id.clone(),
                op,
                preserve: PreservedFields::of(remote),
            }),
            Some(reason) => Err(RejectedOperation {
                task_id: remote.id.clone(),
                op,
                reason,
            }),
        }
    }

    fn rejection(&self, remote: &Task, op: &Operation) -> Option<RejectReason> {
        if let Operation::Complete { reason } = op {
            if remote.is_completed {
                return Some(RejectReason::AlreadyComplete);
            }
            if *reason == CloseReason::Removal && !self.backup_available {
                return Some(RejectReason::NoBackup);
            }
            return None;
        }
        if !self.backup_available {
            return Some(RejectReason::NoBackup);
        }
        match op {
            Operation::Complete { .. } => None,
            Operation::UpdateContent { content } => {
                if !is_significant_content_change(content, &remote.content) {
                    Some(RejectReason::InsignificantContent)
                } else if has_rich_formatting(&remote.content) {
                    Some(RejectReason::RichFormatting)
                } else {
                    None
                }
            }
            Operation::UpdatePriority { priority } => {
                (*priority <= remote.priority).then_some(RejectReason::NotHigherPriority)
            }
            Operation::UpdateDueDate { date } => {
                if remote.is_recurring() {
                    Some(RejectReason::Recurring)
                } else if remote.due_date().is_some_and(|current| *date >= current) {
                    Some(RejectReason::NotEarlierDate)
                } else {
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::remote::RecurrenceInternals;
    use crate::model::task::Due;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn shared_task() -> Task {
        let mut t = Task::new("1", "Review budget", "p1");
        t.priority = Priority::new(2).unwrap();
        t.due = Some(Due::on(date(2024, 6, 10)));
        t.order = 4;
        t.meta.assignee_id = Some("u2".into());
        t.meta.collaborator_ids = vec!["u1".into(), "u2".into()];
        t.meta.label_ids = vec!["l9".into()];
        t
    }

    #[test]
    fn rich_formatting_detection() {
        for rich in [
            "Review **budget**",
            "Read *the* memo",
            "See [doc](https://example.com)",
            "Ask @alice",
            "Run `cargo fmt`",
            "Say __hi__ now",
        ] {
            assert!(has_rich_formatting(rich), "{}", rich);
        }
        for plain in ["Review budget", "3 * 4 = 12", "email me at a@b.com", "snake_case_name"] {
            assert!(!has_rich_formatting(plain), "{}", plain);
        }
    }

    #[test]
    fn accepted_operations_carry_remote_only_fields() {
        let remote = shared_task();
        let filter = SafeWriteFilter::new(true);
        let outcome = filter.filter([
            (&remote, Operation::Complete {
                reason: CloseReason::UserCompletion,
            }),
            (&remote, Operation::UpdateContent {
                content: "Approve the new hiring plan".into(),
            }),
            (&remote, Operation::UpdatePriority {
                priority: Priority::URGENT,
            }),
            (&remote, Operation::UpdateDueDate {
                date: date(2024, 6, 1),
            }),
        ]);
        assert_eq!(outcome.accepted.len(), 4);
        assert!(outcome.rejected.is_empty());
        for op in &outcome.accepted {
            assert_eq!(op.preserve.meta, remote.meta);
            assert_eq!(op.preserve.order, 4);
        }
        assert!(outcome.accepted[0].update().is_none());
        assert_eq!(
            outcome.accepted[2].update().map(|u| u.field),
            Some(FieldUpdate::Priority(Priority::URGENT))
        );
    }

    #[test]
    fn downgrades_and_noise_are_rejected() {
        let remote = shared_task();
        let filter = SafeWriteFilter::new(true);
        let reasons: Vec<RejectReason> = filter
            .filter([
                (&remote, Operation::UpdateContent {
                    content: "Review budget!".into(),
                }),
                (&remote, Operation::UpdatePriority {
                    priority: Priority::DEFAULT,
                }),
                (&remote, Operation::UpdatePriority {
                    priority: Priority::new(2).unwrap(),
                }),
                (&remote, Operation::UpdateDueDate {
                    date: date(2024, 7, 1),
                }),
            ])
            .rejected
            .into_iter()
            .map(|r| r.reason)
            .collect();
        assert_eq!(
            reasons,
            vec![
                RejectReason::InsignificantContent,
                RejectReason::NotHigherPriority,
                RejectReason::NotHigherPriority,
                RejectReason::NotEarlierDate,
            ]
        );
    }

    #[test]
    fn rich_remote_content_is_not_overwritten() {
        let mut remote = shared_task();
        remote.content = "Review **Q3** budget with @carol".into();
        let result = SafeWriteFilter::new(true).check(
            &remote,
            Operation::UpdateContent {
                content: "Skip the budget review".into(),
            },
        );
        assert_eq!(result.unwrap_err().reason, RejectReason::RichFormatting);
    }

    #[test]
    fn recurring_due_dates_are_never_moved() {
        let mut remote = shared_task();
        remote.meta.recurrence = Some(RecurrenceInternals {
            string: "every monday".into(),
            is_recurring: true,
            ..Default::default()
        });
        let result = SafeWriteFilter::new(true).check(
            &remote,
            Operation::UpdateDueDate {
                date: date(2024, 5, 1),
            },
        );
        assert_eq!(result.unwrap_err().reason, RejectReason::Recurring);
    }

    #[test]
    fn adding_a_missing_date_is_allowed() {
        let mut remote = shared_task();
        remote.due = None;
        let result = SafeWriteFilter::new(true).check(
            &remote,
            Operation::UpdateDueDate {
                date: date(2024, 9, 1),
            },
        );
        assert!(result.is_ok());
    }

    #[test]
    fn without_backup_only_completion_passes() {
        let remote = shared_task();
        let filter = SafeWriteFilter::new(false);
        let outcome = filter.filter([
            (&remote, Operation::Complete {
                reason: CloseReason::UserCompletion,
            }),
            (&remote, Operation::Complete {
                reason: CloseReason::Removal,
            }),
            (&remote, Operation::UpdatePriority {
                priority: Priority::URGENT,
            }),
        ]);
        assert_eq!(outcome.accepted.len(), 1);
        assert!(matches!(outcome.accepted[0].op, Operation::Complete { .. }));
        assert!(
            outcome
                .rejected
                .iter()
                .all(|r| r.reason == RejectReason::NoBackup)
        );
    }

    #[test]
    fn completing_a_closed_task_is_rejected() {
        let mut remote = shared_task();
        remote.is_completed = true;
        let result = SafeWriteFilter::new(true).check(
            &remote,
            Operation::Complete {
                reason: CloseReason::UserCompletion,
            },
        );
        assert_eq!(result.unwrap_err().reason, RejectReason::AlreadyComplete);
    }
}
