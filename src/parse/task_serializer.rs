use chrono::{Datelike, NaiveDate};

use crate::model::task::{Task, TaskView, label_token};
use crate::parse::duration::{DURATION_MARKER, format_duration};
use crate::parse::hash::snapshot_hash;
use crate::parse::recurrence::{RECURRENCE_MARKER, format_recurrence};
use crate::parse::task_parser::{parse_tasks, parse_title_and_tags, reads_as_token};

pub const DATE_MARKER: &str = "📅";
pub const OVERDUE_MARKER: &str = "⚠️";

/// Serialize a single task line:
/// `- [ ] Content ⏱ 30m 🔁 every day 🔴 📅 5/26/2024 #label <!-- id:ID:HASH -->`
/// `today` decides whether the date renders as overdue.
pub fn format_task_line(task: &Task, indent: usize, today: NaiveDate) -> String {
    let mut line = format!(
        "{}- [{}] {}",
        " ".repeat(indent),
        if task.is_completed { 'x' } else { ' ' },
        escape_content(&single_line(&task.content))
    );

    if let Some(ref duration) = task.duration {
        line.push_str(&format!(" {} {}", DURATION_MARKER, format_duration(duration)));
    }

    if let Some(rule) = task.recurrence() {
        line.push_str(&format!(" {} {}", RECURRENCE_MARKER, format_recurrence(rule)));
    }

    if let Some(glyph) = task.priority.glyph() {
        line.push(' ');
        line.push_str(glyph);
    }

    if let Some(date) = task.due_date() {
        let marker = if date < today { OVERDUE_MARKER } else { DATE_MARKER };
        line.push_str(&format!(" {} {}", marker, format_date(date)));
    }

    for label in &task.labels {
        line.push_str(&format!(" #{}", label_token(label)));
    }

    line.push(' ');
    line.push_str(&id_marker(&task.id, &snapshot_hash(task)));
    line
}

/// Serialize a task line followed by its description block
pub fn format_task_block(task: &Task, indent: usize, today: NaiveDate) -> Vec<String> {
    let mut lines = vec![format_task_line(task, indent, today)];
    let desc_indent = " ".repeat(indent + 2);
    let description = task.description.trim_end();
    if !description.trim().is_empty() {
        for desc_line in description.lines() {
            if desc_line.trim().is_empty() {
                lines.push(String::new());
            } else {
                lines.push(format!("{}{}", desc_indent, desc_line.trim_end()));
            }
        }
    }
    lines
}

/// Serialize a task, its description and, recursively, every task in `all`
/// whose parent it is. Children are ordered by `order`.
pub fn format_task_tree(task: &Task, all: &[Task], indent: usize, today: NaiveDate) -> Vec<String> {
    let mut lines = format_task_block(task, indent, today);
    let mut children: Vec<&Task> = all
        .iter()
        .filter(|t| t.parent_id.as_deref() == Some(task.id.as_str()))
        .collect();
    children.sort_by_key(|t| t.order);
    for child in children {
        lines.extend(format_task_tree(child, all, indent + 2, today));
    }
    lines
}

/// The view a task has once written out and read back. This is what a
/// later parse of the untouched line will produce.
pub fn written_view(task: &Task) -> TaskView {
    let lines = format_task_block(task, 0, NaiveDate::MIN);
    parse_tasks(&lines)
        .into_iter()
        .next()
        .map(|t| t.view)
        .unwrap_or_else(|| task.view())
}

/// `<!-- id:ID:HASH -->`
pub fn id_marker(id: &str, hash: &str) -> String {
    format!("<!-- id:{}:{} -->", id, hash)
}

/// `M/D/YYYY`, no zero padding
pub fn format_date(date: NaiveDate) -> String {
    format!("{}/{}/{}", date.month(), date.day(), date.year())
}

fn single_line(s: &str) -> String {
    s.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(" ")
}

/// Put a backslash in front of every content word the parser would read as
/// a token, as one of the trailing labels, or as an escape. Marker words are
/// escaped anywhere; a `#word` only in the trailing run, unless it already
/// starts with a backslash.
fn escape_content(content: &str) -> String {
    let (head, tags) = parse_title_and_tags(content);
    let label_run = if tags.is_empty() { content.len() } else { head.len() };
    let mut out = String::with_capacity(content.len());
    let mut word_start = true;
    for (i, c) in content.char_indices() {
        if word_start && reads_as_token(&content[i..]) {
            let rest = &content[i..];
            let hash_word = rest.trim_start_matches('\\').starts_with('#');
            if !hash_word || rest.starts_with('\\') || i >= label_run {
                out.push('\\');
            }
        }
        out.push(c);
        word_start = c.is_whitespace();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::{Due, Priority, TaskDuration};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn serialize_minimal_task() {
        let task = Task::new("7", "Fix parser crash", "p1");
        let line = format_task_line(&task, 0, date(2024, 1, 1));
        assert_eq!(
            line,
            format!("- [ ] Fix parser crash <!-- id:7:{} -->", snapshot_hash(&task))
        );
    }

    #[test]
    fn serialize_groceries_example() {
        let mut task = Task::new("1", "Buy groceries", "p1");
        task.priority = Priority::URGENT;
        task.due = Some(Due::on(date(2024, 5, 26)));
        task.labels = vec!["urgent".to_string()];
        let line = format_task_line(&task, 0, date(2024, 5, 1));
        assert_eq!(
            line,
            format!(
                "- [ ] Buy groceries 🔴 📅 5/26/2024 #urgent <!-- id:1:{} -->",
                snapshot_hash(&task)
            )
        );
    }

    #[test]
    fn serialize_all_tokens_in_order() {
        let mut task = Task::new("9", "Water plants", "p1");
        task.duration = Some(TaskDuration::minutes(90));
        let mut due = Due::on(date(2024, 6, 1));
        due.recurrence = Some("every 2 weeks".to_string());
        task.due = Some(due);
        task.priority = Priority::new(2).unwrap();
        task.labels = vec!["home".to_string(), "garden work".to_string()];
        task.is_completed = true;
        let line = format_task_line(&task, 2, date(2024, 1, 1));
        assert!(line.starts_with(
            "  - [x] Water plants ⏱ 1h30m 🔁 every 2 weeks 🔵 📅 6/1/2024 #home #garden_work <!-- id:9:"
        ));
    }

    #[test]
    fn overdue_date_uses_warning_marker() {
        let mut task = Task::new("1", "Pay rent", "p1");
        task.due = Some(Due::on(date(2024, 5, 1)));
        let line = format_task_line(&task, 0, date(2024, 5, 2));
        assert!(line.contains("⚠️ 5/1/2024"));
        let line = format_task_line(&task, 0, date(2024, 5, 1));
        assert!(line.contains("📅 5/1/2024"));
    }

    #[test]
    fn description_block_is_indented() {
        let mut task = Task::new("1", "Plan trip", "p1");
        task.description = "Book flights\n\nCheck visas".to_string();
        let lines = format_task_block(&task, 0, date(2024, 1, 1));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "  Book flights");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "  Check visas");
    }

    #[test]
    fn tree_nests_children_by_order() {
        let parent = Task::new("1", "Parent", "p1");
        let mut second = Task::new("3", "Second", "p1");
        second.parent_id = Some("1".to_string());
        second.order = 2;
        let mut first = Task::new("2", "First", "p1");
        first.parent_id = Some("1".to_string());
        first.order = 1;
        let all = vec![parent.clone(), second, first];
        let lines = format_task_tree(&parent, &all, 0, date(2024, 1, 1));
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("  - [ ] First"));
        assert!(lines[2].starts_with("  - [ ] Second"));
    }

    #[test]
    fn content_that_looks_like_tokens_is_escaped() {
        let mut task = Task::new("1", "Fix issue #42", "p1");
        task.labels = vec!["bug".to_string()];
        let line = format_task_line(&task, 0, date(2024, 1, 1));
        assert!(line.starts_with(r"- [ ] Fix issue \#42 #bug <!-- id:1:"), "{}", line);

        let task = Task::new("2", "Fire 🔴 drill #3 today", "p1");
        let line = format_task_line(&task, 0, date(2024, 1, 1));
        assert!(line.starts_with(r"- [ ] Fire \🔴 drill #3 today <!--"), "{}", line);
    }

    #[test]
    fn content_survives_the_line_unchanged() {
        let contents = [
            "Fix issue #42",
            "Fire 🔴 drill",
            "Read 📅 notes",
            "Time ⏱ it and 🔁 repeat",
            "⚠️ Check the alarm",
            "Tag #a #b",
            r"Keep \#literal",
            r"Copy C:\temp and \\🔵 too",
            "#42 first",
        ];
        for content in contents {
            let mut task = Task::new("5", content, "p1");
            task.priority = Priority::new(3).unwrap();
            task.due = Some(Due::on(date(2024, 6, 1)));
            task.labels = vec!["home".to_string()];
            let view = written_view(&task);
            assert_eq!(view.content, content);
            assert_eq!(view.priority, task.priority);
            assert_eq!(view.due_date, Some(date(2024, 6, 1)));
            assert_eq!(view.labels, vec!["home"]);

            task.labels.clear();
            task.due = None;
            task.priority = Priority::DEFAULT;
            let view = written_view(&task);
            assert_eq!(view.content, content);
            assert!(view.labels.is_empty(), "{:?}", view.labels);
            assert_eq!(view.priority, Priority::DEFAULT);
        }
    }

    #[test]
    fn written_view_normalizes_text() {
        let mut task = Task::new("3", "  Plan   trip ", "p1");
        task.description = "  first line  \n\nsecond".to_string();
        let view = written_view(&task);
        assert_eq!(view.content, "Plan   trip");
        assert_eq!(view.description, "  first line\n\nsecond");
    }
}
