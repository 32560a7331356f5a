use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::model::task::{LocalTask, Priority, TaskView};
use crate::parse::duration::{DURATION_MARKER, parse_duration};
use crate::parse::recurrence::{RECURRENCE_MARKER, parse_recurrence};
use crate::parse::task_serializer::{DATE_MARKER, OVERDUE_MARKER};

/// Trailing `<!-- id:ID:HASH -->` marker
pub static ID_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*<!--\s*id:([^:\s]+):([0-9A-Za-z]*)\s*-->\s*$").unwrap()
});

/// Markers that start a trailing token. `⚠️` precedes the bare `⚠` so the
/// longer form wins when both match at one position.
const TOKEN_MARKERS: [&str; 9] = [
    DURATION_MARKER,
    RECURRENCE_MARKER,
    "🔴",
    "🟠",
    "🔵",
    "⚪",
    DATE_MARKER,
    OVERDUE_MARKER,
    "⚠",
];

/// One task line, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLine {
    pub indent: usize,
    pub id: Option<String>,
    pub hash: Option<String>,
    pub view: TaskView,
}

/// Parse a single task line. Lines without a `- [ ]` / `- [x]` checkbox are
/// not tasks and yield None. Malformed tokens are dropped, not fatal.
pub fn parse_task_line(line: &str) -> Option<TaskLine> {
    let indent = count_indent(line);
    let rest = line[indent..].strip_prefix("- [")?;
    let mut chars = rest.chars();
    let state_char = chars.next()?;
    let after_box = chars.as_str().strip_prefix(']')?;
    if !(after_box.is_empty() || after_box.starts_with(' ')) {
        return None;
    }
    let completed = matches!(state_char, 'x' | 'X');
    let body = after_box.trim_start();

    let (body, id, hash) = match ID_MARKER.captures(body) {
        Some(caps) => {
            let start = caps.get(0).map_or(body.len(), |m| m.start());
            let hash = caps
                .get(2)
                .map(|m| m.as_str())
                .filter(|h| !h.is_empty())
                .map(str::to_string);
            (&body[..start], Some(caps[1].to_string()), hash)
        }
        None => (body, None, None),
    };

    let (before_labels, labels) = parse_title_and_tags(body);

    let mut view = TaskView {
        completed,
        labels,
        ..TaskView::default()
    };

    let starts = token_starts(&before_labels);
    let content_end = starts.first().map_or(before_labels.len(), |(pos, _)| *pos);
    view.content = unescape_content(before_labels[..content_end].trim());

    let mut priority = None;
    for (i, (pos, marker)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map_or(before_labels.len(), |(p, _)| *p);
        let payload = before_labels[pos + marker.len()..end].trim();
        match *marker {
            DURATION_MARKER => {
                if view.duration.is_none() {
                    view.duration = parse_duration(payload);
                }
            }
            RECURRENCE_MARKER => {
                if view.recurrence.is_none() {
                    view.recurrence = parse_recurrence(payload);
                }
            }
            DATE_MARKER | OVERDUE_MARKER | "⚠" => {
                if view.due_date.is_none() {
                    view.due_date = parse_date(payload);
                }
            }
            glyph => {
                if priority.is_none() {
                    priority = Priority::from_glyph(glyph);
                }
            }
        }
    }
    view.priority = priority.unwrap_or_default();

    Some(TaskLine {
        indent,
        id,
        hash,
        view,
    })
}

/// Parse every task in a document into a flat list, in line order.
/// Each task gets its description block, its subtree extent and the id of
/// the task line it's nested under.
pub fn parse_tasks(lines: &[String]) -> Vec<LocalTask> {
    let mut tasks = Vec::new();
    let mut stack: Vec<(usize, Option<String>)> = Vec::new();
    let mut idx = 0;

    while idx < lines.len() {
        let Some(parsed) = parse_task_line(&lines[idx]) else {
            idx += 1;
            continue;
        };

        while stack.last().is_some_and(|(ind, _)| *ind >= parsed.indent) {
            stack.pop();
        }
        let parent_id = stack.last().and_then(|(_, id)| id.clone());

        let desc_indent = parsed.indent + 2;
        let (description, block_end) = parse_description(lines, idx + 1, desc_indent);

        let mut view = parsed.view;
        view.description = description;
        stack.push((parsed.indent, parsed.id.clone()));

        tasks.push(LocalTask {
            id: parsed.id,
            hash: parsed.hash,
            view,
            line: idx,
            indent: parsed.indent,
            block_end,
            subtree_end: subtree_end(lines, block_end, parsed.indent),
            parent_id,
        });
        idx = block_end;
    }

    tasks
}

/// Collect description lines at `desc_indent` or deeper, stopping at the
/// first task line or dedent. Blank lines are kept only when more
/// description follows.
fn parse_description(lines: &[String], start: usize, desc_indent: usize) -> (String, usize) {
    let mut desc_lines: Vec<String> = Vec::new();
    let mut idx = start;

    while idx < lines.len() {
        let line = &lines[idx];
        if line.trim().is_empty() {
            if has_continuation_at_indent(lines, idx + 1, desc_indent) {
                desc_lines.push(String::new());
                idx += 1;
                continue;
            }
            break;
        }
        if count_indent(line) < desc_indent || parse_task_line(line).is_some() {
            break;
        }
        desc_lines.push(strip_block_indent(line, desc_indent));
        idx += 1;
    }

    (desc_lines.join("\n"), idx)
}

/// Whether the next non-blank line after `start` is description text at
/// `indent` or deeper (not a task line).
fn has_continuation_at_indent(lines: &[String], start: usize, indent: usize) -> bool {
    lines
        .iter()
        .skip(start)
        .find(|l| !l.trim().is_empty())
        .is_some_and(|l| count_indent(l) >= indent && parse_task_line(l).is_none())
}

/// End of a task's subtree: everything indented deeper than the task line,
/// not counting trailing blank lines.
fn subtree_end(lines: &[String], block_end: usize, indent: usize) -> usize {
    let mut end = block_end;
    for (k, line) in lines.iter().enumerate().skip(block_end) {
        if line.trim().is_empty() {
            continue;
        }
        if count_indent(line) > indent {
            end = k + 1;
        } else {
            break;
        }
    }
    end
}

/// Positions of trailing-token markers that start a whitespace-separated word
fn token_starts(s: &str) -> Vec<(usize, &'static str)> {
    let mut starts: Vec<(usize, &'static str)> = Vec::new();
    for marker in TOKEN_MARKERS {
        for (pos, _) in s.match_indices(marker) {
            if pos == 0 || s[..pos].ends_with(char::is_whitespace) {
                starts.push((pos, marker));
            }
        }
    }
    starts.sort_by_key(|(pos, _)| *pos);
    starts.dedup_by_key(|(pos, _)| *pos);
    starts
}

/// Whether a word, past any leading backslashes, starts with `#` or a
/// trailing-token marker
pub(crate) fn reads_as_token(word: &str) -> bool {
    let bare = word.trim_start_matches('\\');
    bare.starts_with('#') || TOKEN_MARKERS.iter().any(|m| bare.starts_with(m))
}

/// Drop the escaping backslash the serializer puts in front of content
/// words that would otherwise read as a token or a label
fn unescape_content(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut word_start = true;
    for (i, c) in content.char_indices() {
        let escape = word_start && c == '\\' && reads_as_token(&content[i + 1..]);
        if !escape {
            out.push(c);
        }
        word_start = c.is_whitespace();
    }
    out
}

/// Parse a date token: `M/D/YYYY` or ISO `YYYY-MM-DD`
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date);
    }
    let mut parts = s.split('/');
    let month: u32 = parts.next()?.trim().parse().ok()?;
    let day: u32 = parts.next()?.trim().parse().ok()?;
    let year: i32 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Split a string into title and tags. Tags are `#word` tokens at the end.
pub fn parse_title_and_tags(s: &str) -> (String, Vec<String>) {
    let s = s.trim_end();
    if s.is_empty() {
        return (String::new(), Vec::new());
    }

    let mut tags = Vec::new();
    let mut remaining = s;

    loop {
        let trimmed = remaining.trim_end();
        if trimmed.is_empty() {
            break;
        }

        let (head, last_word) = match trimmed.rfind(' ') {
            Some(last_space) => (&trimmed[..last_space], &trimmed[last_space + 1..]),
            None => ("", trimmed),
        };
        if let Some(tag) = last_word.strip_prefix('#')
            && !tag.is_empty()
            && !tag.contains('#')
        {
            tags.push(tag.to_string());
            remaining = head;
            continue;
        }
        break;
    }

    tags.reverse();
    (remaining.trim_end().to_string(), tags)
}

/// Count leading spaces
pub fn count_indent(line: &str) -> usize {
    line.len() - line.trim_start_matches(' ').len()
}

/// Strip block indent from a line, preserving relative indentation
fn strip_block_indent(line: &str, block_indent: usize) -> String {
    if count_indent(line) >= block_indent {
        line[block_indent..].trim_end().to_string()
    } else {
        line.trim().to_string()
    }
}
