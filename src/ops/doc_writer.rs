use crate::model::task::LocalTask;
use crate::parse::document::ParsedDocument;

/// Where a project's document lives: `<sync_dir>/<name>.md`
pub fn document_path(sync_dir: &str, project_name: &str) -> String {
    let name: String = project_name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c if c.is_control() => '-',
            c => c,
        })
        .collect();
    let name = name.trim().trim_start_matches('.');
    let name = if name.is_empty() { "Untitled" } else { name };
    let dir = sync_dir.trim_matches('/');
    if dir.is_empty() {
        format!("{}.md", name)
    } else {
        format!("{}/{}.md", dir, name)
    }
}

/// Lines of a fresh project document
pub fn new_document(title: &str) -> Vec<String> {
    vec![format!("# {}", title), String::new()]
}

/// Replace a task's line and description block, leaving its children in
/// place. Returns whether anything changed.
pub fn replace_block(lines: &mut Vec<String>, task: &LocalTask, block: Vec<String>) -> bool {
    let end = task.block_end.min(lines.len());
    if lines[task.line..end] == block[..] {
        return false;
    }
    lines.splice(task.line..end, block);
    true
}

/// Insertion point and indent for a new child of `parent`: after its
/// whole subtree, one level deeper
pub fn child_insertion(parent: &LocalTask) -> (usize, usize) {
    (parent.subtree_end, parent.indent + 2)
}

/// Insert a top-level block at the end of a section's region, or at the end
/// of the preamble when `section` is None. A missing section header is
/// appended to the document first.
pub fn insert_in_section(lines: &mut Vec<String>, section: Option<&str>, block: Vec<String>) {
    let doc = ParsedDocument::from_lines(lines.clone());
    let region = match section {
        None => Some((doc.title_end(), doc.preamble_end())),
        Some(name) => doc.section(name).map(|s| (s.header_line + 1, s.end)),
    };

    let at = match region {
        Some((start, end)) => last_content_line(lines, start, end),
        None => {
            trim_trailing_blank(lines);
            lines.push(String::new());
            lines.push(format!("## {}", section.unwrap_or_default()));
            lines.push(String::new());
            lines.len()
        }
    };
    let mut block = block;
    if lines.get(at).is_some_and(|l| l.trim_start().starts_with('#')) {
        block.push(String::new());
    }
    insert_block(lines, at, block);
}

/// Insert a block at a fixed line
pub fn insert_block(lines: &mut Vec<String>, at: usize, block: Vec<String>) {
    let at = at.min(lines.len());
    lines.splice(at..at, block);
}

/// Just past the last non-blank line in `start..end`. An empty region gets
/// a blank separator after whatever precedes it.
fn last_content_line(lines: &mut Vec<String>, start: usize, end: usize) -> usize {
    let end = end.min(lines.len());
    let last = (start..end).rev().find(|&i| !lines[i].trim().is_empty());
    match last {
        Some(i) => i + 1,
        None if start == 0 => 0,
        None if lines.get(start).is_some_and(|l| l.trim().is_empty()) => start + 1,
        None => {
            lines.insert(start, String::new());
            start + 1
        }
    }
}

fn trim_trailing_blank(lines: &mut Vec<String>) {
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
}
