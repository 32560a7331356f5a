use std::collections::HashMap;

use indexmap::IndexMap;

use crate::model::task::LocalTask;
use crate::parse::task_parser::parse_tasks;

/// A `## Section` region of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionRegion {
    pub name: String,
    /// Line of the `## ` header
    pub header_line: usize,
    /// Exclusive end: the next header, or end of document
    pub end: usize,
}

/// A task document split into lines, with every task line located
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub lines: Vec<String>,
    pub title: Option<String>,
    pub sections: Vec<SectionRegion>,
    pub tasks: Vec<LocalTask>,
}

impl ParsedDocument {
    pub fn parse(source: &str) -> Self {
        Self::from_lines(source.lines().map(str::to_string).collect())
    }

    pub fn from_lines(lines: Vec<String>) -> Self {
        let mut title = None;
        let mut sections: Vec<SectionRegion> = Vec::new();

        for (idx, line) in lines.iter().enumerate() {
            let trimmed = line.trim();
            if let Some(name) = trimmed.strip_prefix("## ") {
                if let Some(prev) = sections.last_mut() {
                    prev.end = idx;
                }
                sections.push(SectionRegion {
                    name: name.trim().to_string(),
                    header_line: idx,
                    end: lines.len(),
                });
            } else if let Some(name) = trimmed.strip_prefix("# ")
                && title.is_none()
            {
                title = Some(name.trim().to_string());
            }
        }

        let tasks = parse_tasks(&lines);
        ParsedDocument {
            lines,
            title,
            sections,
            tasks,
        }
    }

    pub fn task(&self, id: &str) -> Option<&LocalTask> {
        self.tasks.iter().find(|t| t.id.as_deref() == Some(id))
    }

    /// The section a line falls in, if any
    pub fn section_at(&self, line: usize) -> Option<&SectionRegion> {
        self.sections
            .iter()
            .find(|s| s.header_line <= line && line < s.end)
    }

    pub fn section(&self, name: &str) -> Option<&SectionRegion> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// End of the region before the first `## ` header
    pub fn preamble_end(&self) -> usize {
        self.sections
            .first()
            .map_or(self.lines.len(), |s| s.header_line)
    }

    /// Line after the `# ` title, or 0 without one
    pub fn title_end(&self) -> usize {
        self.lines[..self.preamble_end()]
            .iter()
            .position(|l| l.trim_start().starts_with("# "))
            .map_or(0, |i| i + 1)
    }

    /// Join lines back into document text, always ending in a newline
    pub fn render(lines: &[String]) -> String {
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

/// Every document of the local corpus, parsed, with tasks indexed by id
#[derive(Debug, Clone, Default)]
pub struct LocalCorpus {
    documents: IndexMap<String, ParsedDocument>,
    /// id -> document path; the first occurrence wins
    index: HashMap<String, String>,
    unreadable: Vec<String>,
}

impl LocalCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, source: &str) {
        let doc = ParsedDocument::parse(source);
        for task in &doc.tasks {
            if let Some(ref id) = task.id {
                self.index
                    .entry(id.clone())
                    .or_insert_with(|| path.to_string());
            }
        }
        self.documents.insert(path.to_string(), doc);
    }

    /// Record a document that exists but could not be read
    pub fn mark_unreadable(&mut self, path: &str) {
        self.unreadable.push(path.to_string());
    }

    pub fn is_unreadable(&self, path: &str) -> bool {
        self.unreadable.iter().any(|p| p == path)
    }

    pub fn document(&self, path: &str) -> Option<&ParsedDocument> {
        self.documents.get(path)
    }

    pub fn documents(&self) -> impl Iterator<Item = (&str, &ParsedDocument)> {
        self.documents.iter().map(|(p, d)| (p.as_str(), d))
    }

    /// Where a task with this id sits locally
    pub fn locate(&self, id: &str) -> Option<(&str, &LocalTask)> {
        let path = self.index.get(id)?;
        let task = self.documents.get(path)?.task(id)?;
        Some((path.as_str(), task))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Every task line carrying an id, with its document
    pub fn identified(&self) -> impl Iterator<Item = (&str, &LocalTask)> {
        self.documents.iter().flat_map(|(path, doc)| {
            doc.tasks
                .iter()
                .filter(|t| t.id.is_some())
                .map(move |t| (path.as_str(), t))
        })
    }

    /// Task lines typed locally, without an id
    pub fn unidentified(&self) -> impl Iterator<Item = (&str, &LocalTask)> {
        self.documents.iter().flat_map(|(path, doc)| {
            doc.tasks
                .iter()
                .filter(|t| t.id.is_none())
                .map(move |t| (path.as_str(), t))
        })
    }
}
