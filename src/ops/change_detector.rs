use std::collections::HashSet;

use serde::Serialize;

use crate::io::mapping_store::MappingStore;
use crate::model::config::IncrementalConfig;
use crate::model::task::{LocalTask, Task, TaskView};
use crate::parse::document::LocalCorpus;
use crate::parse::hash::snapshot_hash;
use crate::parse::task_serializer::written_view;

/// Remote → local classification of one fetched task set
#[derive(Debug, Default)]
pub struct RemoteChanges<'a> {
    pub new: Vec<&'a Task>,
    pub changed: Vec<&'a Task>,
    pub unchanged: Vec<&'a Task>,
    /// Ids known locally (mapped or present in a document) but gone remotely
    pub deleted: Vec<String>,
}

impl RemoteChanges<'_> {
    pub fn total(&self) -> usize {
        self.new.len() + self.changed.len() + self.unchanged.len()
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            total: self.total(),
            new: self.new.len(),
            changed: self.changed.len(),
            unchanged: self.unchanged.len(),
            deleted: self.deleted.len(),
        }
    }
}

/// Counts behind the efficiency figure
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChangeSummary {
    pub total: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl ChangeSummary {
    /// Share of tasks that needed no work. An empty set is fully efficient.
    pub fn efficiency(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.unchanged as f64 / self.total as f64
    }

    pub fn changed_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.new + self.changed + self.deleted) as f64 / self.total as f64
    }

    /// Incremental only pays off on a large enough set with few changes
    pub fn should_use_incremental_sync(&self, config: &IncrementalConfig) -> bool {
        config.enabled
            && self.total > config.min_sample
            && self.changed_fraction() < config.change_threshold
    }
}

/// A mapped task whose local line differs from what was last written
#[derive(Debug, Clone)]
pub struct LocalEdit<'a> {
    pub path: &'a str,
    pub local: &'a LocalTask,
    pub remote: &'a Task,
    /// What the line looked like when both sides last agreed
    pub baseline: TaskView,
}

impl LocalEdit<'_> {
    pub fn task_id(&self) -> &str {
        &self.remote.id
    }

    /// Fields no remote operation can carry
    pub fn has_unpushable_edits(&self) -> bool {
        let (local, base) = (&self.local.view, &self.baseline);
        local.description != base.description
            || local.labels != base.labels
            || local.duration != base.duration
            || local.recurrence != base.recurrence
    }
}

/// A task line typed locally, without an id
#[derive(Debug, Clone)]
pub struct NewLocalTask<'a> {
    pub path: &'a str,
    pub local: &'a LocalTask,
}

/// Local → remote classification
#[derive(Debug, Default)]
pub struct LocalChanges<'a> {
    /// Completion toggled on since the last sync
    pub completed: Vec<LocalEdit<'a>>,
    /// Any other text-visible field changed, including completion toggled off
    pub modified: Vec<LocalEdit<'a>>,
    pub newly_added: Vec<NewLocalTask<'a>>,
    pub unchanged: Vec<String>,
    /// Mapped tasks whose line is gone while the remote task is still open
    pub removed: Vec<&'a Task>,
}

impl LocalChanges<'_> {
    /// Every edited task once, completed first
    pub fn edits(&self) -> Vec<&LocalEdit<'_>> {
        let mut seen = HashSet::new();
        self.completed
            .iter()
            .chain(self.modified.iter())
            .filter(|e| seen.insert(e.task_id().to_string()))
            .collect()
    }
}

/// Classify every remote task against the last-known hash: the mapping's
/// checksum, or else the hash in the document marker.
pub fn identify_changed_tasks<'a>(
    remote: &'a [Task],
    corpus: &LocalCorpus,
    mappings: &MappingStore,
) -> RemoteChanges<'a> {
    let mut changes = RemoteChanges::default();
    let remote_ids: HashSet<&str> = remote.iter().map(|t| t.id.as_str()).collect();

    for task in remote {
        let mapping = mappings.get(&task.id);
        let known_hash = mapping
            .map(|m| m.checksum.clone())
            .or_else(|| corpus.locate(&task.id).and_then(|(_, l)| l.hash.clone()));
        let Some(known_hash) = known_hash else {
            changes.new.push(task);
            continue;
        };
        let completion_moved = mapping
            .and_then(|m| m.snapshot.as_ref())
            .is_some_and(|s| s.completed != task.is_completed);
        if known_hash != snapshot_hash(task) || completion_moved {
            changes.changed.push(task);
        } else {
            changes.unchanged.push(task);
        }
    }

    let mut deleted: Vec<String> = mappings
        .iter()
        .map(|m| m.task_id.clone())
        .chain(
            corpus
                .identified()
                .filter_map(|(_, t)| t.id.clone()),
        )
        .filter(|id| !remote_ids.contains(id.as_str()))
        .collect();
    let mut seen = HashSet::new();
    deleted.retain(|id| seen.insert(id.clone()));
    changes.deleted = deleted;
    changes
}

/// Mirror classification: what the user changed locally since the last sync
pub fn identify_local_changes<'a>(
    remote: &'a [Task],
    corpus: &'a LocalCorpus,
    mappings: &MappingStore,
) -> LocalChanges<'a> {
    let mut changes = LocalChanges::default();

    for task in remote {
        let Some((path, local)) = corpus.locate(&task.id) else {
            let mapped_doc = mappings.get(&task.id).map(|m| m.document_path.as_str());
            if let Some(doc) = mapped_doc
                && !task.is_completed
                && corpus.document(doc).is_some()
            {
                changes.removed.push(task);
            }
            continue;
        };

        let baseline = baseline_for(mappings, local, task);
        let edit = LocalEdit {
            path,
            local,
            remote: task,
            baseline,
        };
        let toggled_done = edit.local.view.completed && !edit.baseline.completed;
        let other_edits = TaskView {
            completed: edit.baseline.completed,
            ..edit.local.view.clone()
        } != edit.baseline
            || (!edit.local.view.completed && edit.baseline.completed);

        match (toggled_done, other_edits) {
            (false, false) => changes.unchanged.push(task.id.clone()),
            (true, false) => changes.completed.push(edit),
            (false, true) => changes.modified.push(edit),
            (true, true) => {
                changes.completed.push(edit.clone());
                changes.modified.push(edit);
            }
        }
    }

    changes.newly_added = corpus
        .unidentified()
        .map(|(path, local)| NewLocalTask { path, local })
        .collect();
    changes
}

/// The line as last written. Without a recorded snapshot, an untouched
/// marker hash means the line still shows the remote task; otherwise no
/// local edit can be told apart and the line itself is the baseline.
fn baseline_for(mappings: &MappingStore, local: &LocalTask, remote: &Task) -> TaskView {
    if let Some(snapshot) = mappings.get(&remote.id).and_then(|m| m.snapshot.clone()) {
        return snapshot;
    }
    if local.hash.as_deref() == Some(snapshot_hash(remote).as_str()) {
        return written_view(remote);
    }
    local.view.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::task_serializer::format_task_block;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn document(tasks: &[&Task]) -> String {
        let mut out = String::from("# Home\n\n");
        for t in tasks {
            for line in format_task_block(t, 0, today()) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    fn synced(tasks: &[Task]) -> (LocalCorpus, MappingStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut store = MappingStore::new(&tmp.path().join("mappings.json"));
        let refs: Vec<&Task> = tasks.iter().collect();
        let text = document(&refs);
        let mut corpus = LocalCorpus::new();
        corpus.insert("Tasks/Home.md", &text);
        for t in tasks {
            let (_, local) = corpus.locate(&t.id).unwrap();
            store.commit(t, "Tasks/Home.md", local.line, written_view(t));
        }
        (corpus, store, tmp)
    }

    fn tasks(n: usize) -> Vec<Task> {
        (1..=n)
            .map(|i| Task::new(&i.to_string(), &format!("Task number {}", i), "p1"))
            .collect()
    }

    #[test]
    fn remote_classification() {
        let mut remote = tasks(3);
        let (corpus, store, _tmp) = synced(&remote);
        remote[1].content = "Task number two, renamed".to_string();
        remote.push(Task::new("9", "Brand new", "p1"));
        remote.remove(2);

        let changes = identify_changed_tasks(&remote, &corpus, &store);
        let ids = |v: &Vec<&Task>| v.iter().map(|t| t.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&changes.unchanged), vec!["1"]);
        assert_eq!(ids(&changes.changed), vec!["2"]);
        assert_eq!(ids(&changes.new), vec!["9"]);
        assert_eq!(changes.deleted, vec!["3".to_string()]);
    }

    #[test]
    fn remote_completion_counts_as_change() {
        let mut remote = tasks(1);
        let (corpus, store, _tmp) = synced(&remote);
        remote[0].is_completed = true;
        let changes = identify_changed_tasks(&remote, &corpus, &store);
        assert_eq!(changes.changed.len(), 1);
    }

    #[test]
    fn marker_hash_stands_in_for_missing_mapping() {
        let remote = tasks(2);
        let refs: Vec<&Task> = remote.iter().collect();
        let mut corpus = LocalCorpus::new();
        corpus.insert("Tasks/Home.md", &document(&refs));
        let tmp = TempDir::new().unwrap();
        let store = MappingStore::new(&tmp.path().join("m.json"));

        let changes = identify_changed_tasks(&remote, &corpus, &store);
        assert_eq!(changes.unchanged.len(), 2);
        assert!(changes.new.is_empty());
    }

    #[test]
    fn local_classification() {
        let remote = tasks(4);
        let (corpus, store, _tmp) = synced(&remote);
        let text = corpus.document("Tasks/Home.md").unwrap().lines.join("\n");
        let edited = text
            .replace("- [ ] Task number 1 ", "- [x] Task number 1 ")
            .replace("Task number 2 ", "Task number 2 with more words ")
            .lines()
            .filter(|l| !l.contains("Task number 4"))
            .collect::<Vec<_>>()
            .join("\n")
            + "\n- [ ] Typed locally\n";
        let mut corpus = LocalCorpus::new();
        corpus.insert("Tasks/Home.md", &edited);

        let changes = identify_local_changes(&remote, &corpus, &store);
        assert_eq!(changes.completed.len(), 1);
        assert_eq!(changes.completed[0].task_id(), "1");
        assert_eq!(changes.modified.len(), 1);
        assert_eq!(changes.modified[0].task_id(), "2");
        assert_eq!(changes.unchanged, vec!["3".to_string()]);
        assert_eq!(changes.removed.len(), 1);
        assert_eq!(changes.removed[0].id, "4");
        assert_eq!(changes.newly_added.len(), 1);
        assert_eq!(changes.newly_added[0].local.view.content, "Typed locally");
        assert_eq!(changes.edits().len(), 2);
    }

    #[test]
    fn efficiency_and_incremental_choice() {
        let summary = ChangeSummary {
            total: 100,
            new: 0,
            changed: 5,
            unchanged: 95,
            deleted: 0,
        };
        assert!((summary.efficiency() - 0.95).abs() < 1e-9);
        assert!(summary.should_use_incremental_sync(&IncrementalConfig::default()));

        let small = ChangeSummary {
            total: 10,
            unchanged: 10,
            ..Default::default()
        };
        assert!(!small.should_use_incremental_sync(&IncrementalConfig::default()));

        let churny = ChangeSummary {
            total: 100,
            changed: 30,
            unchanged: 70,
            ..Default::default()
        };
        assert!(!churny.should_use_incremental_sync(&IncrementalConfig::default()));
        assert_eq!(ChangeSummary::default().efficiency(), 1.0);
    }
}
