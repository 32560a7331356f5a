use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::io::atomic_write;
use crate::io::document_store::{DocumentError, DocumentStore};
use crate::model::mapping::{MAPPING_VERSION, MappingRecord, TaskMapping};
use crate::model::task::{Task, TaskView};
use crate::parse::hash::snapshot_hash;
use crate::parse::task_parser::parse_task_line;

/// Error type for mapping persistence
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("could not write mapping record {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not serialize mapping record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Task id ↔ (document, line) mapping with a reverse index.
///
/// Loading never fails: an unreadable record is renamed aside and the store
/// starts empty. Saving rewrites the whole record atomically.
#[derive(Debug)]
pub struct MappingStore {
    path: PathBuf,
    forward: IndexMap<String, TaskMapping>,
    reverse: HashMap<(String, usize), String>,
    last_updated: Option<DateTime<Utc>>,
    quarantined: Option<PathBuf>,
    dirty: bool,
}

impl MappingStore {
    /// An empty store that will save to `path`
    pub fn new(path: &Path) -> Self {
        MappingStore {
            path: path.to_path_buf(),
            forward: IndexMap::new(),
            reverse: HashMap::new(),
            last_updated: None,
            quarantined: None,
            dirty: false,
        }
    }

    /// Load the record at `path`. A missing file gives an empty store; a
    /// corrupt one is quarantined and also gives an empty store.
    pub fn initialize(path: &Path) -> Self {
        let mut store = MappingStore::new(path);
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return store,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read mapping record");
                store.quarantine();
                return store;
            }
        };

        match serde_json::from_str::<MappingRecord>(&text) {
            Ok(record) if record.version <= MAPPING_VERSION => {
                store.last_updated = Some(record.last_updated);
                for mapping in record.mappings {
                    store.insert(mapping);
                }
                store.dirty = false;
                debug!(count = store.len(), "loaded task mappings");
            }
            Ok(record) => {
                warn!(
                    path = %path.display(),
                    version = record.version,
                    "mapping record is from a newer version"
                );
                store.quarantine();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "mapping record is corrupt");
                store.quarantine();
            }
        }
        store
    }

    /// Rename the record aside as `<name>.corrupt-<timestamp>`
    fn quarantine(&mut self) {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".corrupt-{}", stamp));
        let aside = PathBuf::from(name);
        match fs::rename(&self.path, &aside) {
            Ok(()) => {
                warn!(moved_to = %aside.display(), "quarantined mapping record; starting empty");
                self.quarantined = Some(aside);
            }
            Err(e) => warn!(error = %e, "could not quarantine mapping record"),
        }
    }

    /// Where a corrupt record was moved on load, if that happened
    pub fn quarantined(&self) -> Option<&Path> {
        self.quarantined.as_deref()
    }

    /// Write the whole record. Idempotent.
    pub fn save(&mut self) -> Result<(), MappingError> {
        let now = Utc::now();
        let record = MappingRecord {
            version: MAPPING_VERSION,
            last_updated: now,
            mappings: self.forward.values().cloned().collect(),
        };
        let text = serde_json::to_string_pretty(&record)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| MappingError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        }
        atomic_write(&self.path, text.as_bytes()).map_err(|e| MappingError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        self.last_updated = Some(now);
        self.dirty = false;
        Ok(())
    }

    /// Save only when something changed since the last load or save
    pub fn save_if_dirty(&mut self) -> Result<bool, MappingError> {
        if !self.dirty {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Map `task` to a line, recording its current hash and view
    pub fn create_mapping(&mut self, task: &Task, document: &str, line: usize) {
        self.commit(task, document, line, task.view());
    }

    /// Map `task` to a line with the view actually parsed from that line
    pub fn commit(&mut self, task: &Task, document: &str, line: usize, snapshot: TaskView) {
        self.insert(TaskMapping {
            task_id: task.id.clone(),
            document_path: document.to_string(),
            line_number: line,
            content: task.content.clone(),
            last_sync_time: Utc::now(),
            checksum: snapshot_hash(task),
            snapshot: Some(snapshot),
        });
    }

    fn insert(&mut self, mapping: TaskMapping) {
        if let Some(old) = self.forward.get(&mapping.task_id) {
            let key = (old.document_path.clone(), old.line_number);
            self.drop_reverse(&key, &mapping.task_id);
        }
        self.reverse.insert(
            (mapping.document_path.clone(), mapping.line_number),
            mapping.task_id.clone(),
        );
        self.forward.insert(mapping.task_id.clone(), mapping);
        self.dirty = true;
    }

    /// Remove a reverse entry only if it still points at `task_id`
    fn drop_reverse(&mut self, key: &(String, usize), task_id: &str) {
        if self.reverse.get(key).is_some_and(|id| id == task_id) {
            self.reverse.remove(key);
        }
    }

    pub fn get_task_id(&self, document: &str, line: usize) -> Option<&str> {
        self.reverse
            .get(&(document.to_string(), line))
            .map(String::as_str)
    }

    pub fn get_location(&self, task_id: &str) -> Option<(&str, usize)> {
        self.forward
            .get(task_id)
            .map(|m| (m.document_path.as_str(), m.line_number))
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskMapping> {
        self.forward.get(task_id)
    }

    pub fn remove_mapping(&mut self, task_id: &str) -> Option<TaskMapping> {
        let removed = self.forward.shift_remove(task_id)?;
        let key = (removed.document_path.clone(), removed.line_number);
        self.drop_reverse(&key, task_id);
        self.dirty = true;
        Some(removed)
    }

    /// Move a mapping to a new location. Returns false if the task is unmapped.
    pub fn update_mapping(&mut self, task_id: &str, document: &str, line: usize) -> bool {
        let Some(mapping) = self.forward.get(task_id) else {
            return false;
        };
        if mapping.document_path == document && mapping.line_number == line {
            return true;
        }
        let old_key = (mapping.document_path.clone(), mapping.line_number);
        self.drop_reverse(&old_key, task_id);
        if let Some(mapping) = self.forward.get_mut(task_id) {
            mapping.document_path = document.to_string();
            mapping.line_number = line;
        }
        self.reverse
            .insert((document.to_string(), line), task_id.to_string());
        self.dirty = true;
        true
    }

    /// Whether the task's hash differs from the one recorded at last sync.
    /// Unmapped tasks count as changed.
    pub fn has_changed(&self, task: &Task) -> bool {
        self.forward
            .get(&task.id)
            .is_none_or(|m| m.checksum != snapshot_hash(task))
    }

    /// Mappings whose line no longer holds that task's marker. A document
    /// that exists but can't be read orphans nothing.
    pub async fn find_orphaned(&self, docs: &dyn DocumentStore) -> Vec<TaskMapping> {
        let mut cache: HashMap<String, Result<Vec<String>, DocumentError>> = HashMap::new();
        let mut orphaned = Vec::new();

        for mapping in self.forward.values() {
            if !cache.contains_key(&mapping.document_path) {
                let lines = docs
                    .read(&mapping.document_path)
                    .await
                    .map(|text| text.lines().map(str::to_string).collect());
                cache.insert(mapping.document_path.clone(), lines);
            }
            let lines = match cache.get(&mapping.document_path) {
                Some(Ok(lines)) => lines,
                Some(Err(DocumentError::NotFound(_))) => {
                    orphaned.push(mapping.clone());
                    continue;
                }
                _ => continue,
            };
            let holds_marker = lines
                .get(mapping.line_number)
                .and_then(|line| parse_task_line(line))
                .is_some_and(|t| t.id.as_deref() == Some(mapping.task_id.as_str()));
            if !holds_marker {
                orphaned.push(mapping.clone());
            }
        }
        orphaned
    }

    /// Remove orphaned mappings, returning how many went
    pub async fn cleanup_orphaned(&mut self, docs: &dyn DocumentStore) -> usize {
        let orphaned = self.find_orphaned(docs).await;
        for mapping in &orphaned {
            debug!(task_id = %mapping.task_id, "pruning orphaned mapping");
            self.remove_mapping(&mapping.task_id);
        }
        orphaned.len()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskMapping> {
        self.forward.values()
    }

    /// Every forward entry has exactly its own reverse entry
    pub fn is_consistent(&self) -> bool {
        self.reverse.len() == self.forward.len()
            && self.forward.values().all(|m| {
                self.get_task_id(&m.document_path, m.line_number) == Some(m.task_id.as_str())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::document_store::FsDocumentStore;
    use tempfile::TempDir;

    #[test]
    fn create_lookup_and_remove() {
        let tmp = TempDir::new().unwrap();
        let mut store = MappingStore::new(&tmp.path().join("mappings.json"));
        let task = Task::new("1", "Buy groceries", "p1");
        store.create_mapping(&task, "Tasks/Home.md", 4);

        assert_eq!(store.get_task_id("Tasks/Home.md", 4), Some("1"));
        assert_eq!(store.get_location("1"), Some(("Tasks/Home.md", 4)));
        assert!(!store.has_changed(&task));

        let mut edited = task.clone();
        edited.content = "Buy groceries and flowers".into();
        assert!(store.has_changed(&edited));

        assert!(store.remove_mapping("1").is_some());
        assert_eq!(store.get_task_id("Tasks/Home.md", 4), None);
        assert!(store.is_empty());
    }

    #[test]
    fn update_keeps_reverse_index_consistent() {
        let tmp = TempDir::new().unwrap();
        let mut store = MappingStore::new(&tmp.path().join("mappings.json"));
        store.create_mapping(&Task::new("a", "A", "p1"), "Home.md", 2);
        store.create_mapping(&Task::new("b", "B", "p1"), "Home.md", 3);

        // a moves onto b's line before b moves down
        assert!(store.update_mapping("a", "Home.md", 3));
        assert!(store.update_mapping("b", "Home.md", 4));
        assert!(store.is_consistent());
        assert_eq!(store.get_task_id("Home.md", 3), Some("a"));
        assert_eq!(store.get_task_id("Home.md", 4), Some("b"));
        assert_eq!(store.get_task_id("Home.md", 2), None);
        assert!(!store.update_mapping("zzz", "Home.md", 9));
    }

    #[test]
    fn save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state/mappings.json");
        let mut store = MappingStore::new(&path);
        store.create_mapping(&Task::new("1", "One", "p1"), "Home.md", 0);
        store.create_mapping(&Task::new("2", "Two", "p1"), "Work.md", 5);
        store.save().unwrap();
        assert!(!store.is_dirty());
        assert!(!store.save_if_dirty().unwrap());

        let loaded = MappingStore::initialize(&path);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get_location("2"), Some(("Work.md", 5)));
        assert!(loaded.is_consistent());
        assert!(loaded.last_updated().is_some());

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"taskId\""));
        assert!(text.contains("\"lastSyncTime\""));
    }

    #[test]
    fn corrupt_record_is_quarantined() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mappings.json");
        fs::write(&path, "{ not json").unwrap();

        let store = MappingStore::initialize(&path);
        assert_eq!(store.len(), 0);
        assert!(!path.exists());
        let aside = store.quarantined().unwrap();
        assert!(aside.exists());
        assert_eq!(fs::read_to_string(aside).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn orphaned_mappings_are_found_and_pruned() {
        let tmp = TempDir::new().unwrap();
        let docs = FsDocumentStore::new(tmp.path());
        docs.write(
            "Home.md",
            "# Home\n- [ ] Keep <!-- id:1:aa -->\nplain text\n",
        )
        .await
        .unwrap();

        let mut store = MappingStore::new(&tmp.path().join("mappings.json"));
        store.create_mapping(&Task::new("1", "Keep", "p1"), "Home.md", 1);
        store.create_mapping(&Task::new("2", "Gone", "p1"), "Home.md", 2);
        store.create_mapping(&Task::new("3", "Missing doc", "p1"), "Away.md", 0);

        let orphaned = store.find_orphaned(&docs).await;
        let ids: Vec<&str> = orphaned.iter().map(|m| m.task_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);

        assert_eq!(store.cleanup_orphaned(&docs).await, 2);
        assert_eq!(store.len(), 1);
        assert!(store.is_consistent());
    }
}
