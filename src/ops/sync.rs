//! One sync transaction, start to finish.
//!
//! `IDLE → FETCHING → DIFFING → BACKING_UP → RESOLVING → WRITING_LOCAL →
//! WRITING_REMOTE → DONE`, with `FAILED` reachable from the fetch. Every
//! later failure is per item and collected into the report.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::io::audit::{AuditCategory, AuditEntry, log_audit};
use crate::io::backup::BackupArchiver;
use crate::io::config_io::{backup_dir, mapping_path};
use crate::io::document_store::{DocumentError, DocumentStore};
use crate::io::lock::{FileLock, LockError};
use crate::io::mapping_store::MappingStore;
use crate::io::remote::{CreateOptions, Deadline, RemoteError, RemoteTaskService};
use crate::model::config::SyncConfig;
use crate::model::remote::RemoteSnapshot;
use crate::model::task::{LocalTask, Task, TaskView};
use crate::ops::change_detector::{ChangeSummary, identify_changed_tasks, identify_local_changes};
use crate::ops::conflict::{Conflict, ConflictKind, ConflictResolver, Side, classify_all};
use crate::ops::doc_writer::{
    child_insertion, document_path, insert_block, insert_in_section, new_document, replace_block,
};
use crate::ops::safe_write::{CloseReason, Operation, RejectReason, SafeOperation, SafeWriteFilter};
use crate::parse::document::{LocalCorpus, ParsedDocument};
use crate::parse::hash::snapshot_hash;
use crate::parse::task_serializer::{format_task_block, format_task_tree};
use crate::util::unicode::excerpt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Diffing,
    BackingUp,
    Resolving,
    WritingLocal,
    WritingRemote,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "IDLE",
            SyncPhase::Fetching => "FETCHING",
            SyncPhase::Diffing => "DIFFING",
            SyncPhase::BackingUp => "BACKING_UP",
            SyncPhase::Resolving => "RESOLVING",
            SyncPhase::WritingLocal => "WRITING_LOCAL",
            SyncPhase::WritingRemote => "WRITING_REMOTE",
            SyncPhase::Done => "DONE",
            SyncPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Forward (remote → documents) counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub tasks_processed: usize,
    pub projects_processed: usize,
    pub files_created: usize,
    pub files_updated: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

/// Reverse (documents → remote) counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseSyncResult {
    pub completed: usize,
    pub updated: usize,
    pub created: usize,
    /// Conflicts detected this run, resolved or not
    pub conflicts: usize,
    pub backup_created: bool,
    pub backup_file: Option<PathBuf>,
    /// Local edits deliberately not pushed, with the reason
    pub skipped: Vec<String>,
    /// Task lines typed locally without an id; reported, never pushed
    pub new_local_tasks: usize,
    pub errors: Vec<String>,
}

/// What a run did. Produced for every run, including rejected and failed ones.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub phase: SyncPhase,
    pub stats: SyncStats,
    pub reverse: Option<ReverseSyncResult>,
    pub changes: ChangeSummary,
    pub efficiency: f64,
    pub incremental: bool,
    /// Conflicts left for a human
    pub manual: Vec<Conflict>,
}

impl SyncReport {
    fn new() -> Self {
        SyncReport {
            phase: SyncPhase::Idle,
            stats: SyncStats::default(),
            reverse: None,
            changes: ChangeSummary::default(),
            efficiency: 1.0,
            incremental: false,
            manual: Vec::new(),
        }
    }

    /// A run that never started
    pub fn rejected(err: SyncError) -> Self {
        let mut report = SyncReport::new();
        report.phase = SyncPhase::Failed;
        report.stats.errors.push(err.to_string());
        report
    }

    pub fn is_failed(&self) -> bool {
        self.phase == SyncPhase::Failed
    }

    /// Forward and reverse errors together
    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.stats
            .errors
            .iter()
            .chain(self.reverse.iter().flat_map(|r| r.errors.iter()))
            .map(String::as_str)
    }
}

/// Errors that end a run in FAILED
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a sync is already running")]
    AlreadyRunning,
    #[error("remote service is not ready")]
    NotReady,
    #[error("remote fetch timed out after {0}s")]
    Timeout(u64),
    #[error("remote fetch failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("could not list documents: {0}")]
    Documents(#[from] DocumentError),
    #[error("{0}")]
    Lock(#[from] LockError),
}

/// Runs sync transactions between a remote service and a document store.
/// At most one transaction runs at a time.
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteTaskService>,
    docs: Arc<dyn DocumentStore>,
    config: SyncConfig,
    state_dir: PathBuf,
    mappings: Mutex<MappingStore>,
    today: Option<NaiveDate>,
}

impl SyncOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteTaskService>,
        docs: Arc<dyn DocumentStore>,
        config: SyncConfig,
        state_dir: &Path,
    ) -> Self {
        SyncOrchestrator {
            remote,
            docs,
            config,
            state_dir: state_dir.to_path_buf(),
            mappings: Mutex::new(MappingStore::initialize(&mapping_path(state_dir))),
            today: None,
        }
    }

    /// Pin the date used for overdue rendering
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn archiver(&self) -> BackupArchiver {
        BackupArchiver::new(
            &backup_dir(&self.state_dir),
            self.config.backup_retention,
            &self.config.plugin_version,
        )
    }

    /// Run one transaction. A run while another is in flight, here or in
    /// another process on the same state dir, is rejected.
    pub async fn run(&self) -> SyncReport {
        let Ok(mut mappings) = self.mappings.try_lock() else {
            warn!("sync rejected: another run is in flight");
            return SyncReport::rejected(SyncError::AlreadyRunning);
        };
        let _lock = match FileLock::try_acquire(&self.state_dir) {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "sync rejected");
                return SyncReport::rejected(e.into());
            }
        };

        let mut tx = Transaction {
            orch: self,
            mappings: &mut mappings,
            report: SyncReport::new(),
            today: self.today.unwrap_or_else(|| Local::now().date_naive()),
            claimed: HashMap::new(),
            written: HashSet::new(),
        };
        if let Err(e) = tx.execute().await {
            tx.fail(e);
        }
        tx.report
    }
}

/// A task line to recreate remotely after the remote side deleted it
#[derive(Debug, Clone)]
struct Recreate {
    old_id: String,
    view: TaskView,
}

/// Everything DIFFING and RESOLVING decided
#[derive(Debug, Default)]
struct Plan {
    incremental: bool,
    /// Remote tasks that are new or changed since the last sync
    changed: HashSet<String>,
    conflicts: Vec<Conflict>,
    /// Local lines left exactly as they are this run
    held: HashSet<String>,
    /// Lines the remote side won; re-rendered from the remote
    remote_won: HashSet<String>,
    ops: Vec<SafeOperation>,
    recreate: Vec<Recreate>,
    /// Remote tasks with no line yet
    inserts: Vec<Task>,
    /// Mappings to drop at the end
    forget: Vec<String>,
}

impl Plan {
    /// Lines whose mapping only follows them around
    fn untouchable(&self) -> HashSet<&str> {
        self.held
            .iter()
            .map(String::as_str)
            .chain(self.ops.iter().map(|op| op.task_id.as_str()))
            .chain(self.recreate.iter().map(|r| r.old_id.as_str()))
            .collect()
    }
}

/// A document as it will be written
struct Draft {
    lines: Vec<String>,
    /// None for a document this run creates
    original: Option<Vec<String>>,
    /// Ids whose lines this run wrote
    rendered: HashSet<String>,
}

struct Transaction<'a> {
    orch: &'a SyncOrchestrator,
    mappings: &'a mut MappingStore,
    report: SyncReport,
    today: NaiveDate,
    /// Task id → the document whose line owns its mapping
    claimed: HashMap<String, String>,
    written: HashSet<String>,
}

impl Transaction<'_> {
    async fn execute(&mut self) -> Result<(), SyncError> {
        let bidirectional = self.orch.config.bidirectional;

        self.enter(SyncPhase::Fetching);
        let snapshot = self.fetch().await?;
        let corpus = self.load_corpus().await?;
        self.report.stats.tasks_processed = snapshot.tasks.len();
        self.report.stats.projects_processed = snapshot.projects.len();

        self.enter(SyncPhase::Diffing);
        let mut plan = self.diff(&snapshot, &corpus);

        self.enter(SyncPhase::BackingUp);
        if bidirectional {
            self.back_up(&snapshot);
        }

        self.enter(SyncPhase::Resolving);
        if bidirectional {
            self.resolve(&mut plan);
        }

        self.enter(SyncPhase::WritingLocal);
        let on_disk = self.write_local(&snapshot, &corpus, &plan).await;

        self.enter(SyncPhase::WritingRemote);
        if bidirectional {
            self.write_remote(&snapshot, &corpus, &plan, on_disk).await;
        }

        self.finish(&plan).await;
        Ok(())
    }

    fn enter(&mut self, phase: SyncPhase) {
        debug!(from = %self.report.phase, to = %phase, "sync phase");
        self.report.phase = phase;
    }

    fn fail(&mut self, err: SyncError) {
        warn!(phase = %self.report.phase, error = %err, "sync failed");
        self.report.stats.errors.push(err.to_string());
        self.report.phase = SyncPhase::Failed;
    }

    fn reverse(&mut self) -> &mut ReverseSyncResult {
        self.report.reverse.get_or_insert_with(Default::default)
    }

    async fn fetch(&mut self) -> Result<RemoteSnapshot, SyncError> {
        let orch = self.orch;
        let remote = &orch.remote;
        if !remote.is_ready().await {
            return Err(SyncError::NotReady);
        }
        let secs = orch.config.fetch_timeout_secs;
        let deadline = Deadline::after(Duration::from_secs(secs));
        match tokio::time::timeout_at(deadline.instant(), remote.fetch_all(deadline)).await {
            Ok(Ok(snapshot)) => {
                debug!(tasks = snapshot.tasks.len(), "remote fetched");
                Ok(snapshot)
            }
            Ok(Err(e)) => {
                warn!(error = %e, transient = e.is_transient(), "remote fetch failed");
                Err(e.into())
            }
            Err(_) => Err(SyncError::Timeout(secs)),
        }
    }

    async fn load_corpus(&mut self) -> Result<LocalCorpus, SyncError> {
        let orch = self.orch;
        let mut corpus = LocalCorpus::new();
        for path in orch.docs.list().await? {
            if !in_sync_dir(&path, &orch.config.sync_dir) {
                continue;
            }
            match orch.docs.read(&path).await {
                Ok(text) => corpus.insert(&path, &text),
                Err(e) => {
                    warn!(path = %path, error = %e, "could not read document");
                    self.report.stats.errors.push(e.to_string());
                    corpus.mark_unreadable(&path);
                }
            }
        }
        Ok(corpus)
    }

    fn diff(&mut self, snapshot: &RemoteSnapshot, corpus: &LocalCorpus) -> Plan {
        let orch = self.orch;
        let config = &orch.config;
        let remote_changes = identify_changed_tasks(&snapshot.tasks, corpus, self.mappings);
        let summary = remote_changes.summary();
        let incremental = summary.should_use_incremental_sync(&config.incremental);
        self.report.changes = summary;
        self.report.efficiency = summary.efficiency();
        self.report.incremental = incremental;
        debug!(
            new = summary.new,
            changed = summary.changed,
            unchanged = summary.unchanged,
            deleted = summary.deleted,
            incremental,
            "remote changes"
        );

        let mut plan = Plan {
            incremental,
            changed: remote_changes
                .new
                .iter()
                .chain(remote_changes.changed.iter())
                .map(|t| t.id.clone())
                .collect(),
            ..Plan::default()
        };

        let local = identify_local_changes(&snapshot.tasks, corpus, self.mappings);
        if config.bidirectional {
            let mut reverse = ReverseSyncResult::default();
            for edit in local.edits() {
                let id = edit.task_id();
                if edit.has_unpushable_edits() {
                    plan.held.insert(id.to_string());
                    reverse.skipped.push(format!(
                        "task {}: local edits to description, labels, duration or recurrence are not pushed",
                        id
                    ));
                }
                for kind in classify_all(&edit.local.view, edit.remote, Some(&edit.baseline)) {
                    plan.conflicts.push(Conflict::new(
                        id,
                        Some(edit.local.view.clone()),
                        Some(edit.remote.clone()),
                        kind,
                    ));
                }
            }
            for task in &local.removed {
                plan.conflicts.push(Conflict::new(
                    &task.id,
                    None,
                    Some((*task).clone()),
                    ConflictKind::DeletedLocal,
                ));
            }
            for id in &remote_changes.deleted {
                match corpus.locate(id) {
                    Some((_, line)) if !line.view.completed => plan.conflicts.push(Conflict::new(
                        id,
                        Some(line.view.clone()),
                        None,
                        ConflictKind::DeletedRemote,
                    )),
                    _ => plan.forget.push(id.clone()),
                }
            }
            reverse.new_local_tasks = local.newly_added.len();
            reverse.conflicts = plan.conflicts.len();
            for added in &local.newly_added {
                debug!(
                    path = %added.path,
                    line = added.local.line,
                    excerpt = %excerpt(&added.local.view.content),
                    "new local task line left unsynced"
                );
            }
            self.report.reverse = Some(reverse);
        } else {
            plan.forget.extend(remote_changes.deleted.iter().cloned());
            plan.remote_won
                .extend(local.edits().iter().map(|e| e.task_id().to_string()));
        }

        for task in &snapshot.tasks {
            if corpus.contains(&task.id) {
                continue;
            }
            let mapped_doc = self.mappings.get(&task.id).map(|m| m.document_path.as_str());
            if mapped_doc.is_some_and(|doc| corpus.is_unreadable(doc)) {
                continue;
            }
            // Removed locally: open ones are DELETED_LOCAL, completed ones are done with
            if config.bidirectional && mapped_doc.is_some_and(|doc| corpus.document(doc).is_some()) {
                if task.is_completed {
                    plan.forget.push(task.id.clone());
                }
                continue;
            }
            if task.is_completed && !config.include_completed {
                if mapped_doc.is_some() {
                    plan.forget.push(task.id.clone());
                }
                continue;
            }
            plan.inserts.push(task.clone());
        }
        plan
    }

    /// Archive the fetched remote state before anything can mutate it
    fn back_up(&mut self, snapshot: &RemoteSnapshot) {
        let orch = self.orch;
        let state_dir = &orch.state_dir;
        let outcome = orch.archiver().archive_snapshot(snapshot, "pre-sync");
        match (outcome.success, outcome.backup_file) {
            (true, Some(file)) => {
                log_audit(
                    state_dir,
                    AuditEntry::new(AuditCategory::Backup, "pre-sync backup")
                        .field("File", file.display())
                        .field("Tasks", snapshot.tasks.len()),
                );
                let reverse = self.reverse();
                reverse.backup_created = true;
                reverse.backup_file = Some(file);
            }
            _ => {
                let error = outcome.error.unwrap_or_else(|| "unknown error".to_string());
                log_audit(
                    state_dir,
                    AuditEntry::new(AuditCategory::Failure, "pre-sync backup failed")
                        .field("Error", &error),
                );
                self.reverse()
                    .errors
                    .push(format!("backup failed, remote writes limited to completions: {}", error));
            }
        }
    }

    fn resolve(&mut self, plan: &mut Plan) {
        let conflicts = std::mem::take(&mut plan.conflicts);
        if conflicts.is_empty() {
            return;
        }
        let state_dir = self.orch.state_dir.clone();
        let outcome = ConflictResolver::with_audit(state_dir.clone()).resolve_conflicts(conflicts);
        let backup_created = self.reverse().backup_created;

        for conflict in outcome.manual {
            plan.held.insert(conflict.task_id.clone());
            self.report.manual.push(conflict);
        }
        self.reverse().errors.extend(outcome.errors);

        let mut proposals: Vec<(Task, Operation)> = Vec::new();
        for resolved in outcome.resolved {
            let conflict = resolved.conflict;
            if resolved.winner == Side::Remote {
                plan.remote_won.insert(conflict.task_id);
                continue;
            }
            let op = match (conflict.kind, &conflict.local) {
                (ConflictKind::DeletedRemote, Some(view)) => {
                    if backup_created {
                        plan.recreate.push(Recreate {
                            old_id: conflict.task_id,
                            view: view.clone(),
                        });
                    } else {
                        self.reverse().skipped.push(format!(
                            "task {}: recreate skipped: {}",
                            conflict.task_id,
                            RejectReason::NoBackup
                        ));
                        plan.held.insert(conflict.task_id);
                    }
                    continue;
                }
                (ConflictKind::CompletionStatus, _) => Operation::Complete {
                    reason: CloseReason::UserCompletion,
                },
                (ConflictKind::DeletedLocal, _) => Operation::Complete {
                    reason: CloseReason::Removal,
                },
                (ConflictKind::ContentModified, Some(view)) => Operation::UpdateContent {
                    content: view.content.clone(),
                },
                (ConflictKind::PriorityChanged, Some(view)) => Operation::UpdatePriority {
                    priority: view.priority,
                },
                (ConflictKind::DueDateChanged, Some(view)) => match view.due_date {
                    Some(date) => Operation::UpdateDueDate { date },
                    None => continue,
                },
                _ => continue,
            };
            if let Some(remote) = conflict.remote {
                proposals.push((remote, op));
            }
        }

        let filtered = SafeWriteFilter::new(backup_created)
            .filter(proposals.iter().map(|(task, op)| (task, op.clone())));
        for rejected in filtered.rejected {
            info!(task_id = %rejected.task_id, reason = %rejected.reason, "remote write rejected");
            log_audit(
                &state_dir,
                AuditEntry::new(AuditCategory::Rejected, rejected.reason.to_string())
                    .field("Task", &rejected.task_id)
                    .field("Detail", &rejected),
            );
            plan.held.insert(rejected.task_id.clone());
            self.reverse().skipped.push(rejected.to_string());
        }
        plan.ops = filtered.accepted;
    }

    /// Patch every document and write the ones that changed. Returns the
    /// lines each document now has on disk.
    async fn write_local(
        &mut self,
        snapshot: &RemoteSnapshot,
        corpus: &LocalCorpus,
        plan: &Plan,
    ) -> IndexMap<String, Vec<String>> {
        let today = self.today;
        let no_overrides = HashMap::new();
        let remote = task_index(snapshot, &no_overrides);
        let untouchable = plan.untouchable();
        let mut drafts: IndexMap<String, Draft> = IndexMap::new();

        for (path, doc) in corpus.documents() {
            let mut lines = doc.lines.clone();
            let mut rendered = HashSet::new();
            for local in doc.tasks.iter().rev() {
                let Some(id) = local.id.as_deref() else {
                    continue;
                };
                let Some(task) = remote.get(id) else {
                    continue;
                };
                if untouchable.contains(id) || !is_canonical(corpus, id, path, local) {
                    continue;
                }
                let due = !plan.incremental
                    || plan.changed.contains(id)
                    || plan.remote_won.contains(id);
                if due && replace_block(&mut lines, local, format_task_block(task, local.indent, today))
                {
                    rendered.insert(id.to_string());
                }
            }
            drafts.insert(
                path.to_string(),
                Draft {
                    lines,
                    original: Some(doc.lines.clone()),
                    rendered,
                },
            );
        }

        self.place_inserts(snapshot, corpus, plan, &mut drafts);

        let mut on_disk = IndexMap::new();
        for (path, draft) in drafts {
            if draft.original.as_ref() == Some(&draft.lines) {
                self.commit_document(&path, &draft.lines, &draft.rendered, &remote, &untouchable);
                on_disk.insert(path, draft.lines);
                continue;
            }
            match self.write_document(&path, &draft.lines, draft.original.is_none()).await {
                Ok(()) => {
                    self.commit_document(&path, &draft.lines, &draft.rendered, &remote, &untouchable);
                    on_disk.insert(path, draft.lines);
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "could not write document");
                    self.report.stats.errors.push(e.to_string());
                    if let Some(original) = draft.original {
                        self.commit_document(&path, &original, &HashSet::new(), &remote, &untouchable);
                        on_disk.insert(path, original);
                    }
                }
            }
        }
        on_disk
    }

    /// New remote tasks: under their parent's line when the parent is in a
    /// document, else at the end of their section in the project document
    fn place_inserts(
        &mut self,
        snapshot: &RemoteSnapshot,
        corpus: &LocalCorpus,
        plan: &Plan,
        drafts: &mut IndexMap<String, Draft>,
    ) {
        let today = self.today;
        let orch = self.orch;
        let sync_dir = &orch.config.sync_dir;
        let inserting: HashSet<&str> = plan.inserts.iter().map(|t| t.id.as_str()).collect();
        let mut roots: Vec<&Task> = plan
            .inserts
            .iter()
            .filter(|t| t.parent_id.as_deref().is_none_or(|p| !inserting.contains(p)))
            .collect();
        roots.sort_by_key(|t| (section_order(snapshot, t), t.order));

        for task in roots {
            let ids = tree_ids(task, &plan.inserts);
            if let Some(parent_id) = task.parent_id.as_deref()
                && let Some((path, _)) = corpus.locate(parent_id)
                && let Some(draft) = drafts.get_mut(path)
            {
                let parsed = ParsedDocument::from_lines(draft.lines.clone());
                if let Some(parent) = parsed.task(parent_id) {
                    let (at, indent) = child_insertion(parent);
                    insert_block(
                        &mut draft.lines,
                        at,
                        format_task_tree(task, &plan.inserts, indent, today),
                    );
                    draft.rendered.extend(ids);
                    continue;
                }
            }

            let title = snapshot
                .project(&task.project_id)
                .map_or(task.project_id.as_str(), |p| p.name.as_str());
            let path = document_path(sync_dir, title);
            if corpus.is_unreadable(&path) {
                self.report
                    .stats
                    .errors
                    .push(format!("task {}: {} is unreadable, not inserted", task.id, path));
                continue;
            }
            let section = task
                .section_id
                .as_deref()
                .and_then(|id| snapshot.section(id))
                .map(|s| s.name.as_str());
            let draft = drafts.entry(path).or_insert_with(|| Draft {
                lines: new_document(title),
                original: None,
                rendered: HashSet::new(),
            });
            insert_in_section(
                &mut draft.lines,
                section,
                format_task_tree(task, &plan.inserts, 0, today),
            );
            draft.rendered.extend(ids);
        }
    }

    async fn write_document(
        &mut self,
        path: &str,
        lines: &[String],
        create: bool,
    ) -> Result<(), DocumentError> {
        let orch = self.orch;
        let docs = &orch.docs;
        if create && let Some((dir, _)) = path.rsplit_once('/') {
            docs.create_dir(dir).await?;
        }
        docs.write(path, &ParsedDocument::render(lines)).await?;
        if self.written.insert(path.to_string()) {
            if create {
                self.report.stats.files_created += 1;
            } else {
                self.report.stats.files_updated += 1;
            }
        }
        debug!(path = %path, created = create, "document written");
        Ok(())
    }

    /// Bring mappings in line with what a document now holds on disk.
    /// Lines this run wrote commit with their parsed view. Lines it didn't
    /// touch commit only if they still show the current remote task;
    /// anything else just has its mapping follow the line.
    fn commit_document(
        &mut self,
        path: &str,
        lines: &[String],
        rendered: &HashSet<String>,
        tasks: &HashMap<&str, &Task>,
        untouchable: &HashSet<&str>,
    ) {
        let doc = ParsedDocument::from_lines(lines.to_vec());
        let mut seen = HashSet::new();
        for local in &doc.tasks {
            let Some(id) = local.id.as_deref() else {
                continue;
            };
            let Some(task) = tasks.get(id) else {
                continue;
            };
            // duplicated lines: the first one owns the mapping
            if !seen.insert(id) {
                continue;
            }
            let owner = self
                .claimed
                .entry(id.to_string())
                .or_insert_with(|| path.to_string());
            if owner.as_str() != path {
                continue;
            }

            if rendered.contains(id) {
                self.mappings.commit(task, path, local.line, local.view.clone());
                continue;
            }
            let hash = snapshot_hash(task);
            let shows_remote = !untouchable.contains(id) && local.hash.as_deref() == Some(hash.as_str());
            let stale = self
                .mappings
                .get(id)
                .is_none_or(|m| m.checksum != hash || m.snapshot.as_ref() != Some(&local.view));
            if shows_remote && stale {
                self.mappings.commit(task, path, local.line, local.view.clone());
            } else {
                self.mappings.update_mapping(id, path, local.line);
            }
        }
    }

    async fn write_remote(
        &mut self,
        snapshot: &RemoteSnapshot,
        corpus: &LocalCorpus,
        plan: &Plan,
        on_disk: IndexMap<String, Vec<String>>,
    ) {
        let orch = self.orch;
        let state_dir = &orch.state_dir;
        let mut post: HashMap<String, Task> = HashMap::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut closed_removed: Vec<String> = Vec::new();

        for op in &plan.ops {
            let id = op.task_id.as_str();
            let Some(current) = post.get(id).or_else(|| snapshot.task(id)).cloned() else {
                continue;
            };
            let result = match op.update() {
                None => orch.remote.close(id).await.map(|()| Task {
                    is_completed: true,
                    ..current
                }),
                Some(update) => orch.remote.update(id, &update).await,
            };
            match result {
                Ok(task) => {
                    info!(task_id = %id, op = ?op.op, excerpt = %excerpt(&task.content), "remote task written");
                    let reverse = self.reverse();
                    match op.op {
                        Operation::Complete { reason } => {
                            reverse.completed += 1;
                            if reason == CloseReason::Removal {
                                closed_removed.push(id.to_string());
                            }
                        }
                        _ => reverse.updated += 1,
                    }
                    post.insert(id.to_string(), task);
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "remote write failed");
                    log_audit(
                        state_dir,
                        AuditEntry::new(AuditCategory::Failure, "remote write failed")
                            .field("Task", id)
                            .field("Operation", format!("{:?}", op.op))
                            .field("Error", &e),
                    );
                    self.reverse().errors.push(format!("task {}: {}", id, e));
                    failed.insert(id.to_string());
                }
            }
        }

        let mut recreated: HashMap<String, Task> = HashMap::new();
        for item in &plan.recreate {
            match self.recreate(snapshot, corpus, item).await {
                Ok(task) => {
                    info!(old_id = %item.old_id, task_id = %task.id, "remote task recreated");
                    self.reverse().created += 1;
                    recreated.insert(item.old_id.clone(), task);
                }
                Err(e) => {
                    warn!(task_id = %item.old_id, error = %e, "recreate failed");
                    log_audit(
                        state_dir,
                        AuditEntry::new(AuditCategory::Failure, "recreate failed")
                            .field("Task", &item.old_id)
                            .field("Error", &e),
                    );
                    self.reverse()
                        .errors
                        .push(format!("task {}: recreate failed: {}", item.old_id, e));
                }
            }
        }

        // A task with any failed write keeps its local line for the next run
        for id in &failed {
            post.remove(id);
        }
        for id in &closed_removed {
            post.remove(id);
            self.mappings.remove_mapping(id);
        }
        if post.is_empty() && recreated.is_empty() {
            return;
        }

        let mut extra = post.clone();
        extra.extend(recreated.values().map(|t| (t.id.clone(), t.clone())));
        let tasks = task_index(snapshot, &extra);
        let untouchable = plan.untouchable();

        for (path, lines) in on_disk {
            let doc = ParsedDocument::from_lines(lines.clone());
            let targets: Vec<(&LocalTask, &Task)> = doc
                .tasks
                .iter()
                .filter_map(|local| {
                    let id = local.id.as_deref()?;
                    if plan.held.contains(id)
                        || self.claimed.get(id).is_some_and(|owner| *owner != path)
                    {
                        return None;
                    }
                    post.get(id).or_else(|| recreated.get(id)).map(|t| (local, t))
                })
                .collect();
            if targets.is_empty() {
                continue;
            }

            let mut refreshed_lines = lines.clone();
            let mut refreshed = HashSet::new();
            for (local, task) in targets.iter().rev() {
                replace_block(
                    &mut refreshed_lines,
                    local,
                    format_task_block(task, local.indent, self.today),
                );
                refreshed.insert(task.id.clone());
            }
            if refreshed_lines != lines
                && let Err(e) = self.write_document(&path, &refreshed_lines, false).await
            {
                warn!(path = %path, error = %e, "could not write document");
                self.report.stats.errors.push(e.to_string());
                continue;
            }
            for (local, _) in &targets {
                if let Some(old_id) = local.id.as_deref()
                    && recreated.contains_key(old_id)
                {
                    self.mappings.remove_mapping(old_id);
                }
            }
            self.commit_document(&path, &refreshed_lines, &refreshed, &tasks, &untouchable);
        }
    }

    /// Create a remote task from a line whose remote task is gone, in the
    /// project whose document holds the line
    async fn recreate(
        &self,
        snapshot: &RemoteSnapshot,
        corpus: &LocalCorpus,
        item: &Recreate,
    ) -> Result<Task, String> {
        let (path, local) = corpus
            .locate(&item.old_id)
            .ok_or_else(|| "line is no longer in any document".to_string())?;
        let sync_dir = &self.orch.config.sync_dir;
        let project = snapshot
            .projects
            .iter()
            .find(|p| document_path(sync_dir, &p.name) == path)
            .ok_or_else(|| format!("no project owns {}", path))?;
        let section_name = corpus
            .document(path)
            .and_then(|doc| doc.section_at(local.line))
            .map(|s| s.name.as_str());
        let section_id = section_name.and_then(|name| {
            snapshot
                .sections
                .iter()
                .find(|s| s.project_id == project.id && s.name == name)
                .map(|s| s.id.clone())
        });
        let opts = CreateOptions {
            description: item.view.description.clone(),
            priority: item.view.priority,
            due_date: item.view.due_date,
            duration: item.view.duration,
            labels: item.view.labels.clone(),
            project_id: project.id.clone(),
            section_id,
            parent_id: local
                .parent_id
                .clone()
                .filter(|p| snapshot.task(p).is_some()),
        };
        self.orch
            .remote
            .create(&item.view.content, &opts)
            .await
            .map_err(|e| e.to_string())
    }

    async fn finish(&mut self, plan: &Plan) {
        for id in &plan.forget {
            self.mappings.remove_mapping(id);
        }
        let pruned = self.mappings.cleanup_orphaned(self.orch.docs.as_ref()).await;
        if pruned > 0 {
            debug!(pruned, "orphaned mappings removed");
        }
        if let Err(e) = self.mappings.save_if_dirty() {
            warn!(error = %e, "could not save mappings");
            self.report.stats.errors.push(e.to_string());
        }
        self.report.stats.last_sync_time = Some(Utc::now());
        self.enter(SyncPhase::Done);

        let stats = &self.report.stats;
        info!(
            tasks = stats.tasks_processed,
            created = stats.files_created,
            updated = stats.files_updated,
            efficiency = %format!("{:.0}%", self.report.efficiency * 100.0),
            incremental = self.report.incremental,
            manual = self.report.manual.len(),
            errors = self.report.errors().count(),
            "sync finished"
        );
    }
}

/// Remote tasks by id, with `overrides` taking precedence
fn task_index<'a>(
    snapshot: &'a RemoteSnapshot,
    overrides: &'a HashMap<String, Task>,
) -> HashMap<&'a str, &'a Task> {
    snapshot
        .tasks
        .iter()
        .map(|t| (t.id.as_str(), t))
        .chain(overrides.iter().map(|(id, t)| (id.as_str(), t)))
        .collect()
}

/// Whether this line is where the corpus locates the task
fn is_canonical(corpus: &LocalCorpus, id: &str, path: &str, local: &LocalTask) -> bool {
    corpus
        .locate(id)
        .is_some_and(|(p, l)| p == path && l.line == local.line)
}

fn in_sync_dir(path: &str, sync_dir: &str) -> bool {
    let dir = sync_dir.trim_matches('/');
    dir.is_empty()
        || path
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn section_order(snapshot: &RemoteSnapshot, task: &Task) -> i64 {
    task.section_id
        .as_deref()
        .and_then(|id| snapshot.section(id))
        .map_or(i64::MIN, |s| s.order)
}

/// Ids of a task and every descendant in `all`
fn tree_ids(task: &Task, all: &[Task]) -> Vec<String> {
    let mut ids = vec![task.id.clone()];
    for child in all
        .iter()
        .filter(|t| t.parent_id.as_deref() == Some(task.id.as_str()))
    {
        ids.extend(tree_ids(child, all));
    }
    ids
}
