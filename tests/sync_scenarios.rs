use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use tasksync::io::config_io::{backup_dir, mapping_path};
use tasksync::io::document_store::{DocumentError, DocumentStore, FsDocumentStore};
use tasksync::io::lock::FileLock;
use tasksync::io::mapping_store::MappingStore;
use tasksync::io::remote::{
    CreateOptions, Deadline, RemoteError, RemoteTaskService, SnapshotRemote, TaskUpdate,
};
use tasksync::model::config::SyncConfig;
use tasksync::model::remote::{Project, RemoteSnapshot};
use tasksync::model::task::{Due, Priority, Task};
use tasksync::ops::{SyncOrchestrator, SyncPhase};
use tasksync::parse::hash::snapshot_hash;

/// Snapshot remote that counts writes and can be made slow
struct CountingRemote {
    inner: SnapshotRemote,
    fetch_delay: Duration,
    closes: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
}

impl CountingRemote {
    fn new(snapshot: RemoteSnapshot) -> Self {
        CountingRemote {
            inner: SnapshotRemote::in_memory(snapshot),
            fetch_delay: Duration::ZERO,
            closes: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }

    fn slow(snapshot: RemoteSnapshot, delay: Duration) -> Self {
        CountingRemote {
            fetch_delay: delay,
            ..CountingRemote::new(snapshot)
        }
    }
}

#[async_trait]
impl RemoteTaskService for CountingRemote {
    async fn is_ready(&self) -> bool {
        true
    }

    async fn fetch_all(&self, deadline: Deadline) -> Result<RemoteSnapshot, RemoteError> {
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        self.inner.fetch_all(deadline).await
    }

    async fn close(&self, id: &str) -> Result<(), RemoteError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close(id).await
    }

    async fn create(&self, content: &str, opts: &CreateOptions) -> Result<Task, RemoteError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(content, opts).await
    }

    async fn update(&self, id: &str, update: &TaskUpdate) -> Result<Task, RemoteError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, update).await
    }
}

/// Filesystem store that fails every write to one path
struct FailingWrites {
    inner: FsDocumentStore,
    path: String,
}

#[async_trait]
impl DocumentStore for FailingWrites {
    async fn read(&self, path: &str) -> Result<String, DocumentError> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, text: &str) -> Result<(), DocumentError> {
        if path == self.path {
            return Err(DocumentError::Write {
                path: path.to_string(),
                source: std::io::Error::other("disk full"),
            });
        }
        self.inner.write(path, text).await
    }

    async fn list(&self) -> Result<Vec<String>, DocumentError> {
        self.inner.list().await
    }

    async fn exists(&self, path: &str) -> bool {
        self.inner.exists(path).await
    }

    async fn create_dir(&self, path: &str) -> Result<(), DocumentError> {
        self.inner.create_dir(path).await
    }
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

fn home() -> Project {
    Project {
        id: "p1".into(),
        name: "Home".into(),
        order: 0,
        parent_id: None,
        color: None,
        is_inbox: false,
    }
}

fn groceries() -> Task {
    let mut task = Task::new("1", "Buy groceries", "p1");
    task.priority = Priority::URGENT;
    task.due = Some(Due::on(NaiveDate::from_ymd_opt(2024, 5, 26).unwrap()));
    task.labels = vec!["urgent".into()];
    task
}

fn plumber() -> Task {
    let mut task = Task::new("2", "Call the plumber", "p1");
    task.order = 2;
    task
}

fn snapshot(tasks: Vec<Task>) -> RemoteSnapshot {
    RemoteSnapshot {
        tasks,
        projects: vec![home()],
        ..RemoteSnapshot::default()
    }
}

struct Workspace {
    tmp: TempDir,
    docs: Arc<FsDocumentStore>,
}

impl Workspace {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let docs = Arc::new(FsDocumentStore::new(tmp.path()));
        Workspace { tmp, docs }
    }

    fn state_dir(&self) -> PathBuf {
        self.tmp.path().join(".tasksync")
    }

    fn orchestrator(&self, remote: Arc<dyn RemoteTaskService>, config: SyncConfig) -> SyncOrchestrator {
        SyncOrchestrator::new(remote, self.docs.clone(), config, &self.state_dir()).with_today(today())
    }

    async fn read(&self, path: &str) -> String {
        self.docs.read(path).await.unwrap()
    }

    async fn write(&self, path: &str, text: &str) {
        self.docs.write(path, text).await.unwrap();
    }

    async fn edit(&self, path: &str, from: &str, to: &str) {
        let text = self.read(path).await;
        assert!(text.contains(from), "missing {:?} in\n{}", from, text);
        self.write(path, &text.replace(from, to)).await;
    }

    fn mappings(&self) -> MappingStore {
        MappingStore::initialize(&mapping_path(&self.state_dir()))
    }
}

#[tokio::test]
async fn task_renders_as_one_line_with_its_marker() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries()])));
    let report = ws.orchestrator(remote, SyncConfig::default()).run().await;

    assert_eq!(report.phase, SyncPhase::Done);
    let expected = format!(
        "- [ ] Buy groceries 🔴 📅 5/26/2024 #urgent <!-- id:1:{} -->",
        snapshot_hash(&groceries())
    );
    let text = ws.read("Tasks/Home.md").await;
    assert!(text.lines().any(|l| l == expected), "missing {:?} in\n{}", expected, text);
}

#[tokio::test]
async fn local_completion_closes_the_remote_task_once() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries()])));
    let orch = ws.orchestrator(remote.clone(), SyncConfig::default());
    orch.run().await;

    let text = ws.read("Tasks/Home.md").await;
    ws.write("Tasks/Home.md", &text.replace("- [ ] Buy", "- [x] Buy")).await;

    let report = orch.run().await;
    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    assert_eq!(remote.updates.load(Ordering::SeqCst), 0);
    assert!(remote.inner.snapshot().tasks[0].is_completed);

    let reverse = report.reverse.unwrap();
    assert_eq!(reverse.completed, 1);
    assert_eq!(reverse.conflicts, 1);
    assert!(report.manual.is_empty());

    // the archive was taken before the close and still shows the task open
    assert!(reverse.backup_created);
    let file = reverse.backup_file.unwrap();
    assert!(file.starts_with(backup_dir(&ws.state_dir())));
    let archived: serde_json::Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
    assert_eq!(archived["data"]["tasks"][0]["is_completed"], serde_json::json!(false));

    let after = ws.read("Tasks/Home.md").await;
    let completed = format!("<!-- id:1:{} -->", snapshot_hash(&remote.inner.snapshot().tasks[0]));
    assert!(after.contains("- [x] Buy groceries"));
    assert!(after.contains(&completed));

    // a further run has nothing left to push
    let again = orch.run().await;
    assert_eq!(again.phase, SyncPhase::Done);
    assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    assert_eq!(ws.read("Tasks/Home.md").await, after);
}

#[tokio::test]
async fn every_bidirectional_run_is_archived() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries()])));
    let orch = ws.orchestrator(remote.clone(), SyncConfig::default());
    orch.run().await;
    let report = orch.run().await;

    assert_eq!(remote.closes.load(Ordering::SeqCst), 0);
    assert_eq!(remote.updates.load(Ordering::SeqCst), 0);
    let reverse = report.reverse.unwrap();
    assert!(reverse.backup_created);
    assert!(reverse.backup_file.unwrap().exists());
    assert_eq!(fs::read_dir(backup_dir(&ws.state_dir())).unwrap().count(), 2);
}

#[tokio::test]
async fn backups_beyond_retention_are_pruned() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries()])));
    let config = SyncConfig {
        backup_retention: 2,
        ..SyncConfig::default()
    };
    let orch = ws.orchestrator(remote, config);
    for _ in 0..4 {
        orch.run().await;
    }
    assert_eq!(fs::read_dir(backup_dir(&ws.state_dir())).unwrap().count(), 2);
}

#[tokio::test]
async fn corrupt_mapping_record_is_quarantined() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries()])));
    ws.orchestrator(remote.clone(), SyncConfig::default()).run().await;

    let path = mapping_path(&ws.state_dir());
    fs::write(&path, "{ not json").unwrap();

    let store = MappingStore::initialize(&path);
    assert_eq!(store.len(), 0);
    let aside = store.quarantined().unwrap().to_path_buf();
    assert!(aside.exists());
    assert_eq!(fs::read_to_string(&aside).unwrap(), "{ not json");
    assert!(!path.exists());

    // a run on an empty store picks the marked line back up
    let report = ws.orchestrator(remote, SyncConfig::default()).run().await;
    assert_eq!(report.phase, SyncPhase::Done);
    let reloaded = MappingStore::initialize(&path);
    assert_eq!(reloaded.get_location("1"), Some(("Tasks/Home.md", 2)));
}

#[tokio::test]
async fn few_changes_take_the_incremental_path() {
    let ws = Workspace::new();
    let tasks: Vec<Task> = (1..=100)
        .map(|i| {
            let mut task = Task::new(&i.to_string(), &format!("Task number {}", i), "p1");
            task.order = i;
            task
        })
        .collect();
    let remote = Arc::new(CountingRemote::new(snapshot(tasks)));
    let orch = ws.orchestrator(remote.clone(), SyncConfig::default());
    let first = orch.run().await;
    assert_eq!(first.changes.new, 100);
    assert!(!first.incremental);

    let mut edited = remote.inner.snapshot();
    for task in edited.tasks.iter_mut().take(5) {
        task.content.push_str(" (edited)");
    }
    remote.inner.replace(edited).unwrap();

    let report = orch.run().await;
    assert_eq!(report.changes.total, 100);
    assert_eq!(report.changes.changed, 5);
    assert_eq!(report.changes.unchanged, 95);
    assert!((report.efficiency - 0.95).abs() < 1e-9);
    assert!(report.incremental);
    assert!(ws.read("Tasks/Home.md").await.contains("- [ ] Task number 5 (edited)"));
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_fails_without_touching_mappings() {
    let ws = Workspace::new();
    let fast = Arc::new(CountingRemote::new(snapshot(vec![groceries()])));
    ws.orchestrator(fast, SyncConfig::default()).run().await;
    let path = mapping_path(&ws.state_dir());
    let before = fs::read(&path).unwrap();
    let doc_before = ws.read("Tasks/Home.md").await;

    let mut changed = groceries();
    changed.content = "Buy more groceries".into();
    let slow = Arc::new(CountingRemote::slow(snapshot(vec![changed]), Duration::from_secs(60)));
    let config = SyncConfig {
        fetch_timeout_secs: 5,
        ..SyncConfig::default()
    };
    let report = ws.orchestrator(slow, config).run().await;

    assert_eq!(report.phase, SyncPhase::Failed);
    assert_eq!(report.errors().collect::<Vec<_>>(), vec!["remote fetch timed out after 5s"]);
    assert_eq!(fs::read(&path).unwrap(), before);
    assert_eq!(ws.read("Tasks/Home.md").await, doc_before);
}

#[tokio::test(start_paused = true)]
async fn overlapping_run_is_rejected() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::slow(
        snapshot(vec![groceries()]),
        Duration::from_secs(10),
    ));
    let orch = ws.orchestrator(remote, SyncConfig::default());

    let (first, second) = tokio::join!(orch.run(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        orch.run().await
    });

    assert_eq!(first.phase, SyncPhase::Done);
    assert_eq!(second.phase, SyncPhase::Failed);
    assert_eq!(second.errors().collect::<Vec<_>>(), vec!["a sync is already running"]);
}

#[tokio::test]
async fn state_dir_held_by_another_process_is_rejected() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries()])));
    let _held = FileLock::try_acquire(&ws.state_dir()).unwrap();

    let report = ws.orchestrator(remote, SyncConfig::default()).run().await;
    assert!(report.is_failed());
    assert!(!ws.docs.exists("Tasks/Home.md").await);
}

#[tokio::test]
async fn documents_outside_the_sync_dir_are_left_alone() {
    let ws = Workspace::new();
    let notes = format!("- [ ] Stray copy <!-- id:1:{} -->\n", snapshot_hash(&groceries()));
    ws.write("Notes/todo.md", &notes).await;

    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries()])));
    let report = ws.orchestrator(remote, SyncConfig::default()).run().await;

    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!(report.stats.files_created, 1);
    assert_eq!(ws.read("Notes/todo.md").await, notes);
}

#[tokio::test]
async fn hash_words_in_content_survive_a_content_push() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![Task::new("1", "Fix issue #42", "p1")])));
    let orch = ws.orchestrator(remote.clone(), SyncConfig::default());
    orch.run().await;
    assert!(ws.read("Tasks/Home.md").await.contains(r"- [ ] Fix issue \#42 <!-- id:1:"));

    let quiet = orch.run().await;
    assert_eq!(quiet.changes.unchanged, 1);
    assert_eq!(quiet.reverse.unwrap().conflicts, 0);
    assert_eq!(remote.updates.load(Ordering::SeqCst), 0);

    ws.edit("Tasks/Home.md", "Fix issue", "Fix the login crash issue").await;
    let report = orch.run().await;
    assert_eq!(report.reverse.unwrap().updated, 1);
    let pushed = &remote.inner.snapshot().tasks[0];
    assert_eq!(pushed.content, "Fix the login crash issue #42");
    assert!(pushed.labels.is_empty());
}

#[tokio::test]
async fn remote_deletion_recreates_the_open_line() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries(), plumber()])));
    let orch = ws.orchestrator(remote.clone(), SyncConfig::default());
    orch.run().await;

    remote.inner.replace(snapshot(vec![plumber()])).unwrap();
    let report = orch.run().await;

    assert_eq!(report.phase, SyncPhase::Done);
    let reverse = report.reverse.unwrap();
    assert!(reverse.backup_created);
    assert_eq!(reverse.created, 1);
    assert_eq!(remote.creates.load(Ordering::SeqCst), 1);

    let tasks = remote.inner.snapshot().tasks;
    assert_eq!(tasks.len(), 2);
    let recreated = &tasks[1];
    assert_eq!(recreated.id, "3");
    assert_eq!(recreated.content, "Buy groceries");
    assert_eq!(recreated.priority, Priority::URGENT);
    assert_eq!(recreated.labels, vec!["urgent"]);
    assert_eq!(recreated.due_date(), NaiveDate::from_ymd_opt(2024, 5, 26));

    let text = ws.read("Tasks/Home.md").await;
    assert!(text.contains(&format!("<!-- id:3:{} -->", snapshot_hash(recreated))));
    assert!(!text.contains("<!-- id:1:"));
    let store = ws.mappings();
    assert!(store.get("1").is_none());
    assert!(store.get("3").is_some());

    let again = orch.run().await;
    assert_eq!(again.phase, SyncPhase::Done);
    assert_eq!(remote.creates.load(Ordering::SeqCst), 1);
    assert_eq!(ws.read("Tasks/Home.md").await, text);
}

#[tokio::test]
async fn local_removal_closes_the_remote_task() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries(), plumber()])));
    let orch = ws.orchestrator(remote.clone(), SyncConfig::default());
    orch.run().await;

    let text: String = ws
        .read("Tasks/Home.md")
        .await
        .lines()
        .filter(|l| !l.contains("Call the plumber"))
        .map(|l| format!("{}\n", l))
        .collect();
    ws.write("Tasks/Home.md", &text).await;

    let report = orch.run().await;
    assert_eq!(report.reverse.unwrap().completed, 1);
    assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    assert!(remote.inner.snapshot().tasks[1].is_completed);
    assert!(ws.mappings().get("2").is_none());

    orch.run().await;
    assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    assert!(!ws.read("Tasks/Home.md").await.contains("Call the plumber"));
}

#[tokio::test]
async fn field_pushes_keep_remote_only_fields() {
    let ws = Workspace::new();
    let mut rent = Task::new("1", "Pay rent", "p1");
    rent.order = 5;
    rent.due = Some(Due::on(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()));
    rent.meta.assignee_id = Some("u7".into());
    rent.meta.collaborator_ids = vec!["u7".into(), "u8".into()];
    rent.meta.comment_count = 2;
    let remote = Arc::new(CountingRemote::new(snapshot(vec![rent.clone()])));
    let orch = ws.orchestrator(remote.clone(), SyncConfig::default());
    orch.run().await;

    ws.edit(
        "Tasks/Home.md",
        "- [ ] Pay rent 📅 6/1/2024",
        "- [ ] Pay the June rent 🟠 📅 5/20/2024",
    )
    .await;
    let report = orch.run().await;

    let reverse = report.reverse.unwrap();
    assert_eq!(reverse.updated, 3);
    assert!(reverse.skipped.is_empty(), "{:?}", reverse.skipped);
    let pushed = remote.inner.snapshot().tasks[0].clone();
    assert_eq!(pushed.content, "Pay the June rent");
    assert_eq!(pushed.priority, Priority::new(3).unwrap());
    assert_eq!(pushed.due_date(), NaiveDate::from_ymd_opt(2024, 5, 20));
    assert_eq!(pushed.order, 5);
    assert_eq!(pushed.meta, rent.meta);

    let text = ws.read("Tasks/Home.md").await;
    assert!(text.contains(&format!(
        "- [ ] Pay the June rent 🟠 📅 5/20/2024 <!-- id:1:{} -->",
        snapshot_hash(&pushed)
    )));
    orch.run().await;
    assert_eq!(remote.updates.load(Ordering::SeqCst), 3);
    assert_eq!(ws.read("Tasks/Home.md").await, text);
}

#[tokio::test]
async fn failed_backup_limits_pushes_to_completions() {
    let ws = Workspace::new();
    let remote = Arc::new(CountingRemote::new(snapshot(vec![groceries(), plumber()])));
    let orch = ws.orchestrator(remote.clone(), SyncConfig::default());
    orch.run().await;

    // a file where the backup directory should be
    let backups = backup_dir(&ws.state_dir());
    fs::remove_dir_all(&backups).unwrap();
    fs::write(&backups, "").unwrap();

    ws.edit("Tasks/Home.md", "- [ ] Call the plumber", "- [x] Call the plumber").await;
    ws.edit("Tasks/Home.md", "📅 5/26/2024", "📅 5/20/2024").await;
    let report = orch.run().await;

    assert_eq!(report.phase, SyncPhase::Done);
    let reverse = report.reverse.unwrap();
    assert!(!reverse.backup_created);
    assert!(reverse.errors.iter().any(|e| e.starts_with("backup failed")));
    assert_eq!(reverse.completed, 1);
    assert_eq!(
        reverse.skipped,
        vec!["task 1: update due date skipped: no backup this run; only completions are pushed"]
    );
    assert_eq!(remote.closes.load(Ordering::SeqCst), 1);
    assert_eq!(remote.updates.load(Ordering::SeqCst), 0);

    let tasks = remote.inner.snapshot().tasks;
    assert!(tasks[1].is_completed);
    assert_eq!(tasks[0].due_date(), NaiveDate::from_ymd_opt(2024, 5, 26));
    let text = ws.read("Tasks/Home.md").await;
    assert!(text.contains("- [ ] Buy groceries 🔴 📅 5/20/2024"));
    assert!(text.contains("- [x] Call the plumber"));
}

#[tokio::test]
async fn failed_document_write_leaves_other_documents_going() {
    let ws = Workspace::new();
    let mut remote_state = snapshot(vec![groceries(), Task::new("5", "Send the invoice", "p2")]);
    remote_state.projects.push(Project {
        id: "p2".into(),
        name: "Work".into(),
        ..home()
    });
    let remote = Arc::new(CountingRemote::new(remote_state));
    let failing = Arc::new(FailingWrites {
        inner: FsDocumentStore::new(ws.tmp.path()),
        path: "Tasks/Work.md".into(),
    });
    let report = SyncOrchestrator::new(remote.clone(), failing, SyncConfig::default(), &ws.state_dir())
        .with_today(today())
        .run()
        .await;

    assert_eq!(report.phase, SyncPhase::Done);
    assert_eq!(report.stats.files_created, 1);
    assert_eq!(report.stats.errors, vec!["could not write Tasks/Work.md: disk full"]);
    assert!(ws.docs.exists("Tasks/Home.md").await);
    assert!(!ws.docs.exists("Tasks/Work.md").await);
    let store = ws.mappings();
    assert!(store.get("1").is_some());
    assert!(store.get("5").is_none());

    let retry = ws.orchestrator(remote, SyncConfig::default()).run().await;
    assert_eq!(retry.stats.files_created, 1);
    assert!(ws.read("Tasks/Work.md").await.contains("- [ ] Send the invoice"));
    assert!(ws.mappings().get("5").is_some());
}
