mod init;
pub use init::cmd_init;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use crate::cli::commands::*;
use crate::cli::output::*;
use crate::io::audit::{self, PRUNE_AGE_DAYS};
use crate::io::backup::BackupArchiver;
use crate::io::config_io::{self, ConfigError, STATE_DIR};
use crate::io::document_store::FsDocumentStore;
use crate::io::lock::FileLock;
use crate::io::mapping_store::MappingStore;
use crate::io::remote::{Deadline, RemoteError, SnapshotRemote};
use crate::model::config::SyncConfig;
use crate::ops::sync::SyncOrchestrator;
use crate::util::unicode::excerpt;

/// How long maintenance commands wait for a running sync
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a command operates: the document root, the state directory and the
/// remote snapshot file
pub struct Workspace {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub remote_file: PathBuf,
}

impl Workspace {
    pub fn from_cli(cli: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        let root = match cli.dir {
            Some(ref dir) => std::fs::canonicalize(dir)
                .map_err(|e| format!("cannot resolve -C path '{}': {}", dir, e))?,
            None => std::env::current_dir()?,
        };
        let state_dir = cli
            .state_dir
            .as_ref()
            .map_or_else(|| root.join(STATE_DIR), PathBuf::from);
        let remote_file = cli
            .remote_file
            .as_ref()
            .map_or_else(|| state_dir.join("remote.json"), PathBuf::from);
        Ok(Workspace {
            root,
            state_dir,
            remote_file,
        })
    }

    fn config(&self) -> Result<SyncConfig, ConfigError> {
        config_io::read_config(&self.state_dir)
    }

    fn remote(&self) -> Result<SnapshotRemote, RemoteError> {
        SnapshotRemote::open(&self.remote_file)
    }

    fn docs(&self) -> FsDocumentStore {
        FsDocumentStore::new(&self.root)
    }

    fn mappings(&self) -> MappingStore {
        MappingStore::initialize(&config_io::mapping_path(&self.state_dir))
    }

    fn archiver(&self, config: &SyncConfig) -> BackupArchiver {
        BackupArchiver::new(
            &config_io::backup_dir(&self.state_dir),
            config.backup_retention,
            &config.plugin_version,
        )
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let ws = Workspace::from_cli(&cli)?;
    let json = cli.json;

    match cli.command {
        Commands::Init => cmd_init(&ws),
        Commands::Sync => cmd_sync(&ws, json).await,
        Commands::Status => cmd_status(&ws, json).await,
        Commands::Check(args) => cmd_check(&ws, args, json).await,
        Commands::Backup(cmd) => match cmd.action {
            BackupAction::Create => cmd_backup_create(&ws, json).await,
            BackupAction::List => cmd_backup_list(&ws, json),
            BackupAction::Restore(args) => cmd_backup_restore(&ws, args, json),
        },
        Commands::Log(args) => cmd_log(&ws, args, json),
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

async fn cmd_sync(ws: &Workspace, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = ws.config()?;
    let remote = Arc::new(ws.remote()?);
    let docs = Arc::new(ws.docs());
    let orchestrator = SyncOrchestrator::new(remote, docs, config, &ws.state_dir);

    let report = orchestrator.run().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_sync_report(&report) {
            println!("{}", line);
        }
    }

    if report.is_failed() {
        return Err("sync failed".into());
    }
    Ok(())
}

async fn cmd_status(ws: &Workspace, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = ws.config()?;
    let mappings = ws.mappings();
    let orphaned = mappings.find_orphaned(&ws.docs()).await.len();
    let backups = ws.archiver(&config).list_backups()?;
    let latest_backup = backups.first().map(|b| b.path.display().to_string());

    if json {
        let status = StatusJson {
            mappings: mappings.len(),
            orphaned,
            last_sync: mappings.last_updated(),
            backups: backups.len(),
            latest_backup,
        };
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let last_sync = mappings
        .last_updated()
        .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string());
    println!("Mappings:  {}", mappings.len());
    println!("Orphaned:  {}", orphaned);
    println!("Last sync: {}", last_sync);
    println!("Backups:   {}", backups.len());
    if let Some(latest) = latest_backup {
        println!("Latest:    {}", latest);
    }
    Ok(())
}

async fn cmd_check(
    ws: &Workspace,
    args: CheckArgs,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let _lock = if args.fix {
        Some(FileLock::acquire(&ws.state_dir, LOCK_TIMEOUT)?)
    } else {
        None
    };
    let docs = ws.docs();
    let mut mappings = ws.mappings();
    let orphaned = mappings.find_orphaned(&docs).await;

    let mut removed = 0;
    if args.fix && !orphaned.is_empty() {
        removed = mappings.cleanup_orphaned(&docs).await;
        mappings.save()?;
    }

    if json {
        let result = CheckJson {
            orphaned: orphaned.iter().map(orphan_to_json).collect(),
            removed,
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if orphaned.is_empty() {
        println!("No orphaned mappings");
        return Ok(());
    }
    println!("Orphaned mappings:");
    for m in &orphaned {
        println!(
            "  {} {}:{} \"{}\"",
            m.task_id,
            m.document_path,
            m.line_number + 1,
            excerpt(&m.content)
        );
    }
    if args.fix {
        println!("Removed {}", removed);
    } else {
        println!("Run `tsync check --fix` to remove them");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

async fn cmd_backup_create(ws: &Workspace, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = ws.config()?;
    let remote = ws.remote()?;
    let deadline = Deadline::after(Duration::from_secs(config.fetch_timeout_secs));
    let outcome = ws
        .archiver(&config)
        .create_pre_sync_backup(&remote, deadline, "manual")
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    match outcome.backup_file {
        Some(file) if outcome.success => {
            if !json {
                println!("Backup written to {}", file.display());
            }
            Ok(())
        }
        _ => Err(format!(
            "backup failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        )
        .into()),
    }
}

fn cmd_backup_list(ws: &Workspace, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = ws.config()?;
    let backups = ws.archiver(&config).list_backups()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&backups)?);
    } else if backups.is_empty() {
        println!("No backups");
    } else {
        for backup in &backups {
            println!("{}", format_backup_line(backup));
        }
    }
    Ok(())
}

fn cmd_backup_restore(
    ws: &Workspace,
    args: RestoreArgs,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ws.config()?;
    let archiver = ws.archiver(&config);
    let given = PathBuf::from(&args.file);
    let path = if given.exists() {
        given
    } else {
        archiver.dir().join(&args.file)
    };

    let record = archiver.restore_from_backup(&path)?;
    let _lock = FileLock::acquire(&ws.state_dir, LOCK_TIMEOUT)?;
    let tasks = record.data.tasks.len();
    ws.remote()?.replace(record.data)?;

    if json {
        let result = serde_json::json!({
            "restored": path,
            "tasks": tasks,
            "taken": record.timestamp,
            "remote": ws.remote_file,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "Restored {} tasks from {} (taken {}) into {}",
            tasks,
            display_name(&path),
            record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            ws.remote_file.display()
        );
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

fn cmd_log(ws: &Workspace, args: LogArgs, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if args.prune || args.prune_days.is_some() {
        let days = args.prune_days.unwrap_or(PRUNE_AGE_DAYS);
        let age = TimeDelta::try_days(days).ok_or("--prune-days is out of range")?;
        let removed = audit::prune_audit(&ws.state_dir, Utc::now() - age)?;
        if json {
            println!("{}", serde_json::json!({ "removed": removed }));
        } else {
            println!("Removed {} entries older than {} days", removed, days);
        }
        return Ok(());
    }

    let entries = audit::read_audit_entries(&ws.state_dir, Some(args.limit.unwrap_or(10)), None);
    if json {
        let values: Vec<serde_json::Value> = entries.iter().map(|e| e.to_json()).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    } else if entries.is_empty() {
        println!("No audit entries");
    } else {
        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                println!();
            }
            for line in format_audit_entry(entry) {
                println!("{}", line);
            }
        }
    }
    Ok(())
}
