use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tsync", about = concat!("tasksync v", env!("CARGO_PKG_VERSION"), " - remote tasks as plain markdown"), version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Workspace root holding the task documents (default: current directory)
    #[arg(short = 'C', long = "dir", global = true)]
    pub dir: Option<String>,

    /// State directory (default: <dir>/.tasksync)
    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    /// JSON snapshot file standing in for the remote service
    /// (default: <state dir>/remote.json)
    #[arg(long, global = true)]
    pub remote_file: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the state directory and a default sync.toml
    Init,
    /// Run one sync
    Sync,
    /// Show mapping and backup state
    Status,
    /// List mappings whose lines are gone
    Check(CheckArgs),
    /// Create, list or restore backups of the remote
    Backup(BackupCmd),
    /// View or prune the audit log
    Log(LogArgs),
}

// ---------------------------------------------------------------------------
// Maintenance args
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct CheckArgs {
    /// Remove the orphaned mappings
    #[arg(long)]
    pub fix: bool,
}

#[derive(Args)]
pub struct BackupCmd {
    #[command(subcommand)]
    pub action: BackupAction,
}

#[derive(Subcommand)]
pub enum BackupAction {
    /// Archive the current remote state
    Create,
    /// List archives, newest first
    List,
    /// Validate an archive and load it into the remote snapshot file
    Restore(RestoreArgs),
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Archive path, or a file name inside the backup directory
    pub file: String,
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct LogArgs {
    /// Maximum number of entries to show (default: 10)
    #[arg(long)]
    pub limit: Option<usize>,
    /// Remove old entries instead of listing
    #[arg(long)]
    pub prune: bool,
    /// Age in days past which --prune removes entries (default: 30; implies --prune)
    #[arg(long)]
    pub prune_days: Option<i64>,
}
