use std::fs;

use crate::cli::handlers::Workspace;
use crate::io::config_io::{ConfigError, read_config, write_default_config};

/// Create the state directory, a commented `sync.toml` and the sync folder
pub fn cmd_init(ws: &Workspace) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match write_default_config(&ws.state_dir) {
        Ok(path) => path,
        Err(ConfigError::AlreadyInitialized(path)) => {
            return Err(format!("already initialized: {}", path.display()).into());
        }
        Err(e) => return Err(e.into()),
    };

    let config = read_config(&ws.state_dir)?;
    let sync_dir = ws.root.join(&config.sync_dir);
    fs::create_dir_all(&sync_dir)?;

    println!("Wrote {}", config_path.display());
    println!("Documents will sync into {}/", sync_dir.display());
    Ok(())
}
