use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Advisory lock on the sync state directory.
///
/// Keeps two `tsync` processes from syncing the same workspace at once.
/// Within one process the orchestrator's own guard does that job.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not create lock file at {path}: {source}")]
    CreateError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is held by another sync")]
    Busy { path: PathBuf },
}

impl FileLock {
    pub fn lock_path(state_dir: &Path) -> PathBuf {
        state_dir.join("sync.lock")
    }

    /// Acquire the lock, waiting up to `timeout`
    pub fn acquire(state_dir: &Path, timeout: Duration) -> Result<Self, LockError> {
        let lock_path = Self::lock_path(state_dir);
        let create_err = |e| LockError::CreateError {
            path: lock_path.clone(),
            source: e,
        };
        fs::create_dir_all(state_dir).map_err(create_err)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(create_err)?;

        let start = Instant::now();
        loop {
            if try_lock(&file).is_ok() {
                return Ok(FileLock {
                    _file: file,
                    path: lock_path,
                });
            }
            if start.elapsed() >= timeout {
                return Err(LockError::Busy { path: lock_path });
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Fail immediately if another process holds the lock
    pub fn try_acquire(state_dir: &Path) -> Result<Self, LockError> {
        Self::acquire(state_dir, Duration::ZERO)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // flock is released with the descriptor
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> Result<(), std::io::Error> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> Result<(), std::io::Error> {
    Ok(())
}
