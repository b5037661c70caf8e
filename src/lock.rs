//! File-based mutual exclusion between concurrent `check` runs
//!
//! The lock file holds `pid|unix_timestamp`. A lock whose content is malformed,
//! whose owner process is gone, or which is older than the staleness timeout is
//! removed and acquisition is retried.
//!
//! Reading, judging and removing a stale lock are separate filesystem steps,
//! not one atomic operation. Two processes that both judge the same lock stale
//! may both remove it, and a lock created but not yet written reads as
//! malformed.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held")]
    AlreadyHeld,

    #[error("lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Held process lock; the file is removed on [`ProcessLock::release`] or drop
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    released: bool,
}

impl ProcessLock {
    /// Acquires the lock at `path`, clearing a stale one first.
    ///
    /// Fails with [`LockError::AlreadyHeld`] when a live, fresh lock exists.
    /// The stale check and removal race with other callers; see the module docs.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}|{}", std::process::id(), unix_now()).map_err(io_err)?;
                    debug!("Acquired lock {:?}", path);
                    return Ok(Self {
                        path: path.to_path_buf(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(io_err(e)),
            }

            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                // Released between our create attempt and the read
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(e)),
            };
            if !is_stale(&content, stale_after) {
                return Err(LockError::AlreadyHeld);
            }
            warn!("Removing stale lock {:?} ({})", path, content.trim());
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        std::fs::remove_file(&self.path).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove lock {:?}: {}", self.path, e);
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn is_stale(content: &str, stale_after: Duration) -> bool {
    let Some((pid, created)) = content.split_once('|') else {
        return true;
    };
    let (Ok(pid), Ok(created)) = (pid.trim().parse::<u32>(), created.trim().parse::<u64>()) else {
        return true;
    };
    if !is_pid_alive(pid) {
        return true;
    }
    Duration::from_secs(unix_now().saturating_sub(created)) > stale_after
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // 0 would address our own process group
    if pid <= 0 {
        return false;
    }
    // kill(pid, 0) probes for existence without sending a signal
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(600);

    #[test]
    fn acquire_writes_pid_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");

        let lock = ProcessLock::acquire(&path, TIMEOUT).unwrap();

        let content = std::fs::read_to_string(lock.path()).unwrap();
        let (pid, ts) = content.split_once('|').unwrap();
        assert_eq!(pid, std::process::id().to_string());
        assert!(ts.parse::<u64>().unwrap() > 0);
    }

    #[test]
    fn second_acquire_fails_while_fresh_lock_is_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");

        let _first = ProcessLock::acquire(&path, TIMEOUT).unwrap();
        let second = ProcessLock::acquire(&path, TIMEOUT);

        assert!(matches!(second, Err(LockError::AlreadyHeld)));
    }

    #[test]
    fn acquire_replaces_lock_of_dead_process() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, format!("999999999|{}", unix_now())).unwrap();

        let lock = ProcessLock::acquire(&path, TIMEOUT).unwrap();

        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert!(content.starts_with(&format!("{}|", std::process::id())));
    }

    #[test]
    fn acquire_replaces_expired_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, format!("{}|{}", std::process::id(), unix_now() - 3600)).unwrap();

        assert!(ProcessLock::acquire(&path, TIMEOUT).is_ok());
    }

    #[test]
    fn acquire_replaces_malformed_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, "garbage").unwrap();

        assert!(ProcessLock::acquire(&path, TIMEOUT).is_ok());
    }

    #[test]
    fn acquire_treats_unwritten_lock_as_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, "").unwrap();

        let lock = ProcessLock::acquire(&path, TIMEOUT).unwrap();

        let content = std::fs::read_to_string(lock.path()).unwrap();
        assert!(content.starts_with(&format!("{}|", std::process::id())));
    }

    #[test]
    fn release_removes_file_and_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");

        let lock = ProcessLock::acquire(&path, TIMEOUT).unwrap();
        lock.release().unwrap();

        assert!(!path.exists());
        assert!(ProcessLock::acquire(&path, TIMEOUT).is_ok());
    }

    #[test]
    fn drop_removes_lock_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock");

        {
            let _lock = ProcessLock::acquire(&path, TIMEOUT).unwrap();
            assert!(path.exists());
        }

        assert!(!path.exists());
    }

    #[test]
    fn is_stale_rejects_zero_pid() {
        assert!(is_stale(&format!("0|{}", unix_now()), TIMEOUT));
    }
}
