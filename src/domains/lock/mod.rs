use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domains::repo;
use crate::error::{CoreError, Result};

pub const LOCK_FILE_NAME: &str = "cs.lock";

/// Exclusive per-repository lock. Kernel-enforced advisory whole-file lock
/// (flock on Unix, LockFileEx semantics on Windows via fs2), released
/// automatically on process death, so no stale-lock cleanup exists here.
#[derive(Debug)]
pub struct ProcessLock {
    file: Option<File>,
    path: PathBuf,
}

impl ProcessLock {
    /// Acquire the lock for a repository, failing immediately with
    /// `LockHeld` when another controller owns it. The holder's PID is read
    /// from the lock file for the error message when possible.
    pub fn acquire(repo_path: &Path) -> Result<ProcessLock> {
        let state_dir = repo::state_dir(repo_path)
            .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        let lock_path = state_dir.join(LOCK_FILE_NAME);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        if file.try_lock_exclusive().is_err() {
            let pid = read_pid(&lock_path).unwrap_or_else(|| "unknown".to_string());
            return Err(CoreError::LockHeld { pid });
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(ProcessLock {
            file: Some(file),
            path: lock_path,
        })
    }

    /// Release the lock and remove the lock file. Also invoked by `drop`.
    pub fn release(&mut self) {
        if self.file.take().is_some() {
            // Closing the handle releases the kernel lock; unlink afterwards.
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove lock file: {e}");
                }
            }
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(lock_path: &Path) -> Option<String> {
    let data = fs::read_to_string(lock_path).ok()?;
    let pid = data.trim();
    pid.parse::<u32>().ok()?;
    Some(pid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_writes_own_pid() {
        let tmp = TempDir::new().unwrap();
        let lock = ProcessLock::acquire(tmp.path()).unwrap();
        let written = fs::read_to_string(&lock.path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());
    }

    #[test]
    fn release_removes_the_lock_file() {
        let tmp = TempDir::new().unwrap();
        let lock = ProcessLock::acquire(tmp.path()).unwrap();
        let path = lock.path.clone();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn reacquire_after_release_succeeds() {
        let tmp = TempDir::new().unwrap();
        drop(ProcessLock::acquire(tmp.path()).unwrap());
        ProcessLock::acquire(tmp.path()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn second_acquire_fails_with_holder_pid() {
        // flock ties the lock to the open file description, so a second
        // handle conflicts even inside one process.
        let tmp = TempDir::new().unwrap();
        let _held = ProcessLock::acquire(tmp.path()).unwrap();

        let err = ProcessLock::acquire(tmp.path())
            .err()
            .expect("second acquire must fail");
        match err {
            CoreError::LockHeld { pid } => assert_eq!(pid, std::process::id().to_string()),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn lock_held_error_is_greppable() {
        let tmp = TempDir::new().unwrap();
        let _held = ProcessLock::acquire(tmp.path()).unwrap();
        let err = ProcessLock::acquire(tmp.path()).unwrap_err();
        assert!(err
            .to_string()
            .contains("another cs instance is running in this repo"));
    }

    #[test]
    fn pid_parsing_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(LOCK_FILE_NAME);
        fs::write(&path, "not-a-pid\n").unwrap();
        assert_eq!(read_pid(&path), None);
        fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pid(&path).as_deref(), Some("1234"));
    }
}
