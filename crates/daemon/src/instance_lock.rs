//! Single-instance guard for supervisors
//!
//! A supervisor takes an exclusive advisory lock on its PID file and keeps it
//! for its whole lifetime. A second instance fails fast instead of spawning a
//! competing encoder. The kernel drops the lock when the process dies, so a
//! stale PID file never blocks a restart.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Directory holding supervisor PID files
pub const DEFAULT_RUN_DIR: &str = "/run/forpost";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another instance holds {path} (pid {holder})")]
    AlreadyRunning { path: PathBuf, holder: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Held PID-file lock; released on drop
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Lock `path` and record our PID in it
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            return Err(LockError::AlreadyRunning {
                path: path.to_path_buf(),
                holder: if holder.is_empty() { "?".to_string() } else { holder },
            });
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

/// PID file path for a supervisor name
pub fn pid_file(run_dir: &Path, name: &str) -> PathBuf {
    run_dir.join(format!("{}.pid", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_instance_fails_fast() {
        let dir = TempDir::new().unwrap();
        let path = pid_file(dir.path(), "stream");

        let first = InstanceLock::acquire(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        match InstanceLock::acquire(&path) {
            Err(LockError::AlreadyRunning { holder, .. }) => {
                assert_eq!(holder, std::process::id().to_string());
            }
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }

        drop(first);
        assert!(InstanceLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_stale_pid_file_does_not_block() {
        let dir = TempDir::new().unwrap();
        let path = pid_file(dir.path(), "relay");
        fs::write(&path, "99999\n").unwrap();

        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_creates_run_dir() {
        let dir = TempDir::new().unwrap();
        let path = pid_file(&dir.path().join("run").join("forpost"), "stream");
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
