//! Single-instance guard for a daemon socket.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

use crate::error::DaemonError;

/// An exclusive `flock(2)` on `<socket>.lock`, released and removed on drop.
pub struct LockFile {
    path: PathBuf,
    _file: File,
}

impl LockFile {
    /// Returns `DaemonError::AlreadyRunning` when another process holds the lock.
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DaemonError::LockFailed(format!("failed to create {}: {}", parent.display(), e)))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| DaemonError::LockFailed(format!("failed to open lock file: {}", e)))?;

        // SAFETY: flock is called on a descriptor owned by `file`
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(DaemonError::AlreadyRunning);
        }

        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .map_err(|e| DaemonError::LockFailed(format!("failed to record pid: {}", e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.lock");
        let _lock = LockFile::acquire(&path).unwrap();

        let pid: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
    }

    #[test]
    fn test_second_acquire_reports_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.lock");
        let _held = LockFile::acquire(&path).unwrap();

        assert!(matches!(
            LockFile::acquire(&path),
            Err(DaemonError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_drop_removes_file_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.lock");
        drop(LockFile::acquire(&path).unwrap());
        assert!(!path.exists());
        assert!(LockFile::acquire(&path).is_ok());
    }
}
