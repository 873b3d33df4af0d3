//! Exclusive lock file, ensuring at most one process opens a store directory.
//!
//! The lock file contains the owner's process id for diagnostics. The OS
//! lock is released automatically when the handle is dropped.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Name of the lock file inside the store directory.
pub const LOCK_FILE_NAME: &str = "lock";

/// Held lock on a store directory.
#[derive(Debug)]
pub struct LockFile {
    _file: File,
    path: PathBuf,
}

impl LockFile {
    /// Acquires the exclusive lock for `dir`.
    ///
    /// Returns `WouldBlock` when another process already holds it.
    pub fn acquire(dir: &Path) -> io::Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file)?;

        // The PID is informational only; the flock is what protects the store
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // Single-process protection only on platforms without flock
        Ok(())
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The file
        // itself is kept to avoid unlink races with a concurrent acquirer.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock = LockFile::acquire(dir.path()).expect("acquire");
        let content = std::fs::read_to_string(lock.path()).expect("read lock file");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_reacquire_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let _lock = LockFile::acquire(dir.path()).expect("first acquire");
        }
        let _lock2 = LockFile::acquire(dir.path()).expect("acquire after drop");
    }
}
