use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

pub const SESSION_LOCK_FILE: &str = "session.lock";

/// Exclusive OS lock on a save root, held for the lifetime of a store.
///
/// The lock file contains the owning process ID for debugging. It is left
/// on disk after release; only the OS lock matters.
pub struct SessionLock {
    _file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Locks `dir/session.lock`, failing immediately if another process (or
    /// another store in this process) already holds it.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(SESSION_LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(Error::LockError)?;

        Self::try_lock(&file).map_err(Error::LockError)?;

        // Only rewrite the pid once we own the file.
        file.set_len(0).map_err(Error::LockError)?;
        writeln!(file, "{}", std::process::id()).map_err(Error::LockError)?;
        file.flush().map_err(Error::LockError)?;

        tracing::debug!(path = %path.display(), "Acquired session lock");
        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(
                handle as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };

        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        // Closing the file releases the OS lock.
        tracing::debug!(path = %self.path.display(), "Released session lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let lock = SessionLock::acquire(dir.path()).expect("Failed to acquire lock");

        assert_eq!(lock.path(), dir.path().join(SESSION_LOCK_FILE));
        let content = fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_double_lock_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let _first = SessionLock::acquire(dir.path()).expect("Failed to acquire first lock");

        let second = SessionLock::acquire(dir.path());
        assert!(matches!(second, Err(Error::LockError(_))));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        {
            let _lock = SessionLock::acquire(dir.path()).expect("Failed to acquire lock");
        }

        let _again = SessionLock::acquire(dir.path()).expect("Should reacquire after drop");
        assert!(dir.path().join(SESSION_LOCK_FILE).exists());
    }
}
