//! Per-stage advisory leases
//!
//! Only one process per pipeline stage may run at a time. A lease is an
//! exclusive `flock` on `<lock_dir>/<stage>.lock`, taken without blocking.
//! The kernel drops the lock when the descriptor closes, so a crashed holder
//! never leaves a stale lease behind.
//!
//! The holder's pid is written into the lock file for diagnostics only; it
//! plays no part in deciding who holds the lease.
//!
//! Without `flock` the lock file itself is the lease: it is created with
//! `create_new` and removed on drop. A holder that crashes there leaves the
//! file behind, and it must be removed by hand.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Lease result type
pub type LeaseResult<T> = Result<T, LeaseError>;

/// Errors from lease operations
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Another process holds the lease for this stage
    #[error("stage '{stage}' is already running (holder: {holder})")]
    Busy { stage: String, holder: String },

    #[error("invalid stage name: {0:?}")]
    InvalidStage(String),

    #[error("I/O error on lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LeaseError {
    /// Whether this error means "someone else is running", not a real failure.
    pub fn is_busy(&self) -> bool {
        matches!(self, LeaseError::Busy { .. })
    }
}

/// Exclusive lease on a pipeline stage, held until dropped or process exit.
#[derive(Debug)]
pub struct Lease {
    stage: String,
    lock_path: PathBuf,
    lock_file: File,
}

impl Lease {
    /// Try to take the lease for `stage` without waiting.
    ///
    /// Creates `lock_dir` if missing. Returns `LeaseError::Busy` immediately
    /// when another holder exists.
    pub fn acquire(lock_dir: &Path, stage: &str) -> LeaseResult<Self> {
        if stage.is_empty()
            || !stage
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            || stage.starts_with('.')
        {
            return Err(LeaseError::InvalidStage(stage.to_string()));
        }

        fs::create_dir_all(lock_dir).map_err(|source| LeaseError::Io {
            path: lock_dir.to_path_buf(),
            source,
        })?;

        let lock_path = lock_dir.join(format!("{}.lock", stage));
        let io_err = |source| LeaseError::Io {
            path: lock_path.clone(),
            source,
        };

        let mut file = match try_lock_exclusive(&lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let holder = fs::read_to_string(&lock_path).unwrap_or_default();
                let holder = holder.trim();
                return Err(LeaseError::Busy {
                    stage: stage.to_string(),
                    holder: if holder.is_empty() {
                        "unknown".to_string()
                    } else {
                        format!("pid {}", holder)
                    },
                });
            }
            Err(e) => return Err(io_err(e)),
        };

        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        write!(file, "{}", std::process::id()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        debug!(stage, lock = %lock_path.display(), "lease acquired");

        Ok(Self {
            stage: stage.to_string(),
            lock_path,
            lock_file: file,
        })
    }

    /// Stage this lease guards.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

/// Open `lock_path` holding an exclusive lock, or fail with `WouldBlock`.
#[cfg(unix)]
fn try_lock_exclusive(lock_path: &Path) -> io::Result<File> {
    use std::os::unix::io::AsRawFd;

    // Opened without truncation: the current holder's pid must survive a
    // failed attempt so the Busy error can report it.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(file)
    } else {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lease held"))
        } else {
            Err(err)
        }
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(lock_path: &Path) -> io::Result<File> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lease held"))
        }
        Err(e) => Err(e),
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
        debug!(stage = %self.stage, "lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lease_acquire_basic() {
        let dir = TempDir::new().unwrap();

        let lease = Lease::acquire(dir.path(), "cascade-scan").unwrap();

        assert_eq!(lease.stage(), "cascade-scan");
        assert!(lease.path().exists());
        assert_eq!(lease.path().file_name().unwrap(), "cascade-scan.lock");
    }

    #[test]
    fn test_lease_creates_directory() {
        let dir = TempDir::new().unwrap();
        let lock_dir = dir.path().join("state").join("locks");

        let _lease = Lease::acquire(&lock_dir, "retention").unwrap();

        assert!(lock_dir.is_dir());
    }

    #[test]
    fn test_lease_records_holder_pid() {
        let dir = TempDir::new().unwrap();

        let lease = Lease::acquire(dir.path(), "retention").unwrap();

        let content = fs::read_to_string(lease.path()).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let dir = TempDir::new().unwrap();

        let _first = Lease::acquire(dir.path(), "cascade-scan").unwrap();
        let second = Lease::acquire(dir.path(), "cascade-scan");

        match second {
            Err(err @ LeaseError::Busy { .. }) => {
                assert!(err.is_busy());
                assert!(err.to_string().contains("cascade-scan"));
                assert!(err.to_string().contains(&std::process::id().to_string()));
            }
            other => panic!("expected Busy, got {:?}", other),
        }
    }

    #[test]
    fn test_leases_are_scoped_per_stage() {
        let dir = TempDir::new().unwrap();

        let _scan = Lease::acquire(dir.path(), "cascade-scan").unwrap();
        let worker = Lease::acquire(dir.path(), "cascade-worker");

        assert!(worker.is_ok());
    }

    #[test]
    fn test_lease_released_on_drop() {
        let dir = TempDir::new().unwrap();

        {
            let _lease = Lease::acquire(dir.path(), "cascade-scan").unwrap();
            assert!(Lease::acquire(dir.path(), "cascade-scan").is_err());
        }

        let again = Lease::acquire(dir.path(), "cascade-scan").unwrap();
        assert!(Lease::acquire(dir.path(), "cascade-scan").unwrap_err().is_busy());
        drop(again);
    }

    #[test]
    fn test_invalid_stage_names_rejected() {
        let dir = TempDir::new().unwrap();

        for bad in ["", "../escape", "a/b", ".hidden"] {
            assert!(
                matches!(
                    Lease::acquire(dir.path(), bad),
                    Err(LeaseError::InvalidStage(_))
                ),
                "stage {:?} should be rejected",
                bad
            );
        }
    }
}
