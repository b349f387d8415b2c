//! Atomic write-replace
//!
//! Files shared between processes are never edited in place. A writer puts
//! the new content in a temp file in the same directory, syncs it, and
//! renames it over the target, so readers see either the old or the new
//! content and never a torn one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from atomic writes
#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("path has no parent directory: {0}")]
    NoParent(PathBuf),

    #[error("path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AtomicWriteError {
    fn io(path: &Path, source: io::Error) -> Self {
        AtomicWriteError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Temp path used while writing `path`: `.<name>.tmp.<pid>` in the same directory.
fn temp_path_for(path: &Path) -> Result<PathBuf, AtomicWriteError> {
    let parent = path
        .parent()
        .ok_or_else(|| AtomicWriteError::NoParent(path.to_path_buf()))?;
    let name = path
        .file_name()
        .ok_or_else(|| AtomicWriteError::NoFileName(path.to_path_buf()))?;
    Ok(parent.join(format!(
        ".{}.tmp.{}",
        name.to_string_lossy(),
        std::process::id()
    )))
}

/// Write `content` to `path` via temp file + fsync + rename.
///
/// The parent directory is created if missing.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), AtomicWriteError> {
    let temp_path = temp_path_for(path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AtomicWriteError::io(parent, e))?;
    }

    let result = (|| -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(AtomicWriteError::io(path, e));
    }

    sync_parent(path);
    Ok(())
}

/// Create or refresh a zero-byte sentinel through the same rename barrier.
pub fn touch_atomic(path: &Path) -> Result<(), AtomicWriteError> {
    atomic_write(path, &[])
}

/// Best-effort fsync of the containing directory so the rename is durable.
#[cfg(unix)]
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}
