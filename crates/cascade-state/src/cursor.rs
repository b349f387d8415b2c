//! Consumer-side handoff cursor
//!
//! The ready flag stays raised forever, so a consumer cannot rely on seeing
//! it appear. It instead remembers the last sequence it fully processed and
//! treats any larger published sequence as pending work. Delivery is
//! at-least-once: a consumer that crashes before `commit` sees the same
//! sequence again.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::atomic::{atomic_write, AtomicWriteError};
use crate::handoff::{read_sequence, HandoffStore, StoreError};

/// Errors from cursor operations
#[derive(Debug, Error)]
pub enum CursorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

/// Persisted last-processed sequence for one consumer.
#[derive(Debug, Clone)]
pub struct HandoffCursor {
    path: PathBuf,
}

impl HandoffCursor {
    /// Cursor stored at `path` (created on first commit).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cursor file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last committed sequence; 0 if never committed.
    pub fn last(&self) -> Result<u64, CursorError> {
        Ok(read_sequence(&self.path)?)
    }

    /// Published sequence newer than the cursor, if the upstream is ready.
    pub fn pending(&self, upstream: &HandoffStore) -> Result<Option<u64>, CursorError> {
        if !upstream.is_ready() {
            return Ok(None);
        }
        let published = upstream.current()?;
        let last = self.last()?;
        Ok((published > last).then_some(published))
    }

    /// Record `sequence` as processed. Lower or equal values are ignored so
    /// the cursor never moves backwards.
    pub fn commit(&self, sequence: u64) -> Result<u64, CursorError> {
        let last = self.last()?;
        if sequence <= last {
            debug!(cursor = %self.path.display(), last, sequence, "cursor commit ignored");
            return Ok(last);
        }
        atomic_write(&self.path, format!("{}\n", sequence).as_bytes())?;
        Ok(sequence)
    }
}
