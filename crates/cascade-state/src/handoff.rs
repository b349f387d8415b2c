//! Versioned handoff store
//!
//! A stage publishes its completion to downstream consumers through two
//! files in its handoff directory:
//! - `sequence`: a plain decimal integer, replaced atomically
//! - `ready`: a zero-byte sentinel whose presence is the signal
//!
//! `publish` writes the sequence first and only then touches the flag, so a
//! reader that sees the flag always reads a sequence at least as new as the
//! one it was raised for. The flag is never cleared by the producer;
//! consumers keep their own cursor (see [`crate::cursor`]).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::atomic::{atomic_write, touch_atomic, AtomicWriteError};

/// Sequence file name inside a handoff directory
pub const SEQUENCE_FILENAME: &str = "sequence";

/// Ready flag file name inside a handoff directory
pub const READY_FILENAME: &str = "ready";

/// Errors from the handoff store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sequence file {path} is corrupt: {content:?}")]
    Corrupt { path: PathBuf, content: String },

    #[error("sequence must increase: current {current}, attempted {attempted}")]
    NonMonotonic { current: u64, attempted: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

/// Observed state of a handoff directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffToken {
    /// Last published sequence (0 = never published)
    pub sequence: u64,

    /// Whether the ready flag is present
    pub ready: bool,

    /// Modification time of the ready flag, if present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Handoff store rooted at one stage's handoff directory.
#[derive(Debug, Clone)]
pub struct HandoffStore {
    dir: PathBuf,
}

impl HandoffStore {
    /// Open (and create) the handoff directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Handoff directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the sequence file.
    pub fn sequence_path(&self) -> PathBuf {
        self.dir.join(SEQUENCE_FILENAME)
    }

    /// Path of the ready flag.
    pub fn ready_path(&self) -> PathBuf {
        self.dir.join(READY_FILENAME)
    }

    /// Current published sequence; 0 when nothing has been published yet.
    pub fn current(&self) -> Result<u64, StoreError> {
        read_sequence(&self.sequence_path())
    }

    /// Whether the ready flag is present.
    pub fn is_ready(&self) -> bool {
        self.ready_path().is_file()
    }

    /// Snapshot of sequence, flag and flag timestamp.
    pub fn token(&self) -> Result<HandoffToken, StoreError> {
        let sequence = self.current()?;
        let timestamp = fs::metadata(self.ready_path())
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(HandoffToken {
            sequence,
            ready: timestamp.is_some(),
            timestamp,
        })
    }

    /// Publish `value` as the new sequence and raise the ready flag.
    ///
    /// `value` must be strictly greater than the current sequence. Callers
    /// serialize publishers with a stage lease.
    pub fn publish(&self, value: u64) -> Result<HandoffToken, StoreError> {
        let current = self.current()?;
        if value <= current {
            return Err(StoreError::NonMonotonic {
                current,
                attempted: value,
            });
        }

        atomic_write(&self.sequence_path(), format!("{}\n", value).as_bytes())?;
        touch_atomic(&self.ready_path())?;

        info!(dir = %self.dir.display(), sequence = value, "handoff published");
        self.token()
    }

    /// Publish `current + 1`.
    pub fn advance(&self) -> Result<HandoffToken, StoreError> {
        let next = self.current()? + 1;
        self.publish(next)
    }
}

/// Read a plain-integer sequence file; a missing file reads as 0.
pub(crate) fn read_sequence(path: &Path) -> Result<u64, StoreError> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                return Ok(0);
            }
            trimmed.parse::<u64>().map_err(|_| StoreError::Corrupt {
                path: path.to_path_buf(),
                content: trimmed.to_string(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
