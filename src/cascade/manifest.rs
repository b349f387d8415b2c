//! Handoff manifests
//!
//! `manifest.<seq>.json` sits next to a stage's `sequence` file and names the
//! artifacts that sequence covers. One file is kept per sequence so a
//! consumer that falls behind can still walk every sequence it skipped.
//! A manifest is written before the sequence is bumped, so one whose
//! sequence is greater than the published one belongs to an interrupted
//! publish and is ignored.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use cascade_state::{atomic_write, AtomicWriteError, HandoffStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Prefix of manifest file names inside a handoff directory
pub const MANIFEST_PREFIX: &str = "manifest.";

/// Current manifest schema version
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// File name of the manifest for `sequence`
pub fn manifest_filename(sequence: u64) -> String {
    format!("{}{}.json", MANIFEST_PREFIX, sequence)
}

/// Sequence named by a manifest file name, if it is one.
fn parse_filename(name: &str) -> Option<u64> {
    name.strip_prefix(MANIFEST_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Errors reading or writing a manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Write(#[from] AtomicWriteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One verified artifact covered by a handoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Tier-relative path, `/`-separated
    pub path: String,
    pub digest: String,
    pub size: u64,
}

/// What a published sequence covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffManifest {
    pub schema_version: u32,
    pub sequence: u64,
    pub stage: String,
    pub published_at: DateTime<Utc>,
    pub artifacts: Vec<ManifestEntry>,
}

/// Committed manifests for a range of sequences
#[derive(Debug, Clone, Default)]
pub struct PendingManifests {
    /// Manifests found, ascending by sequence
    pub manifests: Vec<HandoffManifest>,
    /// Sequences in the range with no manifest on disk
    pub missing: Vec<u64>,
}

impl PendingManifests {
    /// Entries across every manifest; a later sequence wins for the same path.
    pub fn entries(&self) -> Vec<ManifestEntry> {
        let mut by_path = BTreeMap::new();
        for manifest in &self.manifests {
            for entry in &manifest.artifacts {
                by_path.insert(entry.path.clone(), entry.clone());
            }
        }
        by_path.into_values().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl HandoffManifest {
    pub fn new(
        stage: &str,
        sequence: u64,
        published_at: DateTime<Utc>,
        mut artifacts: Vec<ManifestEntry>,
    ) -> Self {
        artifacts.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            sequence,
            stage: stage.to_string(),
            published_at,
            artifacts,
        }
    }

    fn path(store: &HandoffStore, sequence: u64) -> PathBuf {
        store.dir().join(manifest_filename(sequence))
    }

    /// Atomically write into the store's directory.
    pub fn write(&self, store: &HandoffStore) -> Result<(), ManifestError> {
        let mut json = serde_json::to_vec_pretty(self).map_err(ManifestError::Serialize)?;
        json.push(b'\n');
        atomic_write(&Self::path(store, self.sequence), &json)?;
        debug!(stage = %self.stage, sequence = self.sequence, "handoff manifest written");
        Ok(())
    }

    /// Read the manifest for `sequence`, committed or not.
    pub fn read(store: &HandoffStore, sequence: u64) -> Result<Option<Self>, ManifestError> {
        let path = Self::path(store, sequence);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ManifestError::Io { path, source }),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|source| ManifestError::Parse { path, source })
    }

    /// The manifest of the published sequence, if any.
    pub fn read_committed(store: &HandoffStore) -> Result<Option<Self>, ManifestError> {
        let published = store.current()?;
        if published == 0 {
            return Ok(None);
        }
        Self::read(store, published)
    }

    /// Committed manifests for every sequence in `(after, upto]`.
    ///
    /// `upto` is clamped to the published sequence.
    pub fn read_range(
        store: &HandoffStore,
        after: u64,
        upto: u64,
    ) -> Result<PendingManifests, ManifestError> {
        let upto = upto.min(store.current()?);
        let mut pending = PendingManifests::default();
        for sequence in after.saturating_add(1)..=upto {
            match Self::read(store, sequence)? {
                Some(manifest) => pending.manifests.push(manifest),
                None => pending.missing.push(sequence),
            }
        }
        Ok(pending)
    }

    /// Remove manifests below `before`, keeping the published one.
    ///
    /// Returns how many files were removed. Failures are logged and skipped.
    pub fn prune(store: &HandoffStore, before: u64) -> Result<usize, ManifestError> {
        let published = store.current()?;
        let entries = fs::read_dir(store.dir()).map_err(|source| ManifestError::Io {
            path: store.dir().to_path_buf(),
            source,
        })?;
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(sequence) = name.to_str().and_then(parse_filename) else {
                continue;
            };
            if sequence >= before || sequence == published {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(manifest = %entry.path().display(), error = %e, "failed to prune manifest")
                }
            }
        }
        if removed > 0 {
            debug!(dir = %store.dir().display(), removed, before, "pruned consumed manifests");
        }
        Ok(removed)
    }

    /// Whether every entry is listed here with the same digest.
    pub fn covers(&self, entries: &[ManifestEntry]) -> bool {
        entries.iter().all(|entry| {
            self.artifacts
                .iter()
                .any(|a| a.path == entry.path && a.digest.eq_ignore_ascii_case(&entry.digest))
        })
    }
}
