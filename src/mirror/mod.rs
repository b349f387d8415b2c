//! Mirror engine
//!
//! Replicates one artifact and its metadata to a set of destination tiers.
//!
//! Per tier:
//! 1. If the destination already matches by size and mtime, re-hash it; a
//!    digest equal to the expected one means skip (0 bytes copied)
//! 2. Otherwise copy to `.<name>.partial`, fsync, digest the temp file,
//!    optionally run the format integrity test on it, carry over the source
//!    mtime, and rename into place only when both pass
//! 3. Mirror the checksum sidecar and builder log alongside
//!
//! A source whose sidecar exists but cannot be trusted fails every tier
//! before anything is copied. Otherwise tiers are independent: one tier's
//! failure never blocks another, and the report lists exactly which tiers
//! failed.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use cascade_state::{atomic_write, AtomicWriteError};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::artifact::{
    digest, integrity_test_as, log_path, sidecar_path, ArchiveFormat, Artifact, Sidecar,
    SidecarError, VerifyError, PARTIAL_SUFFIX,
};
use crate::summary::{ErrorCounts, ErrorKind, TierStatus};

/// Errors mirroring to one tier
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("cannot read source {path}: {source}")]
    SourceRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checksum sidecar of {path} cannot be trusted: {reason}")]
    UntrustedSidecar { path: PathBuf, reason: String },

    #[error("source {path} does not match its checksum sidecar: sidecar {expected}, actual {actual}")]
    SourceMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("copy to {path} failed: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("copy at {path} does not match: expected {expected}, got {actual}")]
    Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("integrity test failed for {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },

    #[error("metadata mirror failed for {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Sidecar(#[from] SidecarError),

    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

impl MirrorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MirrorError::SourceMismatch { .. }
            | MirrorError::UntrustedSidecar { .. }
            | MirrorError::Mismatch { .. }
            | MirrorError::Integrity { .. } => ErrorKind::VerificationMismatch,
            MirrorError::SourceRead { .. }
            | MirrorError::Copy { .. }
            | MirrorError::Metadata { .. }
            | MirrorError::Sidecar(_)
            | MirrorError::Write(_) => ErrorKind::TransferError,
        }
    }
}

/// A resolved destination root for one tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub tier: String,
    pub root: PathBuf,
}

impl MirrorTarget {
    pub fn new(tier: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            tier: tier.to_string(),
            root: root.into(),
        }
    }
}

/// Outcome of mirroring one artifact to one tier
#[derive(Debug)]
pub struct TierOutcome {
    pub tier: String,
    /// Final path of the copy
    pub destination: PathBuf,
    pub copied_bytes: u64,
    /// Destination already held a verified copy
    pub skipped: bool,
    /// Destination digest equals the expected digest
    pub verified: bool,
    /// Metadata files written (sidecar, log)
    pub metadata_files: usize,
    pub error: Option<MirrorError>,
}

impl TierOutcome {
    fn failed(tier: &str, destination: PathBuf, error: MirrorError) -> Self {
        Self {
            tier: tier.to_string(),
            destination,
            copied_bytes: 0,
            skipped: false,
            verified: false,
            metadata_files: 0,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> TierStatus {
        match &self.error {
            Some(e) => TierStatus::Failed(e.kind()),
            None if self.skipped => TierStatus::Skipped,
            None => TierStatus::Ok,
        }
    }
}

/// Per-tier report for one artifact
#[derive(Debug)]
pub struct MirrorReport {
    /// Tier-relative artifact path
    pub artifact: PathBuf,
    /// Expected digest, when the source could be read
    pub digest: Option<String>,
    pub tiers: Vec<TierOutcome>,
}

impl MirrorReport {
    pub fn is_success(&self) -> bool {
        self.tiers.iter().all(TierOutcome::is_ok)
    }

    pub fn failed_tiers(&self) -> Vec<&str> {
        self.tiers
            .iter()
            .filter(|t| !t.is_ok())
            .map(|t| t.tier.as_str())
            .collect()
    }

    pub fn copied_bytes(&self) -> u64 {
        self.tiers.iter().map(|t| t.copied_bytes).sum()
    }

    pub fn skipped(&self) -> usize {
        self.tiers.iter().filter(|t| t.skipped).count()
    }

    pub fn error_counts(&self) -> ErrorCounts {
        let mut counts = ErrorCounts::new();
        for outcome in &self.tiers {
            if let Some(e) = &outcome.error {
                counts.add(e.kind());
            }
        }
        counts
    }
}

/// Mirror engine
#[derive(Debug, Clone, Default)]
pub struct MirrorEngine {
    verify_integrity: bool,
}

impl MirrorEngine {
    pub fn new(verify_integrity: bool) -> Self {
        Self { verify_integrity }
    }

    /// Replicate `artifact` to every target.
    pub fn mirror(&self, artifact: &Artifact, targets: &[MirrorTarget]) -> MirrorReport {
        let destination = |t: &MirrorTarget| t.root.join(&artifact.relative);

        if let Some(reason) = &artifact.sidecar_error {
            error!(
                artifact = %artifact.path.display(),
                kind = %ErrorKind::VerificationMismatch,
                reason = %reason,
                "checksum sidecar cannot be trusted, not mirroring"
            );
            return failed_everywhere(artifact, targets, None, || MirrorError::UntrustedSidecar {
                path: artifact.path.clone(),
                reason: reason.clone(),
            });
        }

        let actual = match digest(&artifact.path) {
            Ok(actual) => actual,
            Err(e) => {
                error!(artifact = %artifact.path.display(), error = %e, "cannot read source");
                let message = e.to_string();
                return failed_everywhere(artifact, targets, None, || MirrorError::SourceRead {
                    path: artifact.path.clone(),
                    source: io::Error::new(e.kind(), message.clone()),
                });
            }
        };

        if let Some(expected) = &artifact.digest {
            if !expected.eq_ignore_ascii_case(&actual) {
                error!(
                    artifact = %artifact.path.display(),
                    kind = %ErrorKind::VerificationMismatch,
                    sidecar = %expected,
                    %actual,
                    "source does not match its checksum sidecar"
                );
                return failed_everywhere(artifact, targets, Some(expected.clone()), || {
                    MirrorError::SourceMismatch {
                        path: artifact.path.clone(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                    }
                });
            }
        }

        let tiers = targets
            .iter()
            .map(|target| {
                let dest = destination(target);
                match self.mirror_to(artifact, &actual, &dest) {
                    Ok(outcome) => {
                        let outcome = TierOutcome {
                            tier: target.tier.clone(),
                            ..outcome
                        };
                        if outcome.skipped {
                            debug!(tier = %outcome.tier, dest = %dest.display(), "already mirrored, skipped");
                        } else {
                            info!(
                                tier = %outcome.tier,
                                dest = %dest.display(),
                                bytes = outcome.copied_bytes,
                                "artifact mirrored"
                            );
                        }
                        outcome
                    }
                    Err(e) => {
                        error!(
                            tier = %target.tier,
                            dest = %dest.display(),
                            kind = %e.kind(),
                            error = %e,
                            "mirror failed"
                        );
                        TierOutcome::failed(&target.tier, dest, e)
                    }
                }
            })
            .collect();

        MirrorReport {
            artifact: artifact.relative.clone(),
            digest: Some(actual),
            tiers,
        }
    }

    fn mirror_to(
        &self,
        artifact: &Artifact,
        expected: &str,
        dest: &Path,
    ) -> Result<TierOutcome, MirrorError> {
        let copy_err = |source| MirrorError::Copy {
            path: dest.to_path_buf(),
            source,
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(copy_err)?;
        }

        let skipped = already_mirrored(artifact, expected, dest).map_err(copy_err)?;
        let copied_bytes = if skipped {
            // A copy promoted before integrity testing was enabled gets tested in place.
            if self.verify_integrity {
                check_integrity(dest, dest)?;
            }
            0
        } else {
            copy_verified(artifact, expected, dest, self.verify_integrity)?
        };

        let metadata_files = mirror_metadata(artifact, expected, dest)?;

        Ok(TierOutcome {
            tier: String::new(),
            destination: dest.to_path_buf(),
            copied_bytes,
            skipped,
            verified: true,
            metadata_files,
            error: None,
        })
    }
}

/// Report failing every target with the same error.
fn failed_everywhere(
    artifact: &Artifact,
    targets: &[MirrorTarget],
    digest: Option<String>,
    error: impl Fn() -> MirrorError,
) -> MirrorReport {
    MirrorReport {
        artifact: artifact.relative.clone(),
        digest,
        tiers: targets
            .iter()
            .map(|t| TierOutcome::failed(&t.tier, t.root.join(&artifact.relative), error()))
            .collect(),
    }
}

/// Format integrity test of `path`, judged by the extension of `named`.
fn check_integrity(path: &Path, named: &Path) -> Result<(), MirrorError> {
    let integrity_err = |e: VerifyError| MirrorError::Integrity {
        path: named.to_path_buf(),
        reason: match e {
            VerifyError::Integrity { reason, .. } => reason,
            other => other.to_string(),
        },
    };
    integrity_test_as(path, ArchiveFormat::detect(named))
        .and_then(|report| report.into_result(named))
        .map_err(integrity_err)?;
    Ok(())
}

/// Size and mtime match, and the destination re-hashes to `expected`.
fn already_mirrored(artifact: &Artifact, expected: &str, dest: &Path) -> io::Result<bool> {
    let metadata = match fs::metadata(dest) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if !metadata.is_file() || metadata.len() != artifact.size {
        return Ok(false);
    }
    match (artifact.modified, metadata.modified().ok()) {
        (Some(src), Some(dst)) if same_mtime(src, dst) => {}
        _ => return Ok(false),
    }
    Ok(digest(dest)?.eq_ignore_ascii_case(expected))
}

/// Mtimes equal to within a second (filesystems round differently).
fn same_mtime(a: SystemTime, b: SystemTime) -> bool {
    let diff = a
        .duration_since(b)
        .or_else(|_| b.duration_since(a))
        .unwrap_or(Duration::MAX);
    diff < Duration::from_secs(1)
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}{}", name, PARTIAL_SUFFIX))
}

/// Copy through a temp file, verify it, then rename into place.
///
/// With `integrity`, the temp file must also pass the format test; a copy
/// that fails never appears under its final name.
fn copy_verified(
    artifact: &Artifact,
    expected: &str,
    dest: &Path,
    integrity: bool,
) -> Result<u64, MirrorError> {
    let temp = partial_path(dest);
    let copy_err = |source| MirrorError::Copy {
        path: temp.clone(),
        source,
    };

    let result = (|| {
        let mut reader = File::open(&artifact.path).map_err(|source| MirrorError::SourceRead {
            path: artifact.path.clone(),
            source,
        })?;
        let mut writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .map_err(copy_err)?;
        let bytes = io::copy(&mut reader, &mut writer).map_err(copy_err)?;
        writer.sync_all().map_err(copy_err)?;
        if let Some(modified) = artifact.modified {
            writer.set_modified(modified).map_err(copy_err)?;
        }
        drop(writer);

        let actual = digest(&temp).map_err(copy_err)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(MirrorError::Mismatch {
                path: dest.to_path_buf(),
                expected: expected.to_string(),
                actual,
            });
        }
        if integrity {
            check_integrity(&temp, dest)?;
        }
        Ok(bytes)
    })();

    let bytes = match result {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
    };

    fs::rename(&temp, dest).map_err(|source| {
        let _ = fs::remove_file(&temp);
        MirrorError::Copy {
            path: dest.to_path_buf(),
            source,
        }
    })?;
    sync_parent(dest);
    Ok(bytes)
}

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

/// Mirror the sidecar (or synthesize one) and the builder log.
fn mirror_metadata(artifact: &Artifact, expected: &str, dest: &Path) -> Result<usize, MirrorError> {
    let mut written = 0;

    let source_sidecar = sidecar_path(&artifact.path);
    if source_sidecar.exists() {
        copy_small(&source_sidecar, &sidecar_path(dest))?;
    } else {
        Sidecar::new(expected, &artifact.file_name()).write_for(dest)?;
    }
    written += 1;

    let source_log = log_path(&artifact.path);
    if source_log.exists() {
        copy_small(&source_log, &log_path(dest))?;
        written += 1;
    }

    Ok(written)
}

fn copy_small(from: &Path, to: &Path) -> Result<(), MirrorError> {
    let content = fs::read(from).map_err(|source| MirrorError::Metadata {
        path: from.to_path_buf(),
        source,
    })?;
    if fs::read(to).map(|existing| existing == content).unwrap_or(false) {
        return Ok(());
    }
    atomic_write(to, &content)?;
    Ok(())
}
