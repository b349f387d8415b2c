//! Destination topology resolution
//!
//! Picks the first writable destination from an ordered candidate list.
//! Candidates are tried strictly in configured order with no randomized
//! tie-break, so the same environment always yields the same choice.
//!
//! A candidate is usable when:
//! 1. it is a mount point, if its tier requires one
//! 2. its directory exists or can be created
//! 3. a sentinel file can be written, synced and removed inside it

mod provenance;

pub use provenance::{
    current_host, current_user, ProvenanceError, ProvenanceStamp, DECISION_FILENAME,
    PROVENANCE_LOG_FILENAME,
};

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TierSpec;
use crate::summary::ErrorKind;

/// Prefix of the write-probe sentinel (suffixed with the pid)
pub const PROBE_PREFIX: &str = ".cascade-write-probe";

/// Errors from topology resolution
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("no candidate destinations configured")]
    NoCandidates,

    #[error("no writable destination among {}", render_attempts(.attempts))]
    NoWritableDestination { attempts: Vec<Attempt> },

    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
}

impl TopologyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TopologyError::NoCandidates => ErrorKind::ConfigError,
            TopologyError::NoWritableDestination { .. } => ErrorKind::DestinationUnavailable,
            TopologyError::Provenance(_) => ErrorKind::TransferError,
        }
    }
}

fn render_attempts(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| {
            format!(
                "{}:{} ({})",
                a.tier,
                a.path.display(),
                a.reason.as_deref().unwrap_or("ok")
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// One destination candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub tier: String,
    pub path: PathBuf,
    pub require_mount: bool,
}

impl Candidate {
    pub fn new(tier: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            tier: tier.to_string(),
            path: path.into(),
            require_mount: false,
        }
    }

    pub fn require_mount(mut self, require: bool) -> Self {
        self.require_mount = require;
        self
    }
}

/// Every path of every tier, in topology order.
pub fn topology_candidates(tiers: &[TierSpec]) -> Vec<Candidate> {
    tiers.iter().flat_map(tier_candidates).collect()
}

/// The paths of a single tier, in priority order.
pub fn tier_candidates(tier: &TierSpec) -> Vec<Candidate> {
    tier.paths
        .iter()
        .map(|path| Candidate::new(&tier.name, path).require_mount(tier.require_mount))
        .collect()
}

/// Paths of `tier` that exist (and are mounted, when required), in order.
///
/// Used by readers of a tier (cascade sources, retention, checks), which
/// must never create directories on an absent mount.
pub fn available_roots(tier: &TierSpec) -> Vec<PathBuf> {
    tier.paths
        .iter()
        .filter(|path| {
            if !path.is_dir() {
                debug!(tier = %tier.name, path = %path.display(), "tier path missing");
                return false;
            }
            if tier.require_mount && !is_mount_point(path).unwrap_or(false) {
                debug!(tier = %tier.name, path = %path.display(), "tier path not mounted");
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

/// What happened when a candidate was tried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Chosen,
    Failed,
}

/// Record of one candidate attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub tier: String,
    pub path: PathBuf,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub chosen: PathBuf,
    pub tier: String,
    /// Every candidate tried, in order, ending with the chosen one
    pub attempts: Vec<Attempt>,
}

impl Resolution {
    /// Human-readable reason for the choice.
    pub fn reason(&self) -> String {
        let failed = self.failed().count();
        if failed == 0 {
            "first candidate writable".to_string()
        } else {
            format!("fallback after {} unavailable candidate(s)", failed)
        }
    }

    /// Attempts that failed before the choice.
    pub fn failed(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Failed)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.chosen.display(), self.tier)
    }
}

/// Return the first usable candidate.
pub fn resolve(candidates: &[Candidate]) -> Result<Resolution, TopologyError> {
    if candidates.is_empty() {
        return Err(TopologyError::NoCandidates);
    }

    let mut attempts = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match check_candidate(candidate) {
            Ok(()) => {
                attempts.push(Attempt {
                    tier: candidate.tier.clone(),
                    path: candidate.path.clone(),
                    outcome: AttemptOutcome::Chosen,
                    reason: None,
                });
                let resolution = Resolution {
                    chosen: candidate.path.clone(),
                    tier: candidate.tier.clone(),
                    attempts,
                };
                info!(
                    tier = %resolution.tier,
                    chosen = %resolution.chosen.display(),
                    reason = %resolution.reason(),
                    "destination resolved"
                );
                return Ok(resolution);
            }
            Err(reason) => {
                warn!(
                    tier = %candidate.tier,
                    path = %candidate.path.display(),
                    %reason,
                    "destination candidate unavailable"
                );
                attempts.push(Attempt {
                    tier: candidate.tier.clone(),
                    path: candidate.path.clone(),
                    outcome: AttemptOutcome::Failed,
                    reason: Some(reason),
                });
            }
        }
    }

    Err(TopologyError::NoWritableDestination { attempts })
}

fn check_candidate(candidate: &Candidate) -> Result<(), String> {
    let path = &candidate.path;

    if candidate.require_mount {
        if !path.is_dir() {
            return Err("not a mount point (missing)".to_string());
        }
        match is_mount_point(path) {
            Ok(true) => {}
            Ok(false) => return Err("not a mount point".to_string()),
            Err(e) => return Err(format!("mount check failed: {}", e)),
        }
    }

    fs::create_dir_all(path).map_err(|e| format!("cannot create directory: {}", e))?;
    write_probe(path).map_err(|e| format!("write probe failed: {}", e))?;
    debug!(path = %path.display(), "write probe ok");
    Ok(())
}

/// Write, sync and remove a sentinel file in `dir`.
pub fn write_probe(dir: &Path) -> io::Result<()> {
    let probe = dir.join(format!("{}.{}", PROBE_PREFIX, std::process::id()));
    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&probe)?;
        file.write_all(b"probe")?;
        file.sync_all()
    })();
    let removed = fs::remove_file(&probe);
    result?;
    match removed {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Whether `path` sits on a different device than its parent.
#[cfg(unix)]
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let canonical = fs::canonicalize(path)?;
    let parent = match canonical.parent() {
        Some(parent) => parent,
        None => return Ok(true),
    };
    let own = fs::metadata(&canonical)?;
    let above = fs::metadata(parent)?;
    Ok(own.dev() != above.dev() || own.ino() == above.ino())
}

#[cfg(not(unix))]
pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    fs::metadata(path).map(|_| true)
}
