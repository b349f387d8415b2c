//! Disaster-recovery smoke check
//!
//! Re-hashes every artifact in each available tier against its checksum
//! sidecar and, with `--integrity`, walks the archive format too. Failures
//! are alerted through the log, the SUMMARY line and the exit code; nothing
//! is repaired.

use std::path::PathBuf;

use cascade_state::{Lease, LeaseError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::artifact::{integrity_test, scan_tier, verify, Artifact, IntegrityStatus, ScanOptions, Sidecar};
use crate::config::{Config, ConfigError, TierSpec};
use crate::summary::{ErrorCounts, ErrorKind, ExitCode, MetricSet, SummaryLine, TierStatus};
use crate::topology::available_roots;

/// Lease name guarding check runs
pub const CHECK_LEASE: &str = "check";

/// Errors that abort a check before any tier is read
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("unknown tier '{0}'")]
    UnknownTier(String),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CheckError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckError::Lease(e) if e.is_busy() => ErrorKind::LockContention,
            CheckError::UnknownTier(_) | CheckError::Lease(_) | CheckError::Config(_) => {
                ErrorKind::ConfigError
            }
        }
    }
}

/// One artifact that did not pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub path: PathBuf,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Per-tier tally
#[derive(Debug, Clone)]
pub struct TierCheck {
    pub tier: String,
    pub status: TierStatus,
    pub checked: usize,
    pub verified: usize,
    /// Artifacts without a sidecar; nothing to compare against
    pub unverified: usize,
    /// Integrity tests skipped for unknown formats
    pub unsupported: usize,
    /// Roots that could not be walked
    pub unreadable_roots: usize,
    pub failures: Vec<CheckFailure>,
}

impl TierCheck {
    fn new(tier: &str) -> Self {
        Self {
            tier: tier.to_string(),
            status: TierStatus::Skipped,
            checked: 0,
            verified: 0,
            unverified: 0,
            unsupported: 0,
            unreadable_roots: 0,
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, artifact: &Artifact, kind: ErrorKind, reason: String) {
        error!(
            tier = %self.tier,
            artifact = %artifact.path.display(),
            kind = %kind,
            reason = %reason,
            "check failed"
        );
        self.failures.push(CheckFailure {
            path: artifact.path.clone(),
            kind,
            reason,
        });
    }
}

/// Result of one check run
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub integrity: bool,
    pub tiers: Vec<TierCheck>,
    pub errors: ErrorCounts,
}

impl CheckOutcome {
    pub fn checked(&self) -> usize {
        self.tiers.iter().map(|t| t.checked).sum()
    }

    pub fn failed(&self) -> usize {
        self.tiers.iter().map(|t| t.failures.len()).sum()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn exit_code(&self) -> ExitCode {
        self.errors.exit_code()
    }

    pub fn summary(&self) -> SummaryLine {
        SummaryLine::new("check")
            .field("integrity", self.integrity)
            .field("checked", self.checked())
            .field("failed", self.failed())
            .tiers(self.tiers.iter().map(|t| (t.tier.as_str(), &t.status)))
            .errors(&self.errors)
    }

    pub fn metrics(&self) -> MetricSet {
        let mut metrics = MetricSet::new("check");
        for tier in &self.tiers {
            let labels = [("tier", tier.tier.as_str())];
            metrics.gauge(
                "check_artifacts",
                "Artifacts checked in the last run",
                &labels,
                tier.checked as f64,
            );
            metrics.gauge(
                "check_failures",
                "Artifacts failing digest or integrity checks",
                &labels,
                tier.failures.len() as f64,
            );
            metrics.gauge(
                "check_unverified",
                "Artifacts without a checksum sidecar",
                &labels,
                tier.unverified as f64,
            );
        }
        metrics
    }
}

/// Check every tier (or just `tier_filter`) under the `check` lease.
pub fn run_check(
    config: &Config,
    tier_filter: Option<&str>,
    integrity: bool,
) -> Result<CheckOutcome, CheckError> {
    if let Some(name) = tier_filter {
        if config.tier(name).is_none() {
            return Err(CheckError::UnknownTier(name.to_string()));
        }
    }
    let options = ScanOptions::new(config.include_set()?);
    let _lease = Lease::acquire(&config.lock_dir(), CHECK_LEASE)?;
    info!(integrity, "check started");

    let mut outcome = CheckOutcome {
        integrity,
        tiers: Vec::new(),
        errors: ErrorCounts::new(),
    };
    for tier in &config.tiers {
        if tier_filter.is_some_and(|name| name != tier.name) {
            continue;
        }
        let result = check_tier(tier, &options, integrity);
        outcome
            .errors
            .add_n(ErrorKind::DestinationUnavailable, result.unreadable_roots);
        for failure in &result.failures {
            outcome.errors.add(failure.kind);
        }
        outcome.tiers.push(result);
    }

    info!(
        checked = outcome.checked(),
        failed = outcome.failed(),
        errors = %outcome.errors.render(),
        "check finished"
    );
    Ok(outcome)
}

fn check_tier(tier: &TierSpec, options: &ScanOptions, integrity: bool) -> TierCheck {
    let mut result = TierCheck::new(&tier.name);

    let roots = available_roots(tier);
    if roots.is_empty() {
        warn!(tier = %tier.name, paths = ?tier.paths, "no available path for tier, skipping check");
        return result;
    }

    for root in &roots {
        let artifacts = match scan_tier(&tier.name, root, options) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!(
                    tier = %tier.name,
                    root = %root.display(),
                    kind = %ErrorKind::DestinationUnavailable,
                    error = %e,
                    "tier scan failed"
                );
                result.unreadable_roots += 1;
                result.status = TierStatus::Failed(ErrorKind::DestinationUnavailable);
                continue;
            }
        };
        for artifact in &artifacts {
            check_artifact(&mut result, artifact, integrity);
        }
    }

    if let Some(first) = result.failures.first() {
        result.status = TierStatus::Failed(first.kind);
    } else if result.status == TierStatus::Skipped {
        result.status = TierStatus::Ok;
    }
    result
}

fn check_artifact(result: &mut TierCheck, artifact: &Artifact, integrity: bool) {
    result.checked += 1;

    match Sidecar::read_for(&artifact.path) {
        Ok(Some(sidecar)) if !sidecar.names(&artifact.file_name()) => {
            result.fail(
                artifact,
                ErrorKind::VerificationMismatch,
                format!("sidecar names '{}'", sidecar.file_name),
            );
            return;
        }
        Ok(Some(sidecar)) => match verify(&artifact.path, &sidecar.digest) {
            Ok(true) => {
                result.verified += 1;
                debug!(artifact = %artifact.path.display(), "digest verified");
            }
            Ok(false) => {
                result.fail(
                    artifact,
                    ErrorKind::VerificationMismatch,
                    "digest does not match sidecar".to_string(),
                );
                return;
            }
            Err(e) => {
                result.fail(artifact, ErrorKind::TransferError, e.to_string());
                return;
            }
        },
        Ok(None) => {
            result.unverified += 1;
            warn!(artifact = %artifact.path.display(), "no checksum sidecar, digest not checked");
        }
        Err(e) => {
            result.fail(artifact, ErrorKind::VerificationMismatch, e.to_string());
            return;
        }
    }

    if !integrity {
        return;
    }
    match integrity_test(&artifact.path) {
        Ok(report) => match report.status {
            IntegrityStatus::Passed => {
                debug!(
                    artifact = %artifact.path.display(),
                    format = %report.format,
                    entries = report.entries,
                    "integrity passed"
                );
            }
            IntegrityStatus::Unsupported => result.unsupported += 1,
            IntegrityStatus::Failed(reason) => {
                result.fail(artifact, ErrorKind::VerificationMismatch, reason);
            }
        },
        Err(e) => result.fail(artifact, e.kind(), e.to_string()),
    }
}
