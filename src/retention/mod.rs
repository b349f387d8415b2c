//! Retention engine
//!
//! Reconciles each tier against its retention policies:
//! 1. `plan` partitions one (tier, level) group into keep and purge sets
//! 2. `apply` deletes the purge set (artifact, then sidecar and log)
//!
//! Dry-run plans are reported but never touch the filesystem. A failed
//! deletion is logged and counted; the rest of the batch continues.

mod policy;
mod runner;

pub use policy::{plan, policy_for, RetentionPlan, RetentionPolicy, Strategy};
pub use runner::{run_retention, RetentionError, RetentionOutcome, TierRetention, RETENTION_LEASE};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::artifact::{log_path, sidecar_path};
use crate::summary::{ErrorCounts, ErrorKind};

/// One deletion that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result of applying a plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Artifacts the plan marked for purge
    pub planned: usize,
    /// Artifacts actually removed
    pub removed: usize,
    /// Artifacts whose removal failed
    pub failed: usize,
    /// Bytes of the planned purge set
    pub planned_bytes: u64,
    /// Bytes actually freed (artifacts only)
    pub bytes_reclaimed: u64,
    pub failures: Vec<PurgeFailure>,
    pub dry_run: bool,
}

impl PurgeReport {
    pub fn merge(&mut self, other: PurgeReport) {
        self.planned += other.planned;
        self.removed += other.removed;
        self.failed += other.failed;
        self.planned_bytes += other.planned_bytes;
        self.bytes_reclaimed += other.bytes_reclaimed;
        self.failures.extend(other.failures);
        self.dry_run |= other.dry_run;
    }

    pub fn error_counts(&self) -> ErrorCounts {
        let mut counts = ErrorCounts::new();
        counts.add_n(ErrorKind::PurgeError, self.failures.len());
        counts
    }
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Execute a plan's purge set.
pub fn apply(plan: &RetentionPlan) -> PurgeReport {
    let mut report = PurgeReport {
        planned: plan.purge.len(),
        planned_bytes: plan.purge_bytes(),
        dry_run: plan.dry_run,
        ..PurgeReport::default()
    };

    for artifact in &plan.purge {
        if plan.dry_run {
            info!(
                tier = %plan.tier,
                level = %plan.level,
                artifact = %artifact.path.display(),
                bytes = artifact.size,
                "dry-run: would purge"
            );
            continue;
        }

        if let Err(e) = remove_if_present(&artifact.path) {
            warn!(
                artifact = %artifact.path.display(),
                kind = %ErrorKind::PurgeError,
                error = %e,
                "purge failed"
            );
            report.failed += 1;
            report.failures.push(PurgeFailure {
                path: artifact.path.clone(),
                error: e.to_string(),
            });
            continue;
        }
        report.removed += 1;
        report.bytes_reclaimed += artifact.size;
        info!(tier = %plan.tier, artifact = %artifact.path.display(), bytes = artifact.size, "purged");

        for metadata in [sidecar_path(&artifact.path), log_path(&artifact.path)] {
            match remove_if_present(&metadata) {
                Ok(removed) => {
                    if removed {
                        debug!(path = %metadata.display(), "purged metadata");
                    }
                }
                Err(e) => {
                    warn!(
                        path = %metadata.display(),
                        kind = %ErrorKind::PurgeError,
                        error = %e,
                        "metadata purge failed"
                    );
                    report.failures.push(PurgeFailure {
                        path: metadata,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Artifact, Sidecar};
    use chrono::Utc;
    use tempfile::TempDir;

    fn populate(dir: &Path, count: usize) -> Vec<Artifact> {
        (0..count)
            .map(|i| {
                let name = format!("db01-full-202603{:02}-020000.tar", i + 1);
                let path = dir.join(&name);
                fs::write(&path, vec![0u8; 100]).unwrap();
                Sidecar::new(&"a".repeat(64), &name).write_for(&path).unwrap();
                fs::write(log_path(&path), b"log").unwrap();
                Artifact::from_path("primary", dir, &path).unwrap()
            })
            .collect()
    }

    fn file_count(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_apply_removes_artifact_and_metadata() {
        let dir = TempDir::new().unwrap();
        let artifacts = populate(dir.path(), 5);
        let plan = plan(
            &artifacts,
            &RetentionPolicy::keep_latest("primary", 2),
            Utc::now(),
            false,
        );

        let report = apply(&plan);

        assert_eq!(report.planned, 3);
        assert_eq!(report.removed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes_reclaimed, 300);
        assert_eq!(file_count(dir.path()), 2 * 3);
        for artifact in &plan.purge {
            assert!(!artifact.path.exists());
            assert!(!sidecar_path(&artifact.path).exists());
            assert!(!log_path(&artifact.path).exists());
        }
        for artifact in &plan.keep {
            assert!(artifact.path.exists());
        }
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let artifacts = populate(dir.path(), 5);
        let before = file_count(dir.path());

        let plan = plan(
            &artifacts,
            &RetentionPolicy::keep_latest("primary", 1),
            Utc::now(),
            true,
        );
        let report = apply(&plan);

        assert_eq!(report.planned, 4);
        assert_eq!(report.removed, 0);
        assert_eq!(report.planned_bytes, 400);
        assert_eq!(report.bytes_reclaimed, 0);
        assert!(report.dry_run);
        assert_eq!(file_count(dir.path()), before);
    }

    #[test]
    fn test_already_missing_artifact_counts_as_removed() {
        let dir = TempDir::new().unwrap();
        let artifacts = populate(dir.path(), 2);
        fs::remove_file(&artifacts[0].path).unwrap();

        let plan = plan(
            &artifacts,
            &RetentionPolicy::keep_latest("primary", 1),
            Utc::now(),
            false,
        );
        let report = apply(&plan);

        assert_eq!(report.removed, 1);
        assert!(report.failures.is_empty());
        assert!(report.error_counts().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_deletion_is_counted_not_fatal() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        let mut artifacts = populate(&locked, 2);
        let free = dir.path().join("free");
        fs::create_dir(&free).unwrap();
        artifacts.extend(populate(&free, 3));

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        // Root ignores directory permissions; nothing to assert there.
        let probe = locked.join(".probe");
        let privileged = fs::write(&probe, b"x").is_ok();
        let _ = fs::remove_file(&probe);

        let plan = RetentionPlan {
            tier: "primary".to_string(),
            level: "full".to_string(),
            keep: Vec::new(),
            purge: artifacts,
            dry_run: false,
        };
        let report = apply(&plan);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        if privileged {
            assert_eq!(report.removed, 5);
            return;
        }
        assert_eq!(report.planned, 5);
        assert_eq!(report.failed, 2);
        assert_eq!(report.removed, 3);
        assert_eq!(report.error_counts().get(ErrorKind::PurgeError), 2);
    }
}
