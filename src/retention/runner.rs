//! Retention run: every tier with a policy, under the `retention` lease

use std::collections::BTreeMap;
use std::path::PathBuf;

use cascade_state::{Lease, LeaseError};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{apply, plan, policy_for, PurgeReport, RetentionPlan, RetentionPolicy};
use crate::artifact::{scan_tier, Artifact, ScanOptions};
use crate::config::{Config, ConfigError, TierSpec};
use crate::summary::{ErrorCounts, ErrorKind, ExitCode, MetricSet, SummaryLine, TierStatus};
use crate::topology::available_roots;

/// Lease name guarding retention runs
pub const RETENTION_LEASE: &str = "retention";

/// Errors that abort a retention run before any tier is touched
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("unknown tier '{0}'")]
    UnknownTier(String),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RetentionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RetentionError::Lease(e) if e.is_busy() => ErrorKind::LockContention,
            RetentionError::UnknownTier(_)
            | RetentionError::Lease(_)
            | RetentionError::Config(_) => ErrorKind::ConfigError,
        }
    }
}

/// What happened to one tier
#[derive(Debug, Clone)]
pub struct TierRetention {
    pub tier: String,
    pub status: TierStatus,
    /// Levels that had a policy and were planned
    pub levels: Vec<String>,
    /// Artifact copies seen across the tier's available roots
    pub scanned: usize,
    /// Distinct backups among them; copies share a tier-relative path
    pub backups: usize,
    pub report: PurgeReport,
}

/// Result of one retention run
#[derive(Debug, Clone)]
pub struct RetentionOutcome {
    pub dry_run: bool,
    pub tiers: Vec<TierRetention>,
    pub errors: ErrorCounts,
}

impl RetentionOutcome {
    /// Totals across tiers
    pub fn totals(&self) -> PurgeReport {
        let mut total = PurgeReport {
            dry_run: self.dry_run,
            ..PurgeReport::default()
        };
        for tier in &self.tiers {
            total.merge(tier.report.clone());
        }
        total
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Purge errors are counted but keep the run successful.
    pub fn exit_code(&self) -> ExitCode {
        self.errors.exit_code()
    }

    pub fn summary(&self) -> SummaryLine {
        let totals = self.totals();
        SummaryLine::new("retention")
            .field("dry_run", self.dry_run)
            .field("planned", totals.planned)
            .field("removed", totals.removed)
            .field("bytes_reclaimed", totals.bytes_reclaimed)
            .tiers(self.tiers.iter().map(|t| (t.tier.as_str(), &t.status)))
            .errors(&self.errors)
    }

    pub fn metrics(&self) -> MetricSet {
        let mut metrics = MetricSet::new("retention");
        for tier in &self.tiers {
            let labels = [("tier", tier.tier.as_str())];
            metrics.gauge(
                "retention_planned",
                "Artifacts planned for purge in the last run",
                &labels,
                tier.report.planned as f64,
            );
            metrics.gauge(
                "retention_removed",
                "Artifacts removed in the last run",
                &labels,
                tier.report.removed as f64,
            );
            metrics.gauge(
                "retention_bytes_reclaimed",
                "Bytes reclaimed in the last run",
                &labels,
                tier.report.bytes_reclaimed as f64,
            );
        }
        metrics.gauge(
            "retention_dry_run",
            "Whether the last run was a dry run",
            &[],
            if self.dry_run { 1.0 } else { 0.0 },
        );
        metrics
    }
}

/// Reconcile tiers against their policies.
///
/// `tier_filter` limits the run to one tier. Tiers without a policy, or
/// without any available root, are reported as skipped.
pub fn run_retention(
    config: &Config,
    tier_filter: Option<&str>,
    dry_run: bool,
    now: DateTime<Utc>,
) -> Result<RetentionOutcome, RetentionError> {
    if let Some(name) = tier_filter {
        if config.tier(name).is_none() {
            return Err(RetentionError::UnknownTier(name.to_string()));
        }
    }
    let policies = config.retention_policies()?;
    let include = config.include_set()?;

    let _lease = Lease::acquire(&config.lock_dir(), RETENTION_LEASE)?;
    info!(dry_run, policies = policies.len(), "retention run started");

    let mut outcome = RetentionOutcome {
        dry_run,
        tiers: Vec::new(),
        errors: ErrorCounts::new(),
    };
    let options = ScanOptions::new(include);

    for tier in &config.tiers {
        if tier_filter.is_some_and(|name| name != tier.name) {
            continue;
        }
        if !policies.iter().any(|p| p.tier == tier.name) {
            debug!(tier = %tier.name, "no retention policy, skipping tier");
            continue;
        }
        let result = reconcile_tier(tier, &policies, &options, dry_run, now);
        outcome.errors.merge(&result.report.error_counts());
        if let TierStatus::Failed(kind) = &result.status {
            if *kind != ErrorKind::PurgeError {
                outcome.errors.add(*kind);
            }
        }
        outcome.tiers.push(result);
    }

    let totals = outcome.totals();
    info!(
        dry_run,
        planned = totals.planned,
        removed = totals.removed,
        bytes_reclaimed = totals.bytes_reclaimed,
        errors = %outcome.errors.render(),
        "retention run finished"
    );
    Ok(outcome)
}

fn reconcile_tier(
    tier: &TierSpec,
    policies: &[RetentionPolicy],
    options: &ScanOptions,
    dry_run: bool,
    now: DateTime<Utc>,
) -> TierRetention {
    let mut result = TierRetention {
        tier: tier.name.clone(),
        status: TierStatus::Skipped,
        levels: Vec::new(),
        scanned: 0,
        backups: 0,
        report: PurgeReport {
            dry_run,
            ..PurgeReport::default()
        },
    };

    let roots = available_roots(tier);
    if roots.is_empty() {
        warn!(
            tier = %tier.name,
            paths = ?tier.paths,
            "no available path for tier, skipping retention"
        );
        return result;
    }

    let artifacts = match scan_roots(&tier.name, &roots, options) {
        Ok(artifacts) => artifacts,
        Err((root, e)) => {
            // A partial view could purge copies the full view would keep.
            warn!(
                tier = %tier.name,
                root = %root.display(),
                kind = %ErrorKind::DestinationUnavailable,
                error = %e,
                "tier scan failed, skipping retention"
            );
            result.status = TierStatus::Failed(ErrorKind::DestinationUnavailable);
            return result;
        }
    };
    result.scanned = artifacts.len();

    // Policies count backups, not copies: plan on one copy per relative path
    // and keep or purge every copy of it together.
    let copies = group_copies(artifacts);
    result.backups = copies.len();
    let mut by_level: BTreeMap<String, Vec<Artifact>> = BTreeMap::new();
    for group in copies.values() {
        if let Some(first) = group.first() {
            by_level.entry(first.level.clone()).or_default().push(first.clone());
        }
    }

    for (level, group) in &by_level {
        let Some(policy) = policy_for(policies, &tier.name, level) else {
            debug!(tier = %tier.name, level, "no policy for level, keeping all");
            continue;
        };
        let plan = with_all_copies(plan(group, policy, now, dry_run), &copies);
        info!(
            tier = %tier.name,
            level,
            strategy = %policy.strategy,
            keep = plan.keep.len(),
            purge = plan.purge.len(),
            dry_run,
            "retention planned"
        );
        result.levels.push(level.clone());
        result.report.merge(apply(&plan));
    }

    result.status = if result.report.failures.is_empty() {
        TierStatus::Ok
    } else {
        TierStatus::Failed(ErrorKind::PurgeError)
    };
    result
}

/// Copies of each backup across roots, keyed by tier-relative path.
fn group_copies(artifacts: Vec<Artifact>) -> BTreeMap<PathBuf, Vec<Artifact>> {
    let mut copies: BTreeMap<PathBuf, Vec<Artifact>> = BTreeMap::new();
    for artifact in artifacts {
        copies.entry(artifact.relative.clone()).or_default().push(artifact);
    }
    copies
}

/// Widen a plan made on one copy per backup to every copy of each backup.
fn with_all_copies(
    plan: RetentionPlan,
    copies: &BTreeMap<PathBuf, Vec<Artifact>>,
) -> RetentionPlan {
    let widen = |chosen: Vec<Artifact>| -> Vec<Artifact> {
        chosen
            .into_iter()
            .flat_map(|artifact| match copies.get(&artifact.relative) {
                Some(all) => all.clone(),
                None => vec![artifact],
            })
            .collect()
    };
    RetentionPlan {
        keep: widen(plan.keep),
        purge: widen(plan.purge),
        ..plan
    }
}

fn scan_roots(
    tier: &str,
    roots: &[PathBuf],
    options: &ScanOptions,
) -> Result<Vec<Artifact>, (PathBuf, std::io::Error)> {
    let mut artifacts = Vec::new();
    for root in roots {
        let found = scan_tier(tier, root, options).map_err(|e| (root.clone(), e))?;
        artifacts.extend(found);
    }
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{log_path, sidecar_path};
    use chrono::TimeZone;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(dir: &Path, retention: &str) -> Config {
        let toml = format!(
            r#"
state_dir = "{state}"

[[tier]]
name = "primary"
role = "primary"
paths = ["{primary}"]

[[tier]]
name = "secondary"
role = "secondary"
paths = ["{secondary}"]

[cascade]
include = ["*.tar"]

[[cascade.stage]]
name = "scan"
source = "primary"
targets = ["secondary"]

{retention}
"#,
            state = dir.join("state").display(),
            primary = dir.join("primary").display(),
            secondary = dir.join("secondary").display(),
            retention = retention,
        );
        Config::from_toml_str(&toml).unwrap()
    }

    fn put(root: &Path, name: &str) -> PathBuf {
        fs::create_dir_all(root).unwrap();
        let path = root.join(name);
        fs::write(&path, vec![1u8; 10]).unwrap();
        fs::write(sidecar_path(&path), format!("{}  {}\n", "0".repeat(64), name)).unwrap();
        fs::write(log_path(&path), b"ok").unwrap();
        path
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 31, 12, 0, 0).unwrap()
    }

    const KEEP_TWO: &str = r#"
[[retention]]
tier = "primary"
strategy = "keep_latest"
keep = 2
"#;

    #[test]
    fn test_keep_latest_per_level() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("primary");
        for day in 1..=4 {
            put(&primary, &format!("db01-full-202603{:02}-020000.tar", day));
            put(&primary, &format!("db01-incr-202603{:02}-020000.tar", day));
        }
        let config = config(dir.path(), KEEP_TWO);

        let outcome = run_retention(&config, None, false, now()).unwrap();

        assert_eq!(outcome.tiers.len(), 1);
        let tier = &outcome.tiers[0];
        assert_eq!(tier.status, TierStatus::Ok);
        assert_eq!(tier.levels, vec!["full".to_string(), "incr".to_string()]);
        assert_eq!(tier.report.removed, 4);
        assert!(primary.join("db01-full-20260304-020000.tar").exists());
        assert!(primary.join("db01-full-20260303-020000.tar").exists());
        assert!(!primary.join("db01-full-20260302-020000.tar").exists());
        assert!(!primary.join("db01-incr-20260301-020000.tar.sha256").exists());
        assert_eq!(outcome.exit_code(), ExitCode::Success);
        assert!(outcome.summary().to_string().contains("removed=4"));
    }

    #[test]
    fn test_dry_run_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("primary");
        for day in 1..=5 {
            put(&primary, &format!("db01-full-202603{:02}-020000.tar", day));
        }
        let before = fs::read_dir(&primary).unwrap().count();
        let config = config(dir.path(), KEEP_TWO);

        let outcome = run_retention(&config, None, true, now()).unwrap();

        assert_eq!(outcome.totals().planned, 3);
        assert_eq!(outcome.totals().removed, 0);
        assert_eq!(fs::read_dir(&primary).unwrap().count(), before);
        let line = outcome.summary().to_string();
        assert!(line.contains("dry_run=true"));
        assert!(line.contains("planned=3"));
    }

    #[test]
    fn test_level_policy_overrides_tier_policy() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("primary");
        for day in 1..=4 {
            put(&primary, &format!("db01-full-202603{:02}-020000.tar", day));
            put(&primary, &format!("db01-incr-202603{:02}-020000.tar", day));
        }
        let rules = format!(
            "{}\n[[retention]]\ntier = \"primary\"\nlevel = \"incr\"\nstrategy = \"keep_latest\"\nkeep = 1\n",
            KEEP_TWO
        );
        let config = config(dir.path(), &rules);

        let outcome = run_retention(&config, None, false, now()).unwrap();

        assert_eq!(outcome.totals().removed, 2 + 3);
        assert!(primary.join("db01-incr-20260304-020000.tar").exists());
        assert!(!primary.join("db01-incr-20260303-020000.tar").exists());
    }

    #[test]
    fn test_copies_on_two_roots_count_once() {
        let dir = TempDir::new().unwrap();
        let usb = dir.path().join("usb");
        let nas = dir.path().join("nas");
        for day in 1..=3 {
            let name = format!("db01-full-202603{:02}-020000.tar", day);
            put(&usb, &name);
            put(&nas, &name);
        }
        put(&nas, "db01-full-20260228-020000.tar");
        let toml = format!(
            r#"
state_dir = "{state}"

[[tier]]
name = "secondary"
role = "secondary"
paths = ["{usb}", "{nas}"]

[cascade]
include = ["*.tar"]

[[retention]]
tier = "secondary"
strategy = "keep_latest"
keep = 3
"#,
            state = dir.path().join("state").display(),
            usb = usb.display(),
            nas = nas.display(),
        );
        let config = Config::from_toml_str(&toml).unwrap();

        let outcome = run_retention(&config, None, false, now()).unwrap();

        let tier = &outcome.tiers[0];
        assert_eq!(tier.scanned, 7);
        assert_eq!(tier.backups, 4);
        assert_eq!(tier.report.removed, 1);
        for day in 1..=3 {
            let name = format!("db01-full-202603{:02}-020000.tar", day);
            assert!(usb.join(&name).exists(), "{} lost on usb", name);
            assert!(nas.join(&name).exists(), "{} lost on nas", name);
        }
        assert!(!nas.join("db01-full-20260228-020000.tar").exists());
    }

    #[test]
    fn test_purged_backup_loses_every_copy() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("primary");
        let spare = dir.path().join("spare");
        for day in 1..=3 {
            let name = format!("db01-full-202603{:02}-020000.tar", day);
            put(&primary, &name);
            put(&spare, &name);
        }
        let toml = format!(
            r#"
state_dir = "{state}"

[[tier]]
name = "primary"
role = "primary"
paths = ["{primary}", "{spare}"]

[cascade]
include = ["*.tar"]

[[retention]]
tier = "primary"
strategy = "keep_latest"
keep = 1
"#,
            state = dir.path().join("state").display(),
            primary = primary.display(),
            spare = spare.display(),
        );
        let config = Config::from_toml_str(&toml).unwrap();

        let outcome = run_retention(&config, None, false, now()).unwrap();

        assert_eq!(outcome.totals().removed, 4);
        for root in [&primary, &spare] {
            assert!(root.join("db01-full-20260303-020000.tar").exists());
            assert!(!root.join("db01-full-20260302-020000.tar").exists());
            assert!(!root.join("db01-full-20260301-020000.tar").exists());
        }
    }

    #[test]
    fn test_unavailable_tier_is_skipped() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), KEEP_TWO);

        let outcome = run_retention(&config, None, false, now()).unwrap();

        assert_eq!(outcome.tiers[0].status, TierStatus::Skipped);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.exit_code(), ExitCode::Success);
    }

    #[test]
    fn test_tier_filter() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("primary");
        for day in 1..=3 {
            put(&primary, &format!("db01-full-202603{:02}-020000.tar", day));
        }
        let config = config(dir.path(), KEEP_TWO);

        let outcome = run_retention(&config, Some("secondary"), false, now()).unwrap();
        assert!(outcome.tiers.is_empty());
        assert_eq!(fs::read_dir(&primary).unwrap().count(), 9);

        let err = run_retention(&config, Some("tape"), false, now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn test_contended_lease() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path(), KEEP_TWO);
        let _held = Lease::acquire(&config.lock_dir(), RETENTION_LEASE).unwrap();

        let err = run_retention(&config, None, false, now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockContention);
    }

    #[test]
    fn test_metrics_per_tier() {
        let dir = TempDir::new().unwrap();
        let primary = dir.path().join("primary");
        for day in 1..=3 {
            put(&primary, &format!("db01-full-202603{:02}-020000.tar", day));
        }
        let config = config(dir.path(), KEEP_TWO);

        let outcome = run_retention(&config, None, false, now()).unwrap();
        let text = outcome.metrics().render();
        assert!(text.contains("backup_cascade_retention_removed{tier=\"primary\"} 1"));
        assert!(text.contains("backup_cascade_retention_bytes_reclaimed{tier=\"primary\"} 10"));
    }
}
