//! Cascade orchestrator
//!
//! Stage states: SCANNING → MIRRORING → HANDOFF → {IDLE | FAILED}
//!
//! Every invocation starts at SCANNING:
//! - an untriggered stage polls its source tier for files modified within
//!   the lookback window
//! - a triggered stage consumes its upstream stage's handoff: nothing to do
//!   unless the upstream sequence is newer than this stage's cursor, and then
//!   every sequence past the cursor is processed, not only the newest
//!
//! MIRRORING resolves each target tier and mirrors every artifact. Any tier
//! failure ends the run in FAILED and no handoff is emitted.
//!
//! HANDOFF writes the manifest, bumps the sequence, then raises the ready
//! flag. An untriggered stage whose verified set is already covered by its
//! last committed manifest does not publish again, which keeps scheduled
//! reruns idempotent while still recovering a crash before publish.

mod manifest;

pub use manifest::{
    manifest_filename, HandoffManifest, ManifestEntry, ManifestError, PendingManifests,
    MANIFEST_PREFIX, MANIFEST_SCHEMA_VERSION,
};

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use cascade_state::{CursorError, HandoffCursor, HandoffStore, HandoffToken, Lease, LeaseError, StoreError};
use chrono::{DateTime, Duration, Utc};
use globset::GlobSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::artifact::{scan_tier, Artifact, ScanOptions};
use crate::config::{Config, ConfigError, StageConfig, TierSpec};
use crate::mirror::{MirrorEngine, MirrorTarget};
use crate::summary::{ErrorCounts, ErrorKind, ExitCode, MetricSet, SummaryLine, TierStatus};
use crate::topology::{available_roots, resolve, tier_candidates, ProvenanceStamp};

/// Lease name guarding a cascade stage
pub fn lease_name(stage: &str) -> String {
    format!("cascade-{}", stage)
}

/// Errors that abort a stage run
#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("stage '{stage}' references unknown tier '{tier}'")]
    UnknownTier { stage: String, tier: String },

    #[error("source tier '{0}' has no available path")]
    SourceUnavailable(String),

    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CascadeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CascadeError::UnknownStage(_)
            | CascadeError::UnknownTier { .. }
            | CascadeError::Config(_) => ErrorKind::ConfigError,
            CascadeError::SourceUnavailable(_) | CascadeError::Scan { .. } => {
                ErrorKind::DestinationUnavailable
            }
            CascadeError::Lease(e) if e.is_busy() => ErrorKind::LockContention,
            CascadeError::Lease(_) => ErrorKind::ConfigError,
            CascadeError::Store(_) | CascadeError::Cursor(_) | CascadeError::Manifest(_) => {
                ErrorKind::TransferError
            }
        }
    }
}

/// Orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CascadeState {
    Scanning,
    Mirroring,
    Handoff,
    Idle,
    Failed,
}

impl CascadeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeState::Scanning => "SCANNING",
            CascadeState::Mirroring => "MIRRORING",
            CascadeState::Handoff => "HANDOFF",
            CascadeState::Idle => "IDLE",
            CascadeState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CascadeState::Idle | CascadeState::Failed)
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: CascadeState) -> bool {
        matches!(
            (self, target),
            (CascadeState::Scanning, CascadeState::Mirroring)
                | (CascadeState::Scanning, CascadeState::Idle)
                | (CascadeState::Scanning, CascadeState::Failed)
                | (CascadeState::Mirroring, CascadeState::Handoff)
                | (CascadeState::Mirroring, CascadeState::Failed)
                | (CascadeState::Handoff, CascadeState::Idle)
                | (CascadeState::Handoff, CascadeState::Failed)
        )
    }
}

impl fmt::Display for CascadeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one stage run
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub stage: String,
    pub state: CascadeState,
    /// Sequence published by this run
    pub published: Option<u64>,
    /// Stage sequence after the run
    pub sequence: u64,
    /// Upstream sequence committed to this stage's cursor
    pub consumed: Option<u64>,
    pub artifacts: usize,
    pub copied_bytes: u64,
    pub skipped: usize,
    /// Per target tier, in configured order
    pub tiers: Vec<(String, TierStatus)>,
    pub errors: ErrorCounts,
}

impl CascadeOutcome {
    pub fn is_success(&self) -> bool {
        self.state != CascadeState::Failed && self.errors.is_empty()
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.errors.is_empty() {
            ExitCode::Success
        } else {
            self.errors.exit_code()
        }
    }

    /// State reported in the SUMMARY line; a run that published reports HANDOFF.
    pub fn reported_state(&self) -> CascadeState {
        if self.published.is_some() {
            CascadeState::Handoff
        } else {
            self.state
        }
    }

    pub fn summary(&self) -> SummaryLine {
        SummaryLine::new("cascade")
            .field("stage", &self.stage)
            .field("state", self.reported_state())
            .field("sequence", self.sequence)
            .field("artifacts", self.artifacts)
            .field("copied_bytes", self.copied_bytes)
            .field("skipped", self.skipped)
            .tiers(self.tiers.iter().map(|(name, status)| (name.as_str(), status)))
            .errors(&self.errors)
    }

    pub fn metrics(&self) -> MetricSet {
        let labels = [("stage", self.stage.as_str())];
        let mut metrics = MetricSet::new(format!("cascade_{}", self.stage));
        metrics.gauge(
            "handoff_sequence",
            "Last published handoff sequence",
            &labels,
            self.sequence as f64,
        );
        metrics.gauge(
            "artifacts",
            "Artifacts considered in the last run",
            &labels,
            self.artifacts as f64,
        );
        metrics.gauge(
            "copied_bytes",
            "Bytes copied in the last run",
            &labels,
            self.copied_bytes as f64,
        );
        metrics.gauge(
            "skipped_copies",
            "Tier copies skipped as already mirrored",
            &labels,
            self.skipped as f64,
        );
        metrics
    }
}

/// Bookkeeping for one run: state transitions plus accumulated outcome.
struct StageRun {
    outcome: CascadeOutcome,
}

impl StageRun {
    fn new(stage: &str, sequence: u64) -> Self {
        info!(stage, state = %CascadeState::Scanning, "cascade run started");
        Self {
            outcome: CascadeOutcome {
                stage: stage.to_string(),
                state: CascadeState::Scanning,
                published: None,
                sequence,
                consumed: None,
                artifacts: 0,
                copied_bytes: 0,
                skipped: 0,
                tiers: Vec::new(),
                errors: ErrorCounts::new(),
            },
        }
    }

    fn to(&mut self, next: CascadeState) {
        let current = self.outcome.state;
        debug_assert!(
            current.can_transition_to(next),
            "invalid transition {} -> {}",
            current,
            next
        );
        info!(stage = %self.outcome.stage, from = %current, to = %next, "cascade transition");
        self.outcome.state = next;
    }

    fn tier_status(&mut self, tier: &str, status: TierStatus) {
        match self.outcome.tiers.iter_mut().find(|(name, _)| name == tier) {
            Some((_, current)) => *current = worse(current, status),
            None => self.outcome.tiers.push((tier.to_string(), status)),
        }
    }

    fn fail(mut self) -> CascadeOutcome {
        self.to(CascadeState::Failed);
        error!(
            stage = %self.outcome.stage,
            errors = %self.outcome.errors.render(),
            "cascade failed, no handoff emitted"
        );
        self.outcome
    }

    fn idle(mut self) -> CascadeOutcome {
        self.to(CascadeState::Idle);
        self.outcome
    }
}

/// Failed beats Ok beats Skipped
fn worse(current: &TierStatus, next: TierStatus) -> TierStatus {
    let rank = |s: &TierStatus| match s {
        TierStatus::Skipped => 0,
        TierStatus::Ok => 1,
        TierStatus::Failed(_) => 2,
    };
    if rank(&next) > rank(current) {
        next
    } else {
        current.clone()
    }
}

/// Drives cascade stages against one loaded configuration.
pub struct Orchestrator<'a> {
    config: &'a Config,
    include: GlobSet,
    engine: MirrorEngine,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config) -> Result<Self, CascadeError> {
        Ok(Self {
            config,
            include: config.include_set()?,
            engine: MirrorEngine::new(config.cascade.verify_integrity),
        })
    }

    fn tier(&self, stage: &StageConfig, name: &str) -> Result<&'a TierSpec, CascadeError> {
        self.config.tier(name).ok_or_else(|| CascadeError::UnknownTier {
            stage: stage.name.clone(),
            tier: name.to_string(),
        })
    }

    /// Run one stage under its lease.
    pub fn run_stage(&self, name: &str, now: DateTime<Utc>) -> Result<CascadeOutcome, CascadeError> {
        let stage = self
            .config
            .stage(name)
            .ok_or_else(|| CascadeError::UnknownStage(name.to_string()))?;

        let _lease = Lease::acquire(&self.config.lock_dir(), &lease_name(&stage.name))?;
        let store = HandoffStore::open(self.config.handoff_dir(&stage.name))?;
        let mut run = StageRun::new(&stage.name, store.current()?);

        let source = self.tier(stage, &stage.source)?;
        let roots = available_roots(source);
        if roots.is_empty() {
            return Err(CascadeError::SourceUnavailable(source.name.clone()));
        }

        // SCANNING
        let mut cursor = None;
        let mut consumed = None;
        let artifacts = match &stage.trigger {
            None => self.scan_recent(source, &roots, stage, now)?,
            Some(upstream) => {
                let upstream_store = HandoffStore::open(self.config.handoff_dir(upstream))?;
                let stage_cursor = HandoffCursor::new(self.config.cursor_path(&stage.name));
                let Some(pending) = stage_cursor.pending(&upstream_store)? else {
                    info!(stage = %stage.name, upstream = %upstream, "no pending upstream handoff");
                    return Ok(run.idle());
                };
                let last = stage_cursor.last()?;
                info!(
                    stage = %stage.name,
                    upstream = %upstream,
                    from = last + 1,
                    to = pending,
                    "consuming upstream handoff"
                );

                let manifests = HandoffManifest::read_range(&upstream_store, last, pending)?;
                let mut artifacts =
                    self.resolve_entries(source, &roots, &manifests.entries(), &mut run);
                if !manifests.is_complete() {
                    warn!(
                        stage = %stage.name,
                        upstream = %upstream,
                        missing = ?manifests.missing,
                        "upstream manifests missing, adding lookback scan"
                    );
                    let mut seen: HashSet<PathBuf> =
                        artifacts.iter().map(|a| a.relative.clone()).collect();
                    let recent = self.scan_recent(source, &roots, stage, now)?;
                    artifacts.extend(recent.into_iter().filter(|a| seen.insert(a.relative.clone())));
                }
                consumed = Some(pending);
                cursor = Some(stage_cursor);
                artifacts
            }
        };

        run.outcome.artifacts = artifacts.len();
        if !run.outcome.errors.is_empty() {
            return Ok(run.fail());
        }
        if artifacts.is_empty() {
            info!(stage = %stage.name, "no artifacts to cascade");
            if let (Some(cursor), Some(sequence)) = (&cursor, consumed) {
                run.outcome.consumed = Some(cursor.commit(sequence)?);
                self.prune_consumed(stage)?;
            }
            return Ok(run.idle());
        }

        // MIRRORING
        run.to(CascadeState::Mirroring);
        let mut targets = Vec::new();
        for target_name in &stage.targets {
            let tier = self.tier(stage, target_name)?;
            match resolve(&tier_candidates(tier)) {
                Ok(resolution) => {
                    run.tier_status(&tier.name, TierStatus::Skipped);
                    targets.push((MirrorTarget::new(&tier.name, &resolution.chosen), resolution));
                }
                Err(e) => {
                    error!(tier = %tier.name, kind = %e.kind(), error = %e, "target tier unavailable");
                    run.tier_status(&tier.name, TierStatus::Failed(e.kind()));
                    run.outcome.errors.add(e.kind());
                }
            }
        }

        let mirror_targets: Vec<MirrorTarget> = targets.iter().map(|(t, _)| t.clone()).collect();
        let mut mirrored: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut entries = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            let report = self.engine.mirror(artifact, &mirror_targets);
            for tier in &report.tiers {
                run.tier_status(&tier.tier, tier.status());
                run.outcome.copied_bytes += tier.copied_bytes;
                if tier.skipped {
                    run.outcome.skipped += 1;
                }
                if tier.is_ok() {
                    mirrored
                        .entry(tier.tier.clone())
                        .or_default()
                        .push(artifact.file_name());
                }
            }
            run.outcome.errors.merge(&report.error_counts());
            if let (true, Some(digest)) = (report.is_success(), report.digest) {
                entries.push(ManifestEntry {
                    path: artifact.relative_str(),
                    digest,
                    size: artifact.size,
                });
            }
        }

        for (target, resolution) in &targets {
            let names = mirrored.get(&target.tier).map(Vec::as_slice).unwrap_or(&[]);
            if names.is_empty() {
                continue;
            }
            if let Err(e) = ProvenanceStamp::new(resolution, now)
                .record_many(names.iter().map(String::as_str))
            {
                warn!(tier = %target.tier, error = %e, "failed to record provenance");
            }
        }

        if !run.outcome.errors.is_empty() {
            return Ok(run.fail());
        }

        // HANDOFF
        run.to(CascadeState::Handoff);
        if stage.trigger.is_none() {
            if let Some(last) = HandoffManifest::read_committed(&store)? {
                if last.covers(&entries) {
                    info!(
                        stage = %stage.name,
                        sequence = last.sequence,
                        "verified set already handed off"
                    );
                    return Ok(run.idle());
                }
            }
        }

        let next = store.current()? + 1;
        HandoffManifest::new(&stage.name, next, now, entries).write(&store)?;
        let token = store.publish(next)?;
        run.outcome.published = Some(token.sequence);
        run.outcome.sequence = token.sequence;

        if let (Some(cursor), Some(sequence)) = (&cursor, consumed) {
            run.outcome.consumed = Some(cursor.commit(sequence)?);
            self.prune_consumed(stage)?;
        }

        Ok(run.idle())
    }

    /// Drop upstream manifests that every consumer of the upstream has passed.
    fn prune_consumed(&self, stage: &StageConfig) -> Result<(), CascadeError> {
        let Some(upstream) = &stage.trigger else {
            return Ok(());
        };
        let mut oldest = u64::MAX;
        for consumer in &self.config.cascade.stages {
            if consumer.trigger.as_deref() == Some(upstream.as_str()) {
                let last = HandoffCursor::new(self.config.cursor_path(&consumer.name)).last()?;
                oldest = oldest.min(last);
            }
        }
        if oldest == u64::MAX {
            return Ok(());
        }
        let upstream_store = HandoffStore::open(self.config.handoff_dir(upstream))?;
        // Every consumer has processed up to and including `oldest`.
        HandoffManifest::prune(&upstream_store, oldest.saturating_add(1))?;
        Ok(())
    }

    /// Files under the source tier modified within the stage's lookback.
    fn scan_recent(
        &self,
        source: &TierSpec,
        roots: &[PathBuf],
        stage: &StageConfig,
        now: DateTime<Utc>,
    ) -> Result<Vec<Artifact>, CascadeError> {
        let hours = stage.lookback_hours.min(24 * 366 * 100) as i64;
        let since = SystemTime::from(now - Duration::hours(hours));
        let options = ScanOptions::new(self.include.clone()).modified_since(since);

        let mut seen = HashSet::new();
        let mut artifacts = Vec::new();
        for root in roots {
            let found = scan_tier(&source.name, root, &options).map_err(|source| {
                CascadeError::Scan {
                    path: root.clone(),
                    source,
                }
            })?;
            artifacts.extend(found.into_iter().filter(|a| seen.insert(a.relative.clone())));
        }
        debug!(stage = %stage.name, count = artifacts.len(), "lookback scan complete");
        Ok(artifacts)
    }

    /// Locate each handed-off entry under the source tier.
    ///
    /// Missing or mismatching entries are counted as errors on `run`.
    fn resolve_entries(
        &self,
        source: &TierSpec,
        roots: &[PathBuf],
        entries: &[ManifestEntry],
        run: &mut StageRun,
    ) -> Vec<Artifact> {
        let mut artifacts = Vec::with_capacity(entries.len());
        for entry in entries {
            let found = roots.iter().find_map(|root| {
                let path = root.join(Path::new(&entry.path));
                path.is_file().then(|| (root, path))
            });
            let Some((root, path)) = found else {
                error!(
                    tier = %source.name,
                    artifact = %entry.path,
                    kind = %ErrorKind::TransferError,
                    "handed-off artifact missing from source tier"
                );
                run.outcome.errors.add(ErrorKind::TransferError);
                continue;
            };

            let mut artifact = match Artifact::from_path(&source.name, root, &path) {
                Ok(artifact) => artifact,
                Err(e) => {
                    error!(artifact = %path.display(), error = %e, "cannot read handed-off artifact");
                    run.outcome.errors.add(ErrorKind::TransferError);
                    continue;
                }
            };
            match &artifact.digest {
                Some(digest) if !digest.eq_ignore_ascii_case(&entry.digest) => {
                    error!(
                        artifact = %path.display(),
                        kind = %ErrorKind::VerificationMismatch,
                        sidecar = %digest,
                        manifest = %entry.digest,
                        "sidecar disagrees with upstream manifest"
                    );
                    run.outcome.errors.add(ErrorKind::VerificationMismatch);
                    continue;
                }
                Some(_) => {}
                None => artifact.digest = Some(entry.digest.clone()),
            }
            artifacts.push(artifact);
        }
        artifacts
    }
}

/// Handoff and cursor state of one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub source: String,
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub handoff: HandoffToken,
    /// Last upstream sequence consumed (triggered stages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
    /// Artifacts named by the committed manifest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_artifacts: Option<usize>,
    /// Another process holds the stage lease right now
    pub running: bool,
}

/// Snapshot of every configured stage.
pub fn stage_status(config: &Config) -> Result<Vec<StageStatus>, CascadeError> {
    config
        .cascade
        .stages
        .iter()
        .map(|stage| {
            let store = HandoffStore::open(config.handoff_dir(&stage.name))?;
            let cursor = match &stage.trigger {
                Some(_) => Some(HandoffCursor::new(config.cursor_path(&stage.name)).last()?),
                None => None,
            };
            let manifest = HandoffManifest::read_committed(&store)?;
            let running = match Lease::acquire(&config.lock_dir(), &lease_name(&stage.name)) {
                Ok(_) => false,
                Err(e) if e.is_busy() => true,
                Err(e) => return Err(e.into()),
            };
            Ok(StageStatus {
                stage: stage.name.clone(),
                source: stage.source.clone(),
                targets: stage.targets.clone(),
                trigger: stage.trigger.clone(),
                handoff: store.token()?,
                cursor,
                manifest_artifacts: manifest.map(|m| m.artifacts.len()),
                running,
            })
        })
        .collect()
}
