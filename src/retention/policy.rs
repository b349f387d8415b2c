//! Retention policies and keep/purge planning

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;

use crate::artifact::Artifact;
use crate::config::{RetentionRule, StrategyKind};

/// How a policy decides what survives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Strategy {
    /// Newest `count` artifacts
    KeepLatest { count: usize },
    /// Newest per ISO week over the last `weeks` weeks, plus newest per month
    TimeBucketed { weeks: u32 },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::KeepLatest { count } => write!(f, "keep_latest({})", count),
            Strategy::TimeBucketed { weeks } => write!(f, "time_bucketed({}w+monthly)", weeks),
        }
    }
}

/// Retention policy for one tier, optionally limited to one level
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionPolicy {
    pub tier: String,
    pub level: Option<String>,
    pub strategy: Strategy,
    /// Floor on artifacts kept per (tier, level)
    pub min_keep: usize,
}

impl RetentionPolicy {
    /// Keep the newest `count` artifacts of every level.
    pub fn keep_latest(tier: &str, count: usize) -> Self {
        Self {
            tier: tier.to_string(),
            level: None,
            strategy: Strategy::KeepLatest { count },
            min_keep: 1,
        }
    }

    /// Weekly buckets for `weeks` ISO weeks plus monthly buckets.
    pub fn time_bucketed(tier: &str, weeks: u32) -> Self {
        Self {
            tier: tier.to_string(),
            level: None,
            strategy: Strategy::TimeBucketed { weeks },
            min_keep: 1,
        }
    }

    pub fn for_level(mut self, level: &str) -> Self {
        self.level = Some(level.to_string());
        self
    }

    pub fn with_min_keep(mut self, min_keep: usize) -> Self {
        self.min_keep = min_keep;
        self
    }

    /// Convert a configured rule; the error names the offending field.
    pub fn from_rule(rule: &RetentionRule) -> Result<Self, String> {
        let scope = format!(
            "retention rule for tier '{}' level '{}'",
            rule.tier,
            rule.level.as_deref().unwrap_or("*")
        );
        if rule.min_keep == 0 {
            return Err(format!("{}: min_keep must be at least 1", scope));
        }
        let strategy = match rule.strategy {
            StrategyKind::KeepLatest => Strategy::KeepLatest {
                count: rule
                    .keep
                    .ok_or_else(|| format!("{}: keep_latest requires 'keep'", scope))?,
            },
            StrategyKind::TimeBucketed => Strategy::TimeBucketed {
                weeks: rule
                    .weeks
                    .ok_or_else(|| format!("{}: time_bucketed requires 'weeks'", scope))?,
            },
        };
        Ok(Self {
            tier: rule.tier.clone(),
            level: rule.level.clone(),
            strategy,
            min_keep: rule.min_keep,
        })
    }

    /// Whether this policy governs `(tier, level)`.
    pub fn applies_to(&self, tier: &str, level: &str) -> bool {
        self.tier == tier && self.level.as_deref().map_or(true, |l| l == level)
    }
}

/// Policy for `(tier, level)`: a level-specific one wins over a tier-wide one.
pub fn policy_for<'a>(
    policies: &'a [RetentionPolicy],
    tier: &str,
    level: &str,
) -> Option<&'a RetentionPolicy> {
    policies
        .iter()
        .find(|p| p.tier == tier && p.level.as_deref() == Some(level))
        .or_else(|| policies.iter().find(|p| p.tier == tier && p.level.is_none()))
}

/// Keep/purge partition of one (tier, level) group
#[derive(Debug, Clone)]
pub struct RetentionPlan {
    pub tier: String,
    pub level: String,
    /// Newest first
    pub keep: Vec<Artifact>,
    /// Newest first
    pub purge: Vec<Artifact>,
    pub dry_run: bool,
}

impl RetentionPlan {
    pub fn purge_bytes(&self) -> u64 {
        self.purge.iter().map(|a| a.size).sum()
    }
}

/// Newest first; relative path breaks ties.
fn newest_first(a: &Artifact, b: &Artifact) -> Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| b.relative.cmp(&a.relative))
}

/// Partition `candidates` into keep and purge sets.
///
/// Candidates are expected to share one (tier, level). The plan never
/// purges below `policy.min_keep`.
pub fn plan(
    candidates: &[Artifact],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    dry_run: bool,
) -> RetentionPlan {
    let mut sorted: Vec<&Artifact> = candidates.iter().collect();
    sorted.sort_by(|a, b| newest_first(a, b));

    let mut keep: HashSet<usize> = match policy.strategy {
        Strategy::KeepLatest { count } => (0..count.min(sorted.len())).collect(),
        Strategy::TimeBucketed { weeks } => bucketed_keep(&sorted, weeks, now),
    };

    // min_keep on top, newest first
    let floor = policy.min_keep.min(sorted.len());
    let mut index = 0;
    while keep.len() < floor {
        keep.insert(index);
        index += 1;
    }

    let mut kept = Vec::new();
    let mut purged = Vec::new();
    for (i, artifact) in sorted.into_iter().enumerate() {
        if keep.contains(&i) {
            kept.push(artifact.clone());
        } else {
            purged.push(artifact.clone());
        }
    }

    RetentionPlan {
        tier: candidates
            .first()
            .map(|a| a.tier.clone())
            .unwrap_or_else(|| policy.tier.clone()),
        level: candidates
            .first()
            .map(|a| a.level.clone())
            .or_else(|| policy.level.clone())
            .unwrap_or_default(),
        keep: kept,
        purge: purged,
        dry_run,
    }
}

/// Indices (into newest-first `sorted`) of the newest artifact per ISO week
/// inside the window, plus the newest per calendar month.
fn bucketed_keep(sorted: &[&Artifact], weeks: u32, now: DateTime<Utc>) -> HashSet<usize> {
    let window_start = if weeks == 0 {
        None
    } else {
        let monday = now.date_naive()
            - Duration::days(now.weekday().num_days_from_monday() as i64);
        let start = monday - Duration::weeks(weeks as i64 - 1);
        start.and_hms_opt(0, 0, 0).map(|midnight| midnight.and_utc())
    };

    let mut keep = HashSet::new();
    let mut seen_weeks = HashSet::new();
    let mut seen_months = HashSet::new();
    for (i, artifact) in sorted.iter().enumerate() {
        let ts = artifact.timestamp;
        if let Some(start) = window_start {
            let week = ts.iso_week();
            if ts >= start && seen_weeks.insert((week.year(), week.week())) {
                keep.insert(i);
            }
        }
        if seen_months.insert((ts.year(), ts.month())) {
            keep.insert(i);
        }
    }
    keep
}
