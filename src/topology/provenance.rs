//! Provenance stamps
//!
//! Each successful resolution leaves two records at the chosen destination:
//! - `.provenance.log`: append-only `timestamp hostname user artifact` lines
//! - `.topology-decision.json`: the latest decision, overwritten atomically

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cascade_state::{atomic_write, AtomicWriteError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{Attempt, Resolution};

/// Append-only ledger file name
pub const PROVENANCE_LOG_FILENAME: &str = ".provenance.log";

/// Latest-decision record file name
pub const DECISION_FILENAME: &str = ".topology-decision.json";

/// Errors writing provenance
#[derive(Debug, Error)]
pub enum ProvenanceError {
    #[error("failed to append provenance ledger {path}: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize topology decision: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

/// Host name of this machine, or `unknown`.
pub fn current_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Invoking user from the environment, or `unknown`.
pub fn current_user() -> String {
    ["USER", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Record of one destination decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceStamp {
    pub chosen: PathBuf,
    pub tier: String,
    pub candidates: Vec<Attempt>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub user: String,
}

impl ProvenanceStamp {
    pub fn new(resolution: &Resolution, now: DateTime<Utc>) -> Self {
        Self {
            chosen: resolution.chosen.clone(),
            tier: resolution.tier.clone(),
            candidates: resolution.attempts.clone(),
            reason: resolution.reason(),
            timestamp: now,
            host: current_host(),
            user: current_user(),
        }
    }

    /// Ledger line for `artifact` (`-` when none).
    pub fn ledger_line(&self, artifact: Option<&str>) -> String {
        format!(
            "{} {} {} {}\n",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.host,
            self.user,
            artifact.filter(|a| !a.is_empty()).unwrap_or("-")
        )
    }

    /// Append to the ledger and overwrite the decision record.
    pub fn record(&self, artifact: Option<&str>) -> Result<(), ProvenanceError> {
        self.record_many(artifact.into_iter())
    }

    /// One ledger line per artifact (a single `-` line when there are
    /// none), then the decision record.
    pub fn record_many<'a>(
        &self,
        artifacts: impl Iterator<Item = &'a str>,
    ) -> Result<(), ProvenanceError> {
        let mut lines: String = artifacts.map(|a| self.ledger_line(Some(a))).collect();
        if lines.is_empty() {
            lines = self.ledger_line(None);
        }

        let ledger = self.chosen.join(PROVENANCE_LOG_FILENAME);
        append_line(&ledger, &lines).map_err(|source| ProvenanceError::Ledger {
            path: ledger.clone(),
            source,
        })?;

        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        atomic_write(&self.chosen.join(DECISION_FILENAME), &json)?;

        debug!(chosen = %self.chosen.display(), "provenance recorded");
        Ok(())
    }
}

fn append_line(path: &Path, lines: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(lines.as_bytes())?;
    file.sync_data()
}
