//! Run outcome reporting
//!
//! Every command ends with exactly one `SUMMARY` line on stdout so a human or
//! an alerting script can grep a single line per run. The failure taxonomy
//! and exit codes live in [`failure`]; textfile metrics in [`metrics`].

mod failure;
mod metrics;

pub use failure::{ErrorCounts, ErrorKind, ExitCode};
pub use metrics::{MetricSet, METRIC_PREFIX};

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Outcome of one tier within a run, as printed in the SUMMARY line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierStatus {
    Ok,
    Skipped,
    Failed(ErrorKind),
}

impl fmt::Display for TierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierStatus::Ok => f.write_str("OK"),
            TierStatus::Skipped => f.write_str("SKIP"),
            TierStatus::Failed(kind) => write!(f, "FAIL({})", kind),
        }
    }
}

/// Builder for the single `SUMMARY key=value ...` line.
#[derive(Debug, Clone)]
pub struct SummaryLine {
    fields: Vec<(String, String)>,
}

impl SummaryLine {
    /// Start a line for `unit` (cascade, retention, check, resolve).
    pub fn new(unit: &str) -> Self {
        Self {
            fields: vec![("unit".to_string(), unit.to_string())],
        }
    }

    /// Append `key=value`; whitespace in the value is replaced by `_`.
    pub fn field(mut self, key: &str, value: impl fmt::Display) -> Self {
        let value: String = value
            .to_string()
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        self.fields.push((key.to_string(), value));
        self
    }

    /// Append `tiers=name:STATUS,...`
    pub fn tiers<'a>(self, tiers: impl IntoIterator<Item = (&'a str, &'a TierStatus)>) -> Self {
        let rendered: Vec<String> = tiers
            .into_iter()
            .map(|(name, status)| format!("{}:{}", name, status))
            .collect();
        let value = if rendered.is_empty() {
            "none".to_string()
        } else {
            rendered.join(",")
        };
        self.field("tiers", value)
    }

    /// Append `errors=Kind:n,...`
    pub fn errors(self, counts: &ErrorCounts) -> Self {
        let rendered = counts.render();
        self.field("errors", rendered)
    }
}

impl fmt::Display for SummaryLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SUMMARY")?;
        for (k, v) in &self.fields {
            write!(f, " {}={}", k, v)?;
        }
        Ok(())
    }
}

/// Add the gauges every unit reports, then write the textfile.
///
/// `last_success_timestamp_seconds` is carried over from the previous file
/// when this run did not succeed. Write failures are logged, never fatal.
pub fn write_run_metrics(
    mut metrics: MetricSet,
    textfile_dir: Option<&Path>,
    now: DateTime<Utc>,
    success: bool,
    errors: &ErrorCounts,
) {
    let Some(dir) = textfile_dir else {
        return;
    };

    let now_secs = now.timestamp() as f64;
    metrics.gauge(
        "last_run_timestamp_seconds",
        "Unix time of the last run",
        &[],
        now_secs,
    );
    let last_success = if success {
        Some(now_secs)
    } else {
        metrics.previous(dir, "last_success_timestamp_seconds")
    };
    if let Some(value) = last_success {
        metrics.gauge(
            "last_success_timestamp_seconds",
            "Unix time of the last successful run",
            &[],
            value,
        );
    }
    metrics.gauge(
        "last_run_success",
        "Whether the last run succeeded",
        &[],
        if success { 1.0 } else { 0.0 },
    );
    for (kind, count) in errors.iter() {
        metrics.gauge(
            "errors",
            "Errors in the last run by kind",
            &[("kind", kind.as_str())],
            count as f64,
        );
    }

    match metrics.write_to(dir) {
        Ok(path) => debug!(path = %path.display(), "metrics written"),
        Err(e) => warn!(error = %e, "failed to write metrics textfile"),
    }
}
