//! Textfile metrics for an external scraper
//!
//! Each unit of work (a cascade stage, a retention run, a check) owns one
//! file `backup_cascade_<unit>.prom` in the configured textfile directory and
//! overwrites it atomically at the end of every run. Nothing is pushed over
//! the network.

use std::fs;
use std::path::{Path, PathBuf};

use cascade_state::{atomic_write, AtomicWriteError};

/// Prefix for every metric name
pub const METRIC_PREFIX: &str = "backup_cascade_";

#[derive(Debug, Clone)]
struct Family {
    name: String,
    help: String,
    samples: Vec<(Vec<(String, String)>, f64)>,
}

/// A set of gauges rendered in Prometheus text exposition format.
#[derive(Debug, Clone)]
pub struct MetricSet {
    unit: String,
    families: Vec<Family>,
}

impl MetricSet {
    /// Start an empty set for `unit` (e.g. `cascade_scan`, `retention`).
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            families: Vec::new(),
        }
    }

    /// Record a gauge sample. `name` is given without the common prefix.
    pub fn gauge(&mut self, name: &str, help: &str, labels: &[(&str, &str)], value: f64) {
        let full_name = format!("{}{}", METRIC_PREFIX, name);
        let labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        match self.families.iter_mut().find(|f| f.name == full_name) {
            Some(family) => family.samples.push((labels, value)),
            None => self.families.push(Family {
                name: full_name,
                help: help.to_string(),
                samples: vec![(labels, value)],
            }),
        }
    }

    /// File name this set is written to.
    pub fn file_name(&self) -> String {
        let sanitized: String = self
            .unit
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("backup_cascade_{}.prom", sanitized)
    }

    /// Render the exposition text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for family in &self.families {
            out.push_str(&format!("# HELP {} {}\n", family.name, family.help));
            out.push_str(&format!("# TYPE {} gauge\n", family.name));
            for (labels, value) in &family.samples {
                out.push_str(&family.name);
                if !labels.is_empty() {
                    let rendered: Vec<String> = labels
                        .iter()
                        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                        .collect();
                    out.push('{');
                    out.push_str(&rendered.join(","));
                    out.push('}');
                }
                out.push(' ');
                out.push_str(&format_value(*value));
                out.push('\n');
            }
        }
        out
    }

    /// Atomically replace `<dir>/<file_name>` with the rendered text.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, AtomicWriteError> {
        let path = dir.join(self.file_name());
        atomic_write(&path, self.render().as_bytes())?;
        Ok(path)
    }

    /// Value of an unlabelled gauge in the file a previous run left in `dir`.
    ///
    /// Used to carry `last_success_timestamp_seconds` across failed runs.
    pub fn previous(&self, dir: &Path, name: &str) -> Option<f64> {
        let content = fs::read_to_string(dir.join(self.file_name())).ok()?;
        let full_name = format!("{}{} ", METRIC_PREFIX, name);
        content
            .lines()
            .find_map(|line| line.strip_prefix(&full_name))
            .and_then(|value| value.trim().parse().ok())
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_render_groups_samples_by_family() {
        let mut set = MetricSet::new("retention");
        set.gauge("removed", "Artifacts removed", &[("tier", "primary")], 3.0);
        set.gauge("removed", "Artifacts removed", &[("tier", "secondary")], 0.0);
        set.gauge("last_run_timestamp_seconds", "Last run", &[], 1_700_000_000.0);

        let text = set.render();
        assert_eq!(text.matches("# TYPE backup_cascade_removed gauge").count(), 1);
        assert!(text.contains("backup_cascade_removed{tier=\"primary\"} 3\n"));
        assert!(text.contains("backup_cascade_removed{tier=\"secondary\"} 0\n"));
        assert!(text.contains("backup_cascade_last_run_timestamp_seconds 1700000000\n"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let mut set = MetricSet::new("check");
        set.gauge("failed", "Failures", &[("path", "a\"b")], 1.0);

        assert!(set.render().contains("path=\"a\\\"b\""));
    }

    #[test]
    fn test_write_to_uses_unit_file_name() {
        let dir = TempDir::new().unwrap();
        let mut set = MetricSet::new("cascade-scan");
        set.gauge("handoff_sequence", "Sequence", &[("stage", "scan")], 4.0);

        let path = set.write_to(dir.path()).unwrap();

        assert_eq!(path.file_name().unwrap(), "backup_cascade_cascade_scan.prom");
        assert!(fs::read_to_string(path).unwrap().contains("} 4\n"));
    }

    #[test]
    fn test_previous_reads_last_written_value() {
        let dir = TempDir::new().unwrap();
        let mut set = MetricSet::new("retention");
        assert_eq!(set.previous(dir.path(), "last_success_timestamp_seconds"), None);

        set.gauge("last_success_timestamp_seconds", "Last success", &[], 1_700_000_123.0);
        set.write_to(dir.path()).unwrap();

        let next = MetricSet::new("retention");
        assert_eq!(
            next.previous(dir.path(), "last_success_timestamp_seconds"),
            Some(1_700_000_123.0)
        );
    }
}
