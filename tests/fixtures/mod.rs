//! Shared fixtures for integration tests
//!
//! A `Site` is a throwaway directory holding tier roots, a state directory,
//! a metrics directory and a config file pointing at all of them. Artifacts
//! are real `.tar.gz` archives with checksum sidecars and builder logs.

#![allow(dead_code)]

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use backup_cascade::artifact::{digest, log_path, Sidecar};
use backup_cascade::config::Config;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

/// Three-tier topology with a scan stage and a triggered offsite stage.
pub const THREE_TIER: &str = r#"
[[tier]]
name = "primary"
role = "primary"
paths = ["{root}/primary"]

[[tier]]
name = "secondary"
role = "secondary"
paths = ["{root}/secondary"]

[[tier]]
name = "offsite"
role = "tertiary"
paths = ["{root}/offsite"]

[cascade]
include = ["*.tar.gz"]
verify_integrity = true

[[cascade.stage]]
name = "scan"
source = "primary"
targets = ["secondary"]
lookback_hours = 24

[[cascade.stage]]
name = "offsite"
source = "secondary"
targets = ["offsite"]
trigger = "scan"
"#;

pub struct Site {
    dir: TempDir,
}

impl Site {
    /// Site with `body` as config; `{root}` expands to the site directory.
    pub fn new(body: &str) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let site = Self { dir };
        let root = site.root().display().to_string();
        let config = format!(
            "state_dir = \"{root}/state\"\n\n[metrics]\ntextfile_dir = \"{root}/metrics\"\n{}",
            body.replace("{root}", &root),
            root = root,
        );
        fs::create_dir_all(site.path("metrics")).expect("create metrics dir");
        fs::write(site.config_path(), config).expect("write config");
        site
    }

    pub fn three_tier() -> Self {
        Self::new(THREE_TIER)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn config_path(&self) -> PathBuf {
        self.path("cascade.toml")
    }

    pub fn config(&self) -> Config {
        Config::from_file(&self.config_path()).expect("load config")
    }

    /// Drop a verified artifact into `tier_dir`.
    pub fn artifact(&self, tier_dir: &str, name: &str, body: &[u8]) -> PathBuf {
        let path = self.path(tier_dir).join(name);
        write_tar_gz(&path, body);
        Sidecar::new(&digest(&path).expect("digest"), name)
            .write_for(&path)
            .expect("write sidecar");
        fs::write(log_path(&path), format!("built {}\n", name)).expect("write log");
        path
    }

    /// Run the binary against this site's config.
    pub fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_backup-cascade"))
            .arg("--config")
            .arg(self.config_path())
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .expect("run backup-cascade")
    }

    /// Sequence file of a stage, 0 when absent.
    pub fn sequence(&self, stage: &str) -> u64 {
        fs::read_to_string(self.path("state/handoff").join(stage).join("sequence"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn metrics(&self, unit: &str) -> String {
        fs::read_to_string(self.path("metrics").join(format!("backup_cascade_{}.prom", unit)))
            .unwrap_or_default()
    }
}

/// One-entry `.tar.gz` holding `body`.
pub fn write_tar_gz(path: &Path, body: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create artifact dir");
    }
    let encoder = GzEncoder::new(File::create(path).expect("create archive"), Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "dump.sql", body)
        .expect("append entry");
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
}

/// The single SUMMARY line of a run.
pub fn summary(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().filter(|l| l.starts_with("SUMMARY ")).collect();
    assert_eq!(
        lines.len(),
        1,
        "expected exactly one SUMMARY line\nstdout:\n{}\nstderr:\n{}",
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );
    lines[0].to_string()
}

pub fn exit_code(output: &Output) -> i32 {
    output.status.code().expect("process exited with a code")
}
