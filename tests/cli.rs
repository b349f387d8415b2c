//! The binary: SUMMARY line, exit codes, lease exclusivity, metrics

mod fixtures;

use std::fs;

use backup_cascade::artifact::sidecar_path;
use backup_cascade::cascade::lease_name;
use backup_cascade::check::CHECK_LEASE;
use backup_cascade::retention::RETENTION_LEASE;
use cascade_state::Lease;
use fixtures::{exit_code, summary, Site};

const FULL: &str = "db01-full-20260301-020000.tar.gz";

#[test]
fn test_validate_prints_synopsis() {
    let site = Site::three_tier();

    let output = site.run(&["validate"]);

    assert_eq!(exit_code(&output), 0);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Stage offsite: secondary -> offsite (after scan)"));
    let line = summary(&output);
    assert!(line.starts_with("SUMMARY unit=validate state=OK tiers=3 stages=2"));
}

#[test]
fn test_invalid_config_exits_precondition() {
    let site = Site::new(
        r#"
[[tier]]
name = "primary"
role = "primary"
paths = ["{root}/primary"]

[[cascade.stage]]
name = "scan"
source = "primary"
targets = ["nowhere"]
"#,
    );

    let output = site.run(&["cascade", "--stage", "scan"]);

    assert_eq!(exit_code(&output), 10);
    let line = summary(&output);
    assert!(line.contains("stage=scan"));
    assert!(line.contains("state=FAILED"));
    assert!(line.contains("errors=ConfigError:1"));
}

#[test]
fn test_missing_config_file_exits_precondition() {
    let site = Site::three_tier();
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_backup-cascade"))
        .arg("--config")
        .arg(site.path("absent.toml"))
        .arg("validate")
        .output()
        .unwrap();

    assert_eq!(exit_code(&output), 10);
    assert!(summary(&output).contains("unit=validate"));
}

#[test]
fn test_cascade_handoff_then_idle() {
    let site = Site::three_tier();
    site.artifact("primary", FULL, b"nightly");

    let first = site.run(&["cascade", "--stage", "scan"]);
    assert_eq!(exit_code(&first), 0);
    let line = summary(&first);
    assert!(line.contains("state=HANDOFF"), "{}", line);
    assert!(line.contains("sequence=1"));
    assert!(line.contains("tiers=secondary:OK"));
    assert!(line.contains("errors=none"));

    let second = site.run(&["cascade", "--stage", "scan"]);
    assert_eq!(exit_code(&second), 0);
    let line = summary(&second);
    assert!(line.contains("state=IDLE"), "{}", line);
    assert!(line.contains("sequence=1"));
    assert!(line.contains("skipped=1"));

    let metrics = site.metrics("cascade_scan");
    assert!(metrics.contains("backup_cascade_handoff_sequence{stage=\"scan\"} 1"));
    assert!(metrics.contains("backup_cascade_last_run_success 1"));
}

#[test]
fn test_verification_mismatch_exit_code() {
    let site = Site::three_tier();
    let source = site.artifact("primary", FULL, b"nightly");
    fs::write(sidecar_path(&source), format!("{}  {}\n", "0".repeat(64), FULL)).unwrap();

    let output = site.run(&["cascade", "--stage", "scan"]);

    assert_eq!(exit_code(&output), 30);
    let line = summary(&output);
    assert!(line.contains("state=FAILED"));
    assert!(line.contains("tiers=secondary:FAIL(VerificationMismatch)"));
    assert_eq!(site.sequence("scan"), 0);
    assert!(site
        .metrics("cascade_scan")
        .contains("backup_cascade_last_run_success 0"));
}

#[test]
fn test_unavailable_target_exit_code() {
    let body = fixtures::THREE_TIER.replace(
        "paths = [\"{root}/secondary\"]",
        "paths = [\"{root}/secondary\"]\nrequire_mount = true",
    );
    let site = Site::new(&body);
    site.artifact("primary", FULL, b"nightly");

    let output = site.run(&["cascade", "--stage", "scan"]);

    assert_eq!(exit_code(&output), 10);
    let line = summary(&output);
    assert!(line.contains("tiers=secondary:FAIL(DestinationUnavailable)"));
    assert_eq!(site.sequence("scan"), 0);
}

#[test]
fn test_held_cascade_lease_skips_with_75() {
    let site = Site::three_tier();
    site.artifact("primary", FULL, b"nightly");
    let config = site.config();
    let _held = Lease::acquire(&config.lock_dir(), &lease_name("scan")).unwrap();

    let output = site.run(&["cascade", "--stage", "scan"]);

    assert_eq!(exit_code(&output), 75);
    let line = summary(&output);
    assert!(line.contains("state=SKIPPED"));
    assert!(!site.path("secondary").join(FULL).exists());
    assert_eq!(site.metrics("cascade_scan"), "");
}

#[test]
fn test_other_stage_lease_does_not_block() {
    let site = Site::three_tier();
    site.artifact("primary", FULL, b"nightly");
    let config = site.config();
    let _held = Lease::acquire(&config.lock_dir(), &lease_name("offsite")).unwrap();

    let output = site.run(&["cascade", "--stage", "scan"]);

    assert_eq!(exit_code(&output), 0);
}

#[test]
fn test_retention_and_check_leases() {
    let site = Site::three_tier();
    let config = site.config();

    let _retention = Lease::acquire(&config.lock_dir(), RETENTION_LEASE).unwrap();
    let output = site.run(&["retention", "--dry-run"]);
    assert_eq!(exit_code(&output), 75);
    assert!(summary(&output).contains("unit=retention"));

    let _check = Lease::acquire(&config.lock_dir(), CHECK_LEASE).unwrap();
    let output = site.run(&["check"]);
    assert_eq!(exit_code(&output), 75);
    assert!(summary(&output).contains("unit=check"));
}

#[test]
fn test_check_detects_bit_rot() {
    let site = Site::three_tier();
    let path = site.artifact("primary", FULL, b"nightly");

    let clean = site.run(&["check", "--integrity"]);
    assert_eq!(exit_code(&clean), 0);
    assert!(summary(&clean).contains("checked=1"));

    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let rotten = site.run(&["check"]);
    assert_eq!(exit_code(&rotten), 30);
    assert!(summary(&rotten).contains("failed=1"));
    assert!(site.metrics("check").contains("backup_cascade_check_failures{tier=\"primary\"} 1"));
}

#[test]
fn test_resolve_prints_destination() {
    let site = Site::three_tier();

    let output = site.run(&["resolve", "--tier", "offsite", "--artifact", FULL]);

    assert_eq!(exit_code(&output), 0);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let offsite = site.path("offsite");
    assert_eq!(stdout.lines().next().unwrap(), offsite.display().to_string());
    assert!(summary(&output).contains("tier=offsite"));
    let ledger = fs::read_to_string(offsite.join(".provenance.log")).unwrap();
    assert!(ledger.trim_end().ends_with(FULL));
}

#[test]
fn test_status_json() {
    let site = Site::three_tier();
    site.artifact("primary", FULL, b"nightly");
    assert_eq!(exit_code(&site.run(&["cascade", "--stage", "scan"])), 0);

    let output = site.run(&["status", "--json"]);

    assert_eq!(exit_code(&output), 0);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let json_end = stdout.rfind("SUMMARY").unwrap();
    let stages: serde_json::Value = serde_json::from_str(&stdout[..json_end]).unwrap();
    assert_eq!(stages[0]["stage"], "scan");
    assert_eq!(stages[0]["handoff"]["sequence"], 1);
    assert_eq!(stages[0]["running"], false);
    assert_eq!(stages[1]["cursor"], 0);
}
