//! backup-cascade CLI
//!
//! Entry point for the `backup-cascade` command-line tool. Every command
//! prints exactly one SUMMARY line on stdout and exits with a stable code.

use std::path::PathBuf;
use std::process;

use backup_cascade::cascade::{stage_status, Orchestrator};
use backup_cascade::check::run_check;
use backup_cascade::config::Config;
use backup_cascade::logging;
use backup_cascade::retention::run_retention;
use backup_cascade::summary::{write_run_metrics, ErrorCounts, ErrorKind, ExitCode, MetricSet, SummaryLine};
use backup_cascade::topology::{resolve, tier_candidates, topology_candidates, ProvenanceStamp};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "backup-cascade")]
#[command(about = "Tiered backup replication, handoff and retention", version)]
struct Cli {
    /// Path to config file (default: /etc/backup-cascade/cascade.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the first writable destination and stamp provenance
    Resolve {
        /// Resolve within one tier instead of the whole topology
        #[arg(long, short = 't')]
        tier: Option<String>,

        /// Artifact name recorded in the provenance ledger
        #[arg(long, short = 'a')]
        artifact: Option<String>,
    },

    /// Run one cascade stage
    Cascade {
        /// Stage name from the config
        #[arg(long, short = 's')]
        stage: String,
    },

    /// Reconcile tiers against retention policies
    Retention {
        /// Limit the run to one tier
        #[arg(long, short = 't')]
        tier: Option<String>,

        /// Report what would be purged without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Verify stored artifacts against their checksum sidecars
    Check {
        /// Limit the check to one tier
        #[arg(long, short = 't')]
        tier: Option<String>,

        /// Also walk each archive's format
        #[arg(long)]
        integrity: bool,
    },

    /// Show handoff and cursor state of every stage
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Load and validate the configuration
    Validate,
}

impl Commands {
    fn unit(&self) -> &'static str {
        match self {
            Commands::Resolve { .. } => "resolve",
            Commands::Cascade { .. } => "cascade",
            Commands::Retention { .. } => "retention",
            Commands::Check { .. } => "check",
            Commands::Status { .. } => "status",
            Commands::Validate => "validate",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "configuration rejected");
            let mut line = SummaryLine::new(cli.command.unit());
            if let Commands::Cascade { stage } = &cli.command {
                line = line.field("stage", stage);
            }
            fail(line, e.kind());
        }
    };
    info!(origin = %config.origin, "configuration loaded");

    match cli.command {
        Commands::Resolve { tier, artifact } => run_resolve(&config, tier, artifact),
        Commands::Cascade { stage } => run_cascade(&config, &stage),
        Commands::Retention { tier, dry_run } => run_retention_cmd(&config, tier, dry_run),
        Commands::Check { tier, integrity } => run_check_cmd(&config, tier, integrity),
        Commands::Status { json } => run_status(&config, json),
        Commands::Validate => run_validate(&config),
    }
}

/// Print the SUMMARY line and exit.
fn finish(line: SummaryLine, code: ExitCode) -> ! {
    println!("{}", line);
    process::exit(code.as_i32());
}

/// Terminal failure of kind `kind`.
fn fail(line: SummaryLine, kind: ErrorKind) -> ! {
    let mut errors = ErrorCounts::new();
    errors.add(kind);
    finish(line.field("state", "FAILED").errors(&errors), kind.exit_code())
}

/// Another process holds the lease; nothing was done.
fn skipped(line: SummaryLine) -> ! {
    warn!(kind = %ErrorKind::LockContention, "lease held by another process, skipping");
    finish(
        line.field("state", "SKIPPED").field("reason", "lease_held"),
        ExitCode::LockContention,
    )
}

/// Record a fatal run in the unit's metrics, then exit.
fn fail_with_metrics(config: &Config, metrics: MetricSet, line: SummaryLine, kind: ErrorKind) -> ! {
    let mut errors = ErrorCounts::new();
    errors.add(kind);
    write_run_metrics(
        metrics,
        config.metrics.textfile_dir.as_deref(),
        Utc::now(),
        false,
        &errors,
    );
    fail(line, kind)
}

fn run_resolve(config: &Config, tier: Option<String>, artifact: Option<String>) {
    let candidates = match &tier {
        Some(name) => match config.tier(name) {
            Some(tier_spec) => tier_candidates(tier_spec),
            None => {
                error!(tier = %name, kind = %ErrorKind::ConfigError, "unknown tier");
                fail(SummaryLine::new("resolve").field("tier", name), ErrorKind::ConfigError);
            }
        },
        None => topology_candidates(&config.tiers),
    };

    let resolution = match resolve(&candidates) {
        Ok(resolution) => resolution,
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "no destination");
            fail(SummaryLine::new("resolve"), e.kind());
        }
    };

    let stamp = ProvenanceStamp::new(&resolution, Utc::now());
    if let Err(e) = stamp.record(artifact.as_deref()) {
        warn!(chosen = %resolution.chosen.display(), error = %e, "failed to record provenance");
    }

    println!("{}", resolution.chosen.display());
    finish(
        SummaryLine::new("resolve")
            .field("state", "OK")
            .field("tier", &resolution.tier)
            .field("chosen", resolution.chosen.display())
            .field("candidates", resolution.attempts.len())
            .field("reason", resolution.reason()),
        ExitCode::Success,
    );
}

fn run_cascade(config: &Config, stage: &str) {
    let line = || SummaryLine::new("cascade").field("stage", stage);
    let metrics = || MetricSet::new(format!("cascade_{}", stage));
    let now = Utc::now();

    let orchestrator = match Orchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(stage, kind = %e.kind(), error = %e, "cascade setup failed");
            fail_with_metrics(config, metrics(), line(), e.kind());
        }
    };

    match orchestrator.run_stage(stage, now) {
        Ok(outcome) => {
            write_run_metrics(
                outcome.metrics(),
                config.metrics.textfile_dir.as_deref(),
                now,
                outcome.is_success(),
                &outcome.errors,
            );
            finish(outcome.summary(), outcome.exit_code());
        }
        Err(e) if e.kind() == ErrorKind::LockContention => skipped(line()),
        Err(e) => {
            error!(stage, kind = %e.kind(), error = %e, "cascade aborted");
            fail_with_metrics(config, metrics(), line(), e.kind());
        }
    }
}

fn run_retention_cmd(config: &Config, tier: Option<String>, dry_run: bool) {
    let line = || SummaryLine::new("retention").field("dry_run", dry_run);
    let now = Utc::now();

    match run_retention(config, tier.as_deref(), dry_run, now) {
        Ok(outcome) => {
            write_run_metrics(
                outcome.metrics(),
                config.metrics.textfile_dir.as_deref(),
                now,
                outcome.is_success(),
                &outcome.errors,
            );
            finish(outcome.summary(), outcome.exit_code());
        }
        Err(e) if e.kind() == ErrorKind::LockContention => skipped(line()),
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "retention aborted");
            fail_with_metrics(config, MetricSet::new("retention"), line(), e.kind());
        }
    }
}

fn run_check_cmd(config: &Config, tier: Option<String>, integrity: bool) {
    let line = || SummaryLine::new("check").field("integrity", integrity);
    let now = Utc::now();

    match run_check(config, tier.as_deref(), integrity) {
        Ok(outcome) => {
            write_run_metrics(
                outcome.metrics(),
                config.metrics.textfile_dir.as_deref(),
                now,
                outcome.is_success(),
                &outcome.errors,
            );
            finish(outcome.summary(), outcome.exit_code());
        }
        Err(e) if e.kind() == ErrorKind::LockContention => skipped(line()),
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "check aborted");
            fail_with_metrics(config, MetricSet::new("check"), line(), e.kind());
        }
    }
}

fn run_status(config: &Config, json: bool) {
    let stages = match stage_status(config) {
        Ok(stages) => stages,
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "failed to read stage state");
            fail(SummaryLine::new("status"), e.kind());
        }
    };

    if json {
        match serde_json::to_string_pretty(&stages) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                error!(error = %e, "failed to serialize status");
                fail(SummaryLine::new("status"), ErrorKind::ConfigError);
            }
        }
    } else {
        for stage in &stages {
            let cursor = stage
                .cursor
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<16} {} -> {:<24} sequence={:<6} ready={:<5} cursor={:<6} running={}",
                stage.stage,
                stage.source,
                stage.targets.join(","),
                stage.handoff.sequence,
                stage.handoff.ready,
                cursor,
                stage.running,
            );
        }
    }

    let running = stages.iter().filter(|s| s.running).count();
    finish(
        SummaryLine::new("status")
            .field("state", "OK")
            .field("stages", stages.len())
            .field("running", running),
        ExitCode::Success,
    );
}

fn run_validate(config: &Config) {
    // Config::load already validated; retention policies are rebuilt for the synopsis.
    let policies = match config.retention_policies() {
        Ok(policies) => policies,
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "configuration rejected");
            fail(SummaryLine::new("validate"), e.kind());
        }
    };

    println!("Configuration valid: {}", config.origin);
    println!("  State dir: {}", config.state_dir.display());
    for tier in &config.tiers {
        let paths: Vec<String> = tier.paths.iter().map(|p| p.display().to_string()).collect();
        println!(
            "  Tier {} ({}): {}{}",
            tier.name,
            tier.role,
            paths.join(", "),
            if tier.require_mount { " [mount required]" } else { "" }
        );
    }
    for stage in &config.cascade.stages {
        match &stage.trigger {
            Some(trigger) => println!(
                "  Stage {}: {} -> {} (after {})",
                stage.name,
                stage.source,
                stage.targets.join(", "),
                trigger
            ),
            None => println!(
                "  Stage {}: {} -> {} (last {}h)",
                stage.name,
                stage.source,
                stage.targets.join(", "),
                stage.lookback_hours
            ),
        }
    }
    for policy in &policies {
        println!(
            "  Retention {}/{}: {} min_keep={}",
            policy.tier,
            policy.level.as_deref().unwrap_or("*"),
            policy.strategy,
            policy.min_keep
        );
    }

    finish(
        SummaryLine::new("validate")
            .field("state", "OK")
            .field("tiers", config.tiers.len())
            .field("stages", config.cascade.stages.len())
            .field("policies", policies.len()),
        ExitCode::Success,
    );
}
