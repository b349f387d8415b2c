//! backup-cascade - tiered backup replication and retention
//!
//! Moves immutable backup artifacts from a primary tier through secondary
//! and offsite tiers, verifying every copy before it is promoted, signals
//! downstream stages through a crash-safe handoff, and prunes each tier
//! against its retention policy.
//!
//! Each command is a single short-lived process: the scheduler runs it, the
//! stage lease keeps runs of one unit from overlapping, and the process ends
//! with one SUMMARY line and a stable exit code.

pub mod artifact;
pub mod cascade;
pub mod check;
pub mod config;
pub mod logging;
pub mod mirror;
pub mod retention;
pub mod summary;
pub mod topology;

pub use artifact::{Artifact, Sidecar};
pub use cascade::{CascadeError, CascadeOutcome, CascadeState, Orchestrator};
pub use check::{run_check, CheckOutcome};
pub use config::{Config, ConfigError};
pub use mirror::{MirrorEngine, MirrorReport};
pub use retention::{run_retention, RetentionOutcome, RetentionPolicy};
pub use summary::{ErrorCounts, ErrorKind, ExitCode, SummaryLine};
pub use topology::{resolve, Resolution, TopologyError};
