//! Built-in defaults
//!
//! Used when no configuration file exists, and to fill in fields a file
//! leaves out. The default topology is the primary/secondary pair.

use std::path::PathBuf;

use super::{StageConfig, TierRole, TierSpec};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/backup-cascade/cascade.toml";

/// Name of the stage synthesized when none are configured
pub const DEFAULT_STAGE_NAME: &str = "scan";

/// Built-in default configuration values
#[derive(Debug, Clone)]
pub struct BuiltinDefaults {
    /// Directory for locks, handoff state and cursors
    pub state_dir: PathBuf,

    /// Primary tier path
    pub primary_path: PathBuf,

    /// Secondary tier path
    pub secondary_path: PathBuf,

    /// How far back a scan looks for new artifacts (hours)
    pub lookback_hours: u64,

    /// Artifact file patterns picked up by scans
    pub include: Vec<String>,

    /// Run a format integrity test after mirroring
    pub verify_integrity: bool,

    /// Minimum artifacts kept per (tier, level) by any retention pass
    pub min_keep: usize,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/backup-cascade"),
            primary_path: PathBuf::from("/var/backups/cascade"),
            secondary_path: PathBuf::from("/mnt/backup/cascade"),
            lookback_hours: 24,
            include: vec![
                "*.tar.gz".to_string(),
                "*.tgz".to_string(),
                "*.tar".to_string(),
                "*.gz".to_string(),
            ],
            verify_integrity: true,
            min_keep: 1,
        }
    }
}

impl BuiltinDefaults {
    /// The hard-coded primary/secondary topology.
    pub fn tiers(&self) -> Vec<TierSpec> {
        vec![
            TierSpec {
                name: "primary".to_string(),
                role: TierRole::Primary,
                paths: vec![self.primary_path.clone()],
                require_mount: false,
            },
            TierSpec {
                name: "secondary".to_string(),
                role: TierRole::Secondary,
                paths: vec![self.secondary_path.clone()],
                require_mount: false,
            },
        ]
    }

    /// Single stage cascading the first tier to every other tier.
    pub fn stage_for(&self, tiers: &[TierSpec]) -> Option<StageConfig> {
        let (first, rest) = tiers.split_first()?;
        if rest.is_empty() {
            return None;
        }
        Some(StageConfig {
            name: DEFAULT_STAGE_NAME.to_string(),
            source: first.name.clone(),
            targets: rest.iter().map(|t| t.name.clone()).collect(),
            lookback_hours: self.lookback_hours,
            trigger: None,
        })
    }
}
