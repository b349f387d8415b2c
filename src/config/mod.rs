//! Configuration
//!
//! One TOML file is the single source of truth for the topology, cascade
//! stages, retention rules and metrics output. It is loaded and validated
//! once at startup; nothing re-reads it mid-run.
//!
//! Lookup order: explicit `--config` path (must exist) → the default path if
//! present → built-in defaults.

mod defaults;

pub use defaults::{BuiltinDefaults, DEFAULT_CONFIG_PATH, DEFAULT_STAGE_NAME};

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::retention::RetentionPolicy;
use crate::summary::ErrorKind;

/// Errors loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Taxonomy kind
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigError
    }
}

/// Role of a tier in the replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierRole {
    Primary,
    Secondary,
    Tertiary,
}

impl fmt::Display for TierRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierRole::Primary => f.write_str("primary"),
            TierRole::Secondary => f.write_str("secondary"),
            TierRole::Tertiary => f.write_str("tertiary"),
        }
    }
}

/// One tier of the topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierSpec {
    /// Unique tier name
    pub name: String,

    /// Role in the topology
    pub role: TierRole,

    /// Candidate paths in priority order
    pub paths: Vec<PathBuf>,

    /// Removable/network media: the path must be a mount point to be used
    #[serde(default)]
    pub require_mount: bool,
}

/// One cascade stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name (also names its lease and handoff directory)
    pub name: String,

    /// Tier scanned for artifacts
    pub source: String,

    /// Tiers the artifacts are mirrored to
    pub targets: Vec<String>,

    /// Scan window for untriggered stages
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u64,

    /// Upstream stage whose handoff drives this stage
    #[serde(default)]
    pub trigger: Option<String>,
}

/// Cascade settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Artifact file patterns
    #[serde(default = "default_include")]
    pub include: Vec<String>,

    /// Format integrity test on promoted copies
    #[serde(default = "default_verify_integrity")]
    pub verify_integrity: bool,

    /// Configured stages
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageConfig>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            include: default_include(),
            verify_integrity: default_verify_integrity(),
            stages: Vec::new(),
        }
    }
}

/// Retention strategy selector as written in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    KeepLatest,
    TimeBucketed,
}

/// Retention rule as written in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionRule {
    pub tier: String,

    /// Level this rule is limited to; all levels when absent
    #[serde(default)]
    pub level: Option<String>,

    pub strategy: StrategyKind,

    /// keep_latest: number of newest artifacts to keep
    #[serde(default)]
    pub keep: Option<usize>,

    /// time_bucketed: number of ISO weeks with a weekly keep
    #[serde(default)]
    pub weeks: Option<u32>,

    /// Floor on artifacts kept per (tier, level)
    #[serde(default = "default_min_keep")]
    pub min_keep: usize,
}

/// Metrics textfile output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub textfile_dir: Option<PathBuf>,
}

/// Where the loaded configuration came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigOrigin {
    #[default]
    Builtin,
    File(PathBuf),
}

impl fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOrigin::Builtin => f.write_str("builtin defaults"),
            ConfigOrigin::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Validated configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default, rename = "tier")]
    pub tiers: Vec<TierSpec>,

    #[serde(default)]
    pub cascade: CascadeConfig,

    #[serde(default)]
    pub retention: Vec<RetentionRule>,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(skip)]
    pub origin: ConfigOrigin,
}

fn default_schema_version() -> u32 {
    1
}

fn default_state_dir() -> PathBuf {
    BuiltinDefaults::default().state_dir
}

fn default_lookback_hours() -> u64 {
    BuiltinDefaults::default().lookback_hours
}

fn default_include() -> Vec<String> {
    BuiltinDefaults::default().include
}

fn default_verify_integrity() -> bool {
    BuiltinDefaults::default().verify_integrity
}

fn default_min_keep() -> usize {
    BuiltinDefaults::default().min_keep
}

impl Config {
    /// Load from `path`, or the default location, or built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                Self::from_file(path)
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    debug!("no config file found, using built-in defaults");
                    Ok(Self::builtin())
                }
            }
        }
    }

    /// Load and validate a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content, &path.display().to_string())?;
        config.origin = ConfigOrigin::File(path.to_path_buf());
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, "<string>")
    }

    fn parse(content: &str, label: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: label.to_string(),
            source,
        })?;
        config.finalize();
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults: primary/secondary pair with one scan stage.
    pub fn builtin() -> Self {
        let mut config = Self {
            schema_version: default_schema_version(),
            state_dir: default_state_dir(),
            tiers: Vec::new(),
            cascade: CascadeConfig::default(),
            retention: Vec::new(),
            metrics: MetricsConfig::default(),
            origin: ConfigOrigin::Builtin,
        };
        config.finalize();
        config
    }

    /// Fill in the default topology and stage when absent.
    fn finalize(&mut self) {
        let defaults = BuiltinDefaults::default();
        if self.tiers.is_empty() {
            self.tiers = defaults.tiers();
        }
        if self.cascade.stages.is_empty() {
            if let Some(stage) = defaults.stage_for(&self.tiers) {
                self.cascade.stages.push(stage);
            }
        }
    }

    /// Check cross-references and parameter ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.tiers.is_empty() {
            return invalid("at least one tier is required".to_string());
        }

        let mut tier_names = HashSet::new();
        for tier in &self.tiers {
            if tier.name.trim().is_empty() {
                return invalid("tier name must not be empty".to_string());
            }
            if !tier_names.insert(tier.name.as_str()) {
                return invalid(format!("duplicate tier '{}'", tier.name));
            }
            if tier.paths.is_empty() {
                return invalid(format!("tier '{}' has no paths", tier.name));
            }
        }

        let mut stage_names = HashSet::new();
        for stage in &self.cascade.stages {
            if stage.name.is_empty()
                || !stage
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return invalid(format!(
                    "stage name '{}' must be non-empty and use [A-Za-z0-9_-]",
                    stage.name
                ));
            }
            if !stage_names.insert(stage.name.as_str()) {
                return invalid(format!("duplicate stage '{}'", stage.name));
            }
            if !tier_names.contains(stage.source.as_str()) {
                return invalid(format!(
                    "stage '{}' has unknown source tier '{}'",
                    stage.name, stage.source
                ));
            }
            if stage.targets.is_empty() {
                return invalid(format!("stage '{}' has no targets", stage.name));
            }
            for target in &stage.targets {
                if !tier_names.contains(target.as_str()) {
                    return invalid(format!(
                        "stage '{}' has unknown target tier '{}'",
                        stage.name, target
                    ));
                }
                if *target == stage.source {
                    return invalid(format!(
                        "stage '{}' targets its own source tier '{}'",
                        stage.name, target
                    ));
                }
            }
            if stage.lookback_hours == 0 && stage.trigger.is_none() {
                return invalid(format!(
                    "stage '{}' needs lookback_hours > 0",
                    stage.name
                ));
            }
        }
        for stage in &self.cascade.stages {
            if let Some(trigger) = &stage.trigger {
                if *trigger == stage.name {
                    return invalid(format!("stage '{}' cannot trigger itself", stage.name));
                }
                if !stage_names.contains(trigger.as_str()) {
                    return invalid(format!(
                        "stage '{}' is triggered by unknown stage '{}'",
                        stage.name, trigger
                    ));
                }
            }
        }

        self.include_set()?;
        self.retention_policies()?;

        Ok(())
    }

    /// Compiled include patterns.
    pub fn include_set(&self) -> Result<GlobSet, ConfigError> {
        if self.cascade.include.is_empty() {
            return Err(ConfigError::Invalid(
                "cascade.include must list at least one pattern".to_string(),
            ));
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.cascade.include {
            let glob = Glob::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("bad include pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("bad include patterns: {}", e)))
    }

    /// Retention rules converted to policies.
    pub fn retention_policies(&self) -> Result<Vec<RetentionPolicy>, ConfigError> {
        let mut seen = HashSet::new();
        let mut policies = Vec::with_capacity(self.retention.len());
        for rule in &self.retention {
            if self.tier(&rule.tier).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "retention rule for unknown tier '{}'",
                    rule.tier
                )));
            }
            if !seen.insert((rule.tier.clone(), rule.level.clone())) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate retention rule for tier '{}' level '{}'",
                    rule.tier,
                    rule.level.as_deref().unwrap_or("*")
                )));
            }
            policies.push(RetentionPolicy::from_rule(rule).map_err(ConfigError::Invalid)?);
        }
        Ok(policies)
    }

    /// Look up a tier by name.
    pub fn tier(&self, name: &str) -> Option<&TierSpec> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.cascade.stages.iter().find(|s| s.name == name)
    }

    /// Directory holding stage lock files.
    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Handoff directory for a stage.
    pub fn handoff_dir(&self, stage: &str) -> PathBuf {
        self.state_dir.join("handoff").join(stage)
    }

    /// Cursor file recording the upstream sequence a stage last consumed.
    pub fn cursor_path(&self, stage: &str) -> PathBuf {
        self.state_dir.join("cursors").join(format!("{}.seq", stage))
    }
}
