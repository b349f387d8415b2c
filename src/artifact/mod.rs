//! Backup artifacts
//!
//! An artifact is an immutable archive file produced by the external builder
//! inside a tier, together with its colocated metadata:
//! - `<name>.sha256`: checksum sidecar (`<hex>  <name>`)
//! - `<name>.log`: human-readable builder log
//!
//! Artifact names follow `<host>-<level>-<YYYYMMDD>-<HHMMSS>.<ext>`. When a
//! name parses, the embedded timestamp is the artifact's logical time; when
//! it does not, the file mtime stands in.

mod sidecar;
mod verify;

pub use sidecar::{
    log_path, sidecar_path, Sidecar, SidecarError, LOG_SUFFIX, SIDECAR_SUFFIX,
};
pub use verify::{
    digest, integrity_test, integrity_test_as, verify, ArchiveFormat, IntegrityReport,
    IntegrityStatus, VerifyError,
};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use globset::GlobSet;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Level used when neither the name nor the directory layout gives one
pub const DEFAULT_LEVEL: &str = "default";

/// Suffix of in-flight copies written by the mirror engine
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Where an artifact's logical timestamp came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    /// Parsed from the artifact name
    Embedded,
    /// File modification time
    Mtime,
}

/// Fields parsed from an artifact file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub host: String,
    pub level: String,
    pub timestamp: DateTime<Utc>,
}

const NAME_PATTERN: &str =
    r"^(?P<host>.+)-(?P<level>[A-Za-z0-9_]+)-(?P<date>\d{8})-(?P<time>\d{6})\.";

fn name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(NAME_PATTERN) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(error = %e, "artifact name pattern rejected, falling back to mtime");
                None
            }
        })
        .as_ref()
}

impl ArtifactName {
    /// Parse `<host>-<level>-<YYYYMMDD>-<HHMMSS>.<ext>`.
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = name_pattern()?.captures(file_name)?;
        let stamp = format!("{}{}", &caps["date"], &caps["time"]);
        let naive = NaiveDateTime::parse_from_str(&stamp, "%Y%m%d%H%M%S").ok()?;
        Some(Self {
            host: caps["host"].to_string(),
            level: caps["level"].to_string(),
            timestamp: naive.and_utc(),
        })
    }
}

/// An immutable backup object as seen in one tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Tier the file was found in
    pub tier: String,

    /// Backup level (full, incr, ...)
    pub level: String,

    /// Logical timestamp
    pub timestamp: DateTime<Utc>,

    /// Origin of `timestamp`
    pub timestamp_source: TimestampSource,

    /// Producing host, when the name carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Size in bytes
    pub size: u64,

    /// Content digest from the checksum sidecar
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Why a sidecar that exists could not be trusted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar_error: Option<String>,

    /// Absolute path inside the tier
    pub path: PathBuf,

    /// Path relative to the tier root (preserved when mirroring)
    pub relative: PathBuf,

    /// File mtime
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

impl Artifact {
    /// Build an artifact from a file under `root`.
    pub fn from_path(tier: &str, root: &Path, path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let relative = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(path.file_name().unwrap_or_default()));
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified = metadata.modified().ok();

        let parsed = ArtifactName::parse(&file_name);
        let (level, host, timestamp, timestamp_source) = match parsed {
            Some(name) => (
                name.level,
                Some(name.host),
                name.timestamp,
                TimestampSource::Embedded,
            ),
            None => {
                let level = level_from_layout(&relative);
                let timestamp = DateTime::<Utc>::from(modified.unwrap_or(SystemTime::UNIX_EPOCH));
                (level, None, timestamp, TimestampSource::Mtime)
            }
        };

        let (digest, sidecar_error) = match Sidecar::read_for(path) {
            Ok(Some(sidecar)) if sidecar.names(&file_name) => (Some(sidecar.digest), None),
            Ok(Some(sidecar)) => (
                None,
                Some(format!(
                    "sidecar names '{}', not '{}'",
                    sidecar.file_name, file_name
                )),
            ),
            Ok(None) => (None, None),
            Err(e) => (None, Some(e.to_string())),
        };
        if let Some(reason) = &sidecar_error {
            warn!(artifact = %path.display(), reason = %reason, "untrusted checksum sidecar");
        }

        Ok(Self {
            tier: tier.to_string(),
            level,
            timestamp,
            timestamp_source,
            host,
            size: metadata.len(),
            digest,
            sidecar_error,
            path: path.to_path_buf(),
            relative,
            modified,
        })
    }

    /// File name of the artifact.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Tier-relative path rendered with `/` separators.
    pub fn relative_str(&self) -> String {
        self.relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Level from the first directory under the tier root, else `default`.
fn level_from_layout(relative: &Path) -> String {
    let mut components = relative.components();
    let first = components.next();
    match (first, components.next()) {
        (Some(dir), Some(_)) => dir.as_os_str().to_string_lossy().into_owned(),
        _ => DEFAULT_LEVEL.to_string(),
    }
}

/// Whether a file name is artifact metadata or transient state, never an artifact.
pub fn is_auxiliary(file_name: &str) -> bool {
    file_name.starts_with('.')
        || file_name.ends_with(SIDECAR_SUFFIX)
        || file_name.ends_with(LOG_SUFFIX)
        || file_name.ends_with(PARTIAL_SUFFIX)
}

/// Options for scanning a tier
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Patterns matched against the file name
    pub include: GlobSet,
    /// Only files modified at or after this instant
    pub modified_since: Option<SystemTime>,
}

impl ScanOptions {
    pub fn new(include: GlobSet) -> Self {
        Self {
            include,
            modified_since: None,
        }
    }

    pub fn modified_since(mut self, since: SystemTime) -> Self {
        self.modified_since = Some(since);
        self
    }
}

/// Walk a tier root and collect artifacts, sorted by relative path.
///
/// Hidden entries, sidecars, logs and partial copies are skipped. Hidden
/// directories are not descended into.
pub fn scan_tier(tier: &str, root: &Path, options: &ScanOptions) -> io::Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(e
                    .into_io_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "tier walk failed")))
            }
            Err(e) => {
                warn!(tier, error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy();
        if is_auxiliary(&file_name) || !options.include.is_match(&*file_name) {
            continue;
        }

        if let Some(since) = options.modified_since {
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            match modified {
                Some(modified) if modified >= since => {}
                _ => continue,
            }
        }

        match Artifact::from_path(tier, root, entry.path()) {
            Ok(artifact) => artifacts.push(artifact),
            Err(e) => warn!(tier, path = %entry.path().display(), error = %e, "skipping artifact"),
        }
    }

    artifacts.sort_by(|a, b| a.relative.cmp(&b.relative));
    debug!(tier, root = %root.display(), count = artifacts.len(), "tier scanned");
    Ok(artifacts)
}
