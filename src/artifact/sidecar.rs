//! Checksum sidecars
//!
//! `<artifact>.sha256` holds one line in `sha256sum` format:
//! `<64 hex digits>  <file name>`. The binary-mode marker (`<hex> *<name>`)
//! is accepted on read; writes always use the two-space form.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cascade_state::{atomic_write, AtomicWriteError};
use thiserror::Error;

/// Sidecar file suffix
pub const SIDECAR_SUFFIX: &str = ".sha256";

/// Human log suffix
pub const LOG_SUFFIX: &str = ".log";

/// Errors reading or writing sidecars
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("malformed checksum sidecar {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("failed to read sidecar {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Write(#[from] AtomicWriteError),
}

/// Parsed sidecar line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    /// Lowercase hex SHA-256
    pub digest: String,
    /// File name the digest belongs to
    pub file_name: String,
}

/// `<artifact>.sha256`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    append_suffix(artifact, SIDECAR_SUFFIX)
}

/// `<artifact>.log`
pub fn log_path(artifact: &Path) -> PathBuf {
    append_suffix(artifact, LOG_SUFFIX)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

impl Sidecar {
    pub fn new(digest: &str, file_name: &str) -> Self {
        Self {
            digest: digest.to_ascii_lowercase(),
            file_name: file_name.to_string(),
        }
    }

    /// Parse sidecar content (first non-empty line).
    pub fn parse(content: &str) -> Result<Self, String> {
        let line = content
            .lines()
            .map(str::trim_end)
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| "empty sidecar".to_string())?;

        let (digest, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| "expected '<digest>  <filename>'".to_string())?;

        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("not a sha256 hex digest: {:?}", digest));
        }

        let file_name = rest.trim_start();
        let file_name = file_name.strip_prefix('*').unwrap_or(file_name);
        if file_name.is_empty() {
            return Err("missing file name".to_string());
        }

        Ok(Self::new(digest, file_name))
    }

    /// Read the sidecar colocated with `artifact`, if any.
    pub fn read_for(artifact: &Path) -> Result<Option<Self>, SidecarError> {
        let path = sidecar_path(artifact);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SidecarError::Io { path, source }),
        };
        Self::parse(&content)
            .map(Some)
            .map_err(|reason| SidecarError::Malformed { path, reason })
    }

    /// Whether this sidecar is about `file_name`; a leading directory is ignored.
    pub fn names(&self, file_name: &str) -> bool {
        Path::new(&self.file_name)
            .file_name()
            .is_some_and(|name| name == file_name)
    }

    /// Render as a sidecar line.
    pub fn render(&self) -> String {
        format!("{}  {}\n", self.digest, self.file_name)
    }

    /// Atomically write this sidecar next to `artifact`.
    pub fn write_for(&self, artifact: &Path) -> Result<PathBuf, SidecarError> {
        let path = sidecar_path(artifact);
        atomic_write(&path, self.render().as_bytes())?;
        Ok(path)
    }
}
