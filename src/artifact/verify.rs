//! Archive verification
//!
//! Two levels of checking:
//! 1. Content digest: streaming SHA-256 compared against an expected value
//! 2. Format integrity: decode the archive end to end without materializing
//!    any output (`.tar.gz`/`.tgz`, `.tar`, `.gz`)
//!
//! Unknown formats report `Unsupported`, which is not a failure.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::summary::ErrorKind;

const READ_BUFFER: usize = 64 * 1024;

/// Errors from verification
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("integrity test failed for {path}: {reason}")]
    Integrity { path: PathBuf, reason: String },
}

impl VerifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VerifyError::Io { .. } => ErrorKind::TransferError,
            VerifyError::Mismatch { .. } | VerifyError::Integrity { .. } => {
                ErrorKind::VerificationMismatch
            }
        }
    }
}

/// Streaming SHA-256 of a file, lowercase hex.
pub fn digest(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(READ_BUFFER, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether the file's digest equals `expected` (case-insensitive).
pub fn verify(path: &Path, expected: &str) -> io::Result<bool> {
    let actual = digest(path)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

/// Archive format, by file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Gzip,
    Unknown,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if name.ends_with(".tar") {
            ArchiveFormat::Tar
        } else if name.ends_with(".gz") {
            ArchiveFormat::Gzip
        } else {
            ArchiveFormat::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Gzip => "gzip",
            ArchiveFormat::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a format integrity test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Passed,
    Failed(String),
    Unsupported,
}

impl IntegrityStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, IntegrityStatus::Failed(_))
    }
}

impl fmt::Display for IntegrityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityStatus::Passed => f.write_str("passed"),
            IntegrityStatus::Failed(reason) => write!(f, "failed: {}", reason),
            IntegrityStatus::Unsupported => f.write_str("unsupported"),
        }
    }
}

/// Report of one integrity test
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub format: ArchiveFormat,
    /// Tar entries walked (0 for plain gzip)
    pub entries: u64,
    /// Decoded bytes read
    pub bytes: u64,
    pub status: IntegrityStatus,
}

impl IntegrityReport {
    /// Convert a failed status into an error.
    pub fn into_result(self, path: &Path) -> Result<Self, VerifyError> {
        match &self.status {
            IntegrityStatus::Failed(reason) => Err(VerifyError::Integrity {
                path: path.to_path_buf(),
                reason: reason.clone(),
            }),
            _ => Ok(self),
        }
    }
}

/// Decode an archive end to end, discarding output.
///
/// Only a file that cannot be opened is an error; decode failures are
/// reported as [`IntegrityStatus::Failed`].
pub fn integrity_test(path: &Path) -> Result<IntegrityReport, VerifyError> {
    integrity_test_as(path, ArchiveFormat::detect(path))
}

/// Like [`integrity_test`], with the format given instead of detected from
/// `path` (temp files do not carry the final extension).
pub fn integrity_test_as(path: &Path, format: ArchiveFormat) -> Result<IntegrityReport, VerifyError> {
    if format == ArchiveFormat::Unknown {
        return Ok(IntegrityReport {
            format,
            entries: 0,
            bytes: 0,
            status: IntegrityStatus::Unsupported,
        });
    }

    let file = File::open(path).map_err(|source| VerifyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::with_capacity(READ_BUFFER, file);

    let mut entries = 0u64;
    let mut bytes = 0u64;
    let outcome = match format {
        ArchiveFormat::TarGz => walk_tar(GzDecoder::new(reader), &mut entries, &mut bytes),
        ArchiveFormat::Tar => walk_tar(reader, &mut entries, &mut bytes),
        ArchiveFormat::Gzip => {
            io::copy(&mut GzDecoder::new(reader), &mut io::sink()).map(|n| bytes = n)
        }
        ArchiveFormat::Unknown => Ok(()),
    };

    let status = match outcome {
        Ok(()) => IntegrityStatus::Passed,
        Err(e) => IntegrityStatus::Failed(e.to_string()),
    };
    debug!(path = %path.display(), %format, entries, bytes, %status, "integrity test");

    Ok(IntegrityReport {
        format,
        entries,
        bytes,
        status,
    })
}

/// Walk every tar entry, then drain whatever follows the end marker so a
/// truncated compressed stream is detected.
fn walk_tar<R: Read>(reader: R, entries: &mut u64, bytes: &mut u64) -> io::Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        *bytes += io::copy(&mut entry, &mut io::sink())?;
        *entries += 1;
    }
    io::copy(&mut archive.into_inner(), &mut io::sink())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn noisy_bytes(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xff) as u8
            })
            .collect()
    }

    fn write_tar_gz(path: &Path, body: &[u8]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "data.bin", body).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_digest_known_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"test").unwrap();

        assert_eq!(
            digest(&path).unwrap(),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_verify_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"test").unwrap();

        assert!(verify(
            &path,
            "9F86D081884C7D659A2FEAA0C55AD015A3BF4F1B2B0B822CD15D6C15B0F00A08"
        )
        .unwrap());
        assert!(!verify(&path, &"0".repeat(64)).unwrap());
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar.gz")), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect(Path::new("a.TGZ")), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect(Path::new("a.tar")), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::detect(Path::new("a.sql.gz")), ArchiveFormat::Gzip);
        assert_eq!(ArchiveFormat::detect(Path::new("a.zip")), ArchiveFormat::Unknown);
    }

    #[test]
    fn test_integrity_tar_gz_passes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db01-full-20260301-020000.tar.gz");
        write_tar_gz(&path, &noisy_bytes(32 * 1024));

        let report = integrity_test(&path).unwrap();
        assert_eq!(report.status, IntegrityStatus::Passed);
        assert_eq!(report.entries, 1);
        assert_eq!(report.bytes, 32 * 1024);
    }

    #[test]
    fn test_integrity_truncated_tar_gz_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db01-full-20260301-020000.tar.gz");
        write_tar_gz(&path, &noisy_bytes(64 * 1024));

        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() / 2]).unwrap();

        let report = integrity_test(&path).unwrap();
        assert!(report.status.is_failed(), "status: {}", report.status);
        assert!(report.into_result(&path).is_err());
    }

    #[test]
    fn test_integrity_plain_gzip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dump.sql.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(b"select 1;\n").unwrap();
        encoder.finish().unwrap();

        let report = integrity_test(&path).unwrap();
        assert_eq!(report.status, IntegrityStatus::Passed);
        assert_eq!(report.bytes, 10);

        fs::write(&path, b"not gzip at all").unwrap();
        assert!(integrity_test(&path).unwrap().status.is_failed());
    }

    #[test]
    fn test_integrity_unknown_format_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.zip");
        fs::write(&path, b"PK").unwrap();

        let report = integrity_test(&path).unwrap();
        assert_eq!(report.status, IntegrityStatus::Unsupported);
        assert!(report.into_result(&path).is_ok());
    }

    #[test]
    fn test_integrity_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = integrity_test(&dir.path().join("gone.tar")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferError);
    }
}
