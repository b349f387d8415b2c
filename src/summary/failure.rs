//! Failure taxonomy and stable exit codes

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invalid or unreadable configuration (fatal, no partial action)
    ConfigError,
    /// No writable/available destination (fatal for the run)
    DestinationUnavailable,
    /// Copy failed for one tier (fatal to that tier's handoff only)
    TransferError,
    /// Digest or format check failed (copy is never promoted)
    VerificationMismatch,
    /// Another process holds the stage lease (benign skip)
    LockContention,
    /// A single purge deletion failed (counted, batch continues)
    PurgeError,
}

impl ErrorKind {
    /// Stable name used in logs and SUMMARY lines
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::DestinationUnavailable => "DestinationUnavailable",
            ErrorKind::TransferError => "TransferError",
            ErrorKind::VerificationMismatch => "VerificationMismatch",
            ErrorKind::LockContention => "LockContention",
            ErrorKind::PurgeError => "PurgeError",
        }
    }

    /// Whether an error of this kind aborts the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigError | ErrorKind::DestinationUnavailable
        )
    }

    /// Exit code a run carries when this kind decides its outcome
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ErrorKind::ConfigError | ErrorKind::DestinationUnavailable => ExitCode::Precondition,
            ErrorKind::TransferError => ExitCode::PartialMirror,
            ErrorKind::VerificationMismatch => ExitCode::VerificationMismatch,
            ErrorKind::LockContention => ExitCode::LockContention,
            ErrorKind::PurgeError => ExitCode::Success,
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "Configuration invalid",
            ErrorKind::DestinationUnavailable => "No usable destination",
            ErrorKind::TransferError => "Transfer failed",
            ErrorKind::VerificationMismatch => "Verification failed",
            ErrorKind::LockContention => "Stage already running",
            ErrorKind::PurgeError => "Purge deletion failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Run completed (including IDLE and non-fatal purge errors)
    Success = 0,
    /// Fatal precondition failure (config, destination)
    Precondition = 10,
    /// At least one tier failed to mirror
    PartialMirror = 20,
    /// A digest or integrity check failed
    VerificationMismatch = 30,
    /// Stage lease held elsewhere; nothing was done (EX_TEMPFAIL)
    LockContention = 75,
}

impl ExitCode {
    /// Get the integer value of the exit code
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Create from integer value
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            10 => Some(ExitCode::Precondition),
            20 => Some(ExitCode::PartialMirror),
            30 => Some(ExitCode::VerificationMismatch),
            75 => Some(ExitCode::LockContention),
            _ => None,
        }
    }

    /// Check if this exit code indicates success
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }

    /// Whether alerting should treat this code as a failure
    pub fn is_failure(&self) -> bool {
        !matches!(self, ExitCode::Success | ExitCode::LockContention)
    }
}

impl Default for ExitCode {
    fn default() -> Self {
        ExitCode::Success
    }
}

/// Per-kind counts of non-fatal errors collected during a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    counts: BTreeMap<ErrorKind, usize>,
}

impl ErrorCounts {
    /// Create an empty tally
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one error of `kind`
    pub fn add(&mut self, kind: ErrorKind) {
        *self.counts.entry(kind).or_insert(0) += 1;
    }

    /// Count `n` errors of `kind`
    pub fn add_n(&mut self, kind: ErrorKind, n: usize) {
        if n > 0 {
            *self.counts.entry(kind).or_insert(0) += n;
        }
    }

    /// Fold another tally into this one
    pub fn merge(&mut self, other: &ErrorCounts) {
        for (kind, n) in &other.counts {
            self.add_n(*kind, *n);
        }
    }

    /// Count for one kind
    pub fn get(&self, kind: ErrorKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Total errors across kinds
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterate kinds in stable order
    pub fn iter(&self) -> impl Iterator<Item = (ErrorKind, usize)> + '_ {
        self.counts.iter().map(|(k, n)| (*k, *n))
    }

    /// Exit code implied by the collected errors.
    ///
    /// Verification failures outrank precondition failures, which outrank
    /// transfer failures. Purge errors never change the exit code.
    pub fn exit_code(&self) -> ExitCode {
        const PRIORITY: [ErrorKind; 4] = [
            ErrorKind::VerificationMismatch,
            ErrorKind::ConfigError,
            ErrorKind::DestinationUnavailable,
            ErrorKind::TransferError,
        ];
        PRIORITY
            .iter()
            .find(|kind| self.get(**kind) > 0)
            .map(|kind| kind.exit_code())
            .unwrap_or(ExitCode::Success)
    }

    /// `Kind:n,Kind:n` or `none`
    pub fn render(&self) -> String {
        if self.counts.is_empty() {
            return "none".to_string();
        }
        self.counts
            .iter()
            .map(|(k, n)| format!("{}:{}", k, n))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success.as_i32(), 0);
        assert_eq!(ExitCode::Precondition.as_i32(), 10);
        assert_eq!(ExitCode::PartialMirror.as_i32(), 20);
        assert_eq!(ExitCode::VerificationMismatch.as_i32(), 30);
        assert_eq!(ExitCode::LockContention.as_i32(), 75);
    }

    #[test]
    fn test_exit_code_from_i32() {
        assert_eq!(ExitCode::from_i32(0), Some(ExitCode::Success));
        assert_eq!(ExitCode::from_i32(75), Some(ExitCode::LockContention));
        assert_eq!(ExitCode::from_i32(1), None);
    }

    #[test]
    fn test_lock_contention_is_not_a_failure() {
        assert!(!ExitCode::LockContention.is_failure());
        assert!(!ExitCode::LockContention.is_success());
        assert!(ExitCode::PartialMirror.is_failure());
        assert!(!ExitCode::Success.is_failure());
    }

    #[test]
    fn test_kind_exit_code_mapping() {
        assert_eq!(ErrorKind::ConfigError.exit_code(), ExitCode::Precondition);
        assert_eq!(ErrorKind::DestinationUnavailable.exit_code(), ExitCode::Precondition);
        assert_eq!(ErrorKind::TransferError.exit_code(), ExitCode::PartialMirror);
        assert_eq!(ErrorKind::VerificationMismatch.exit_code(), ExitCode::VerificationMismatch);
        assert_eq!(ErrorKind::LockContention.exit_code(), ExitCode::LockContention);
        assert_eq!(ErrorKind::PurgeError.exit_code(), ExitCode::Success);
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::ConfigError.is_fatal());
        assert!(ErrorKind::DestinationUnavailable.is_fatal());
        assert!(!ErrorKind::TransferError.is_fatal());
        assert!(!ErrorKind::PurgeError.is_fatal());
        assert!(!ErrorKind::LockContention.is_fatal());
    }

    #[test]
    fn test_counts_render_and_total() {
        let mut counts = ErrorCounts::new();
        assert_eq!(counts.render(), "none");

        counts.add(ErrorKind::TransferError);
        counts.add(ErrorKind::PurgeError);
        counts.add(ErrorKind::PurgeError);

        assert_eq!(counts.total(), 3);
        assert_eq!(counts.render(), "TransferError:1,PurgeError:2");
    }

    #[test]
    fn test_counts_exit_code_priority() {
        let mut counts = ErrorCounts::new();
        counts.add(ErrorKind::PurgeError);
        assert_eq!(counts.exit_code(), ExitCode::Success);

        counts.add(ErrorKind::TransferError);
        assert_eq!(counts.exit_code(), ExitCode::PartialMirror);

        counts.add(ErrorKind::VerificationMismatch);
        assert_eq!(counts.exit_code(), ExitCode::VerificationMismatch);
    }

    #[test]
    fn test_counts_merge() {
        let mut a = ErrorCounts::new();
        a.add(ErrorKind::TransferError);
        let mut b = ErrorCounts::new();
        b.add(ErrorKind::TransferError);
        b.add(ErrorKind::VerificationMismatch);

        a.merge(&b);
        assert_eq!(a.get(ErrorKind::TransferError), 2);
        assert_eq!(a.get(ErrorKind::VerificationMismatch), 1);
    }

    #[test]
    fn test_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::VerificationMismatch).unwrap(),
            r#""VerificationMismatch""#
        );
    }
}
