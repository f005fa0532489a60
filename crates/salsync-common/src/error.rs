//! Error types for salsync
//!
//! One taxonomy covers every failure the pipeline distinguishes. Row- and
//! record-level variants (`MalformedRow`, `DuplicateNaturalKey`) are reported
//! and skipped; batch-level variants fail one batch; `AuthExpired`,
//! `LedgerWrite` and `SourceUnavailable` end the run.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for salsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for salsync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Source database unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Malformed {table} row {row_id}: {reason}")]
    MalformedRow {
        table: String,
        row_id: i64,
        reason: String,
    },

    #[error("Duplicate natural key: {0}")]
    DuplicateNaturalKey(String),

    #[error("Bulk submission failed: {0}")]
    Submission(String),

    #[error("Bulk request rejected: {0}")]
    Rejected(String),

    #[error("Credential expired or revoked: {0}")]
    AuthExpired(String),

    #[error("Job {job_id} did not finish within {waited:?}")]
    JobTimeout { job_id: String, waited: Duration },

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    #[error("Ledger write failed: {0}")]
    LedgerWrite(String),

    #[error("Ledger is corrupt: {0}")]
    LedgerCorrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Create a malformed row error
    pub fn malformed(table: impl Into<String>, row_id: i64, reason: impl Into<String>) -> Self {
        Self::MalformedRow {
            table: table.into(),
            row_id,
            reason: reason.into(),
        }
    }

    /// Create a submission error
    pub fn submission(msg: impl Into<String>) -> Self {
        Self::Submission(msg.into())
    }

    /// Create a ledger write error
    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::LedgerWrite(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the same request may succeed if simply repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Submission(_))
    }

    /// Whether the error ends the whole run rather than one row or batch
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired(_)
                | Self::LedgerWrite(_)
                | Self::LedgerCorrupt(_)
                | Self::SourceUnavailable(_)
        )
    }

    /// Short machine-readable code used in error reports
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::MalformedRow { .. } => "malformed_row",
            Self::DuplicateNaturalKey(_) => "duplicate_natural_key",
            Self::Submission(_) => "submission_error",
            Self::Rejected(_) => "rejected",
            Self::AuthExpired(_) => "auth_expired",
            Self::JobTimeout { .. } => "job_timeout",
            Self::JobFailed { .. } => "job_failed",
            Self::LedgerWrite(_) => "ledger_write_failure",
            Self::LedgerCorrupt(_) => "ledger_corrupt",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_submission_is_retryable() {
        assert!(SyncError::submission("connection reset").is_retryable());
        assert!(!SyncError::Rejected("bad object".into()).is_retryable());
        assert!(!SyncError::AuthExpired("401".into()).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(SyncError::AuthExpired("401".into()).is_fatal());
        assert!(SyncError::ledger("disk full").is_fatal());
        assert!(!SyncError::malformed("Person", 3, "missing name").is_fatal());
        assert!(!SyncError::JobTimeout {
            job_id: "750x".into(),
            waited: Duration::from_secs(600)
        }
        .is_fatal());
    }

    #[test]
    fn test_malformed_display() {
        let err = SyncError::malformed("Salary", 42, "EntryDate is not a date");
        assert_eq!(err.to_string(), "Malformed Salary row 42: EntryDate is not a date");
        assert_eq!(err.code(), "malformed_row");
    }
}
