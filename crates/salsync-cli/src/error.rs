//! Error types for the salsync CLI
//!
//! User-facing errors with a hint on how to fix them.

use salsync_common::SyncError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Required setting missing or invalid
    #[error("Configuration error: {0}. Check your flags, environment variables or config file.")]
    Config(String),

    /// Ledger file does not exist yet
    #[error("No ledger found at '{0}'. Run 'salsync run' first or pass --ledger.")]
    LedgerNotFound(String),

    /// Hash chain verification failed
    #[error("Ledger integrity check failed at entry #{at}. The ledger may have been edited or corrupted.")]
    LedgerBroken { at: i64 },

    /// Interactive prompt failed or was cancelled
    #[error("Prompt failed: {0}")]
    Prompt(String),

    /// Engine error outside a pipeline run
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// File system operation failed
    #[error("File operation failed: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn prompt(msg: impl Into<String>) -> Self {
        Self::Prompt(msg.into())
    }
}
