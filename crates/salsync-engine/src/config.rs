//! Sync configuration
//!
//! Layered as defaults → optional TOML file → `SALSYNC_*` environment
//! variables. The CLI applies its flags last.

use anyhow::Context;
use salsync_common::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::batcher::BatchLimits;
use crate::retry::{PollPolicy, RetryPolicy};
use crate::transfer::BulkOperation;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default ledger file, relative to the working directory.
pub const DEFAULT_LEDGER_PATH: &str = "salsync-ledger.db";

/// Rows fetched per source page.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Bulk jobs allowed in flight at once.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 2;

/// Remote REST API version.
pub const DEFAULT_API_VERSION: &str = "59.0";

/// HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Top-level configuration for one sync run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub ledger: LedgerConfig,
    pub batch: BatchLimits,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    pub remote: RemoteConfig,
    pub concurrency: ConcurrencyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// SQLite snapshot to read; required before a run starts
    pub path: Option<PathBuf>,
    pub page_size: usize,
    /// Read at most this many person rows
    pub person_limit: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            page_size: DEFAULT_PAGE_SIZE,
            person_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LEDGER_PATH),
        }
    }
}

/// Remote object naming and API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_version: String,
    pub person_object: String,
    pub salary_object: String,
    pub operation: BulkOperation,
    /// Record type assigned to created person accounts, when the org needs one
    pub person_record_type_id: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            person_object: "Account".to_string(),
            salary_object: "Salary_History__c".to_string(),
            operation: BulkOperation::Insert,
            person_record_type_id: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_in_flight: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl SyncConfig {
    /// Load defaults, then the TOML file if given, then environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides()
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `SALSYNC_*` environment variables
    ///
    /// - `SALSYNC_SOURCE`, `SALSYNC_LEDGER`
    /// - `SALSYNC_BATCH_SIZE`, `SALSYNC_MAX_IN_FLIGHT`
    /// - `SALSYNC_API_VERSION`, `SALSYNC_OPERATION`, `SALSYNC_PERSON_RECORD_TYPE_ID`
    pub fn with_env_overrides(mut self) -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("SALSYNC_SOURCE") {
            self.source.path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("SALSYNC_LEDGER") {
            self.ledger.path = PathBuf::from(path);
        }

        if let Ok(size) = std::env::var("SALSYNC_BATCH_SIZE") {
            self.batch.max_records = size
                .parse()
                .with_context(|| format!("SALSYNC_BATCH_SIZE is not a number: {}", size))?;
        }

        if let Ok(n) = std::env::var("SALSYNC_MAX_IN_FLIGHT") {
            self.concurrency.max_in_flight = n
                .parse()
                .with_context(|| format!("SALSYNC_MAX_IN_FLIGHT is not a number: {}", n))?;
        }

        if let Ok(version) = std::env::var("SALSYNC_API_VERSION") {
            self.remote.api_version = version;
        }

        if let Ok(op) = std::env::var("SALSYNC_OPERATION") {
            self.remote.operation = op.parse()?;
        }

        if let Ok(id) = std::env::var("SALSYNC_PERSON_RECORD_TYPE_ID") {
            self.remote.person_record_type_id = Some(id);
        }

        Ok(self)
    }

    /// Reject settings the pipeline cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.source.page_size == 0 {
            return Err(SyncError::config("source.page_size must be at least 1"));
        }
        if self.batch.max_records == 0 {
            return Err(SyncError::config("batch.max_records must be at least 1"));
        }
        if self.batch.max_payload_bytes <= crate::batcher::HEADER_RESERVE_BYTES {
            return Err(SyncError::config(format!(
                "batch.max_payload_bytes must exceed {} bytes",
                crate::batcher::HEADER_RESERVE_BYTES
            )));
        }
        if self.concurrency.max_in_flight == 0 {
            return Err(SyncError::config("concurrency.max_in_flight must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::config("retry.max_attempts must be at least 1"));
        }
        self.poll.validate()?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batch.max_records, 10_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.concurrency.max_in_flight, DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(config.ledger.path, PathBuf::from(DEFAULT_LEDGER_PATH));
        assert_eq!(config.remote.salary_object, "Salary_History__c");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: SyncConfig = toml::from_str(
            r#"
            [batch]
            max_records = 200

            [remote]
            operation = "upsert"
            person_record_type_id = "012000000000001"
            "#,
        )
        .unwrap();

        assert_eq!(config.batch.max_records, 200);
        assert_eq!(config.batch.max_payload_bytes, BatchLimits::default().max_payload_bytes);
        assert_eq!(config.remote.operation, BulkOperation::Upsert);
        assert_eq!(config.remote.person_object, "Account");
        assert_eq!(config.source.page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salsync.toml");
        std::fs::write(&path, "[source]\npath = \"payroll.db\"\nperson_limit = 25\n").unwrap();

        let config = SyncConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.source.path, Some(PathBuf::from("payroll.db")));
        assert_eq!(config.source.person_limit, Some(25));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = SyncConfig::from_toml_file(Path::new("/nonexistent/salsync.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = SyncConfig::default();
        config.batch.max_records = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = SyncConfig::default();
        config.concurrency.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("SALSYNC_LEDGER", "/tmp/salsync-test-ledger.db");
        std::env::set_var("SALSYNC_MAX_IN_FLIGHT", "4");

        let config = SyncConfig::default().with_env_overrides().unwrap();
        assert_eq!(config.ledger.path, PathBuf::from("/tmp/salsync-test-ledger.db"));
        assert_eq!(config.concurrency.max_in_flight, 4);

        std::env::remove_var("SALSYNC_LEDGER");
        std::env::remove_var("SALSYNC_MAX_IN_FLIGHT");
    }
}
