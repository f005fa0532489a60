//! Bulk ingest wire types

use salsync_common::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Remote write operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkOperation {
    #[default]
    Insert,
    /// Insert or update on the external-id field
    Upsert,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperation::Insert => "insert",
            BulkOperation::Upsert => "upsert",
        }
    }
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BulkOperation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(BulkOperation::Insert),
            "upsert" => Ok(BulkOperation::Upsert),
            other => Err(SyncError::config(format!(
                "unknown bulk operation '{}', expected insert or upsert",
                other
            ))),
        }
    }
}

/// Body of a create-job request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest<'a> {
    pub object: &'a str,
    pub operation: BulkOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id_field_name: Option<&'a str>,
    pub content_type: &'static str,
    pub line_ending: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStateUpdate {
    pub state: &'static str,
}

impl JobStateUpdate {
    pub const UPLOAD_COMPLETE: JobStateUpdate = JobStateUpdate {
        state: "UploadComplete",
    };
    pub const ABORTED: JobStateUpdate = JobStateUpdate { state: "Aborted" };
}

/// Remote job states
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum RemoteJobState {
    Open,
    UploadComplete,
    InProgress,
    JobComplete,
    Failed,
    Aborted,
}

/// Job info returned by create and poll
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub state: RemoteJobState,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub number_records_processed: Option<u64>,
    #[serde(default)]
    pub number_records_failed: Option<u64>,
}

/// Error body entries returned with non-success statuses
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
