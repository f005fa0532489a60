//! Bulk transfer client
//!
//! [`BulkTransfer`] is the seam between the pipeline and the remote store:
//! submit a batch as one asynchronous job, poll it, fetch per-record
//! results. Every call takes the [`Credential`] explicitly; refreshing it is
//! the job of a [`CredentialRefresher`].

pub mod csv_codec;
pub mod endpoints;
pub mod http;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use salsync_common::types::{RecordKind, TransferResult};
use salsync_common::Result;
use std::fmt;

use crate::batcher::TransferBatch;

pub use http::BulkApiClient;
pub use types::BulkOperation;

/// Session handle supplied by the caller
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub instance_url: String,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(instance_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("instance_url", &self.instance_url)
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A submitted job and the batch it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
    pub batch_id: String,
    pub kind: RecordKind,
    /// External-id values in submission order, for aligning results
    pub record_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed { message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed { .. })
    }
}

#[async_trait]
pub trait BulkTransfer: Send + Sync {
    /// Upload a batch as one job
    ///
    /// Errors: `Submission` (retryable), `Rejected`, `AuthExpired`.
    async fn submit(&self, credential: &Credential, batch: &TransferBatch) -> Result<JobHandle>;

    async fn poll(&self, credential: &Credential, handle: &JobHandle) -> Result<JobStatus>;

    /// One result per submitted record, in submission order
    async fn fetch_results(
        &self,
        credential: &Credential,
        handle: &JobHandle,
    ) -> Result<Vec<TransferResult>>;
}

/// Source of fresh credentials after `AuthExpired`
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// `None` when no fresh credential can be obtained
    async fn refresh(&self, expired: &Credential) -> Option<Credential>;
}

/// Never refreshes; an expired credential ends the run
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRefresh;

#[async_trait]
impl CredentialRefresher for NoRefresh {
    async fn refresh(&self, _expired: &Credential) -> Option<Credential> {
        None
    }
}
