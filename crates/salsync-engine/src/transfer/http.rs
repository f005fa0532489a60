//! HTTP bulk ingest client
//!
//! Talks to a Bulk-API-2.0-style REST surface: create a job, upload the
//! CSV body, mark the upload complete, poll the job, then read the
//! successful and failed result sets.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use salsync_common::types::{RecordKind, RecordOutcome, TransferResult};
use salsync_common::{Result, SyncError};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::csv_codec;
use super::endpoints;
use super::types::{
    ApiErrorBody, BulkOperation, CreateJobRequest, JobInfo, JobStateUpdate, RemoteJobState,
};
use super::{BulkTransfer, Credential, JobHandle, JobStatus};
use crate::batcher::TransferBatch;
use crate::config::RemoteConfig;

/// Result code for a submitted record the remote store never reported on
pub const MISSING_RESULT_CODE: &str = "MISSING_RESULT";

/// Result code for a record reported as created without a remote id
pub const MISSING_ID_CODE: &str = "MISSING_ID";

const SF_ID: &str = "sf__Id";
const SF_ERROR: &str = "sf__Error";

/// Error bodies are cut to this many characters in messages
const MAX_ERROR_DETAIL: usize = 300;

pub struct BulkApiClient {
    client: Client,
    api_version: String,
    person_object: String,
    salary_object: String,
    operation: BulkOperation,
}

impl BulkApiClient {
    pub fn new(remote: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(remote.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_version: remote.api_version.clone(),
            person_object: remote.person_object.clone(),
            salary_object: remote.salary_object.clone(),
            operation: remote.operation,
        })
    }

    fn object(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::Person => &self.person_object,
            RecordKind::Salary => &self.salary_object,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        credential: &Credential,
        action: &str,
    ) -> Result<Response> {
        let response = request
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| SyncError::submission(format!("{} failed: {}", action, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, action, &body))
    }

    async fn upload_and_close(
        &self,
        credential: &Credential,
        job_id: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        let url = endpoints::batches_url(&credential.instance_url, &self.api_version, job_id);
        self.send(
            self.client.put(&url).header(CONTENT_TYPE, "text/csv").body(body),
            credential,
            "upload job data",
        )
        .await?;

        let url = endpoints::job_url(&credential.instance_url, &self.api_version, job_id);
        self.send(
            self.client.patch(&url).json(&JobStateUpdate::UPLOAD_COMPLETE),
            credential,
            "close job",
        )
        .await?;
        Ok(())
    }

    /// Best effort; a job left open simply expires remotely
    async fn abort(&self, credential: &Credential, job_id: &str) {
        let url = endpoints::job_url(&credential.instance_url, &self.api_version, job_id);
        if let Err(e) = self
            .send(
                self.client.patch(&url).json(&JobStateUpdate::ABORTED),
                credential,
                "abort job",
            )
            .await
        {
            warn!(job_id, error = %e, "Failed to abort bulk job");
        }
    }

    async fn get_text(&self, credential: &Credential, url: &str, action: &str) -> Result<String> {
        self.send(self.client.get(url), credential, action)
            .await?
            .text()
            .await
            .map_err(|e| SyncError::submission(format!("{} body unreadable: {}", action, e)))
    }
}

#[async_trait]
impl BulkTransfer for BulkApiClient {
    async fn submit(&self, credential: &Credential, batch: &TransferBatch) -> Result<JobHandle> {
        let body = csv_codec::encode_batch(batch.kind, &batch.records)?;

        let request = CreateJobRequest {
            object: self.object(batch.kind),
            operation: self.operation,
            external_id_field_name: match self.operation {
                BulkOperation::Upsert => Some(csv_codec::external_id_field(batch.kind)),
                BulkOperation::Insert => None,
            },
            content_type: "CSV",
            line_ending: "LF",
        };

        let url = endpoints::jobs_url(&credential.instance_url, &self.api_version);
        let job: JobInfo = self
            .send(self.client.post(&url).json(&request), credential, "create job")
            .await?
            .json()
            .await
            .map_err(|e| SyncError::submission(format!("create job response unreadable: {}", e)))?;

        if let Err(e) = self.upload_and_close(credential, &job.id, body).await {
            self.abort(credential, &job.id).await;
            return Err(e);
        }

        info!(
            batch_id = %batch.id,
            job_id = %job.id,
            records = batch.len(),
            object = request.object,
            "Submitted bulk job"
        );

        Ok(JobHandle {
            job_id: job.id,
            batch_id: batch.id.clone(),
            kind: batch.kind,
            record_keys: batch.record_keys(),
        })
    }

    async fn poll(&self, credential: &Credential, handle: &JobHandle) -> Result<JobStatus> {
        let url = endpoints::job_url(&credential.instance_url, &self.api_version, &handle.job_id);
        let job: JobInfo = self
            .send(self.client.get(&url), credential, "poll job")
            .await?
            .json()
            .await
            .map_err(|e| SyncError::submission(format!("poll response unreadable: {}", e)))?;

        debug!(job_id = %handle.job_id, state = ?job.state, "Polled bulk job");

        Ok(match job.state {
            RemoteJobState::Open | RemoteJobState::UploadComplete => JobStatus::Queued,
            RemoteJobState::InProgress => JobStatus::InProgress,
            RemoteJobState::JobComplete => JobStatus::Completed,
            RemoteJobState::Failed | RemoteJobState::Aborted => JobStatus::Failed {
                message: job
                    .error_message
                    .unwrap_or_else(|| format!("job ended in state {:?}", job.state)),
            },
        })
    }

    async fn fetch_results(
        &self,
        credential: &Credential,
        handle: &JobHandle,
    ) -> Result<Vec<TransferResult>> {
        let instance = &credential.instance_url;
        let external_id = csv_codec::external_id_field(handle.kind);

        let succeeded = self
            .get_text(
                credential,
                &endpoints::successful_results_url(instance, &self.api_version, &handle.job_id),
                "fetch successful results",
            )
            .await?;
        let failed = self
            .get_text(
                credential,
                &endpoints::failed_results_url(instance, &self.api_version, &handle.job_id),
                "fetch failed results",
            )
            .await?;

        let mut outcomes = HashMap::new();
        parse_result_set(&succeeded, external_id, true, &mut outcomes)?;
        parse_result_set(&failed, external_id, false, &mut outcomes)?;

        Ok(align_results(&handle.record_keys, outcomes))
    }
}

/// Map a non-success HTTP status onto the error taxonomy
pub fn classify_status(status: StatusCode, action: &str, body: &str) -> SyncError {
    let message = format!("{} returned {}: {}", action, status, error_detail(body));
    match status {
        StatusCode::UNAUTHORIZED => SyncError::AuthExpired(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SyncError::Submission(message)
        }
        s if s.is_server_error() => SyncError::Submission(message),
        _ => SyncError::Rejected(message),
    }
}

fn error_detail(body: &str) -> String {
    if let Ok(errors) = serde_json::from_str::<Vec<ApiErrorBody>>(body) {
        let parts: Vec<String> = errors
            .into_iter()
            .map(|e| {
                format!(
                    "{}: {}",
                    e.error_code.unwrap_or_default(),
                    e.message.unwrap_or_default()
                )
            })
            .collect();
        if !parts.is_empty() {
            return parts.join("; ");
        }
    }
    body.trim().chars().take(MAX_ERROR_DETAIL).collect()
}

/// Read one result CSV into `outcomes`, keyed by external-id value
pub fn parse_result_set(
    body: &str,
    external_id_field: &str,
    successful: bool,
    outcomes: &mut HashMap<String, RecordOutcome>,
) -> Result<()> {
    if body.trim().is_empty() {
        return Ok(());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| SyncError::submission(format!("result set unreadable: {}", e)))?
        .clone();

    let column = |name: &str| headers.iter().position(|h| h == name);
    let key_idx = column(external_id_field).ok_or_else(|| {
        SyncError::submission(format!("result set has no {} column", external_id_field))
    })?;
    let id_idx = column(SF_ID);
    let error_idx = column(SF_ERROR);

    for row in reader.records() {
        let row = row.map_err(|e| SyncError::submission(format!("result row unreadable: {}", e)))?;
        let Some(key) = row.get(key_idx) else {
            continue;
        };

        let outcome = if successful {
            match id_idx.and_then(|i| row.get(i)).map(str::trim) {
                Some(id) if !id.is_empty() => RecordOutcome::Succeeded {
                    remote_id: id.to_string(),
                },
                _ => RecordOutcome::failed(
                    MISSING_ID_CODE,
                    "reported as created without a record id",
                ),
            }
        } else {
            let raw = error_idx.and_then(|i| row.get(i)).unwrap_or_default();
            let (code, message) = split_error(raw);
            RecordOutcome::failed(code, message)
        };
        outcomes.insert(key.to_string(), outcome);
    }

    Ok(())
}

/// `CODE:message` → (`CODE`, `message`)
fn split_error(raw: &str) -> (String, String) {
    match raw.split_once(':') {
        Some((code, message)) if !code.trim().is_empty() && !code.contains(' ') => {
            (code.trim().to_string(), message.trim().to_string())
        }
        _ => ("UNKNOWN_ERROR".to_string(), raw.trim().to_string()),
    }
}

/// One result per submitted key, in submission order
pub fn align_results(
    record_keys: &[String],
    mut outcomes: HashMap<String, RecordOutcome>,
) -> Vec<TransferResult> {
    record_keys
        .iter()
        .enumerate()
        .map(|(position, key)| TransferResult {
            position,
            key: key.clone(),
            outcome: outcomes.remove(key).unwrap_or_else(|| {
                RecordOutcome::failed(MISSING_RESULT_CODE, "no result reported for this record")
            }),
        })
        .collect()
}
