//! Ledger entry types and replay products

use chrono::{DateTime, SecondsFormat, Utc};
use salsync_common::types::{NaturalKey, RecordKind, RecordOutcome, SalaryKey, TransferResult};
use salsync_common::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::transfer::JobHandle;

/// Ledger entry kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A batch became a remote job
    JobSubmitted,
    /// One record's result
    RecordOutcome,
    /// A batch is settled; no later entry refers to it
    BatchReconciled,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::JobSubmitted => "job_submitted",
            EntryKind::RecordOutcome => "record_outcome",
            EntryKind::BatchReconciled => "batch_reconciled",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job_submitted" => Ok(EntryKind::JobSubmitted),
            "record_outcome" => Ok(EntryKind::RecordOutcome),
            "batch_reconciled" => Ok(EntryKind::BatchReconciled),
            other => Err(SyncError::LedgerCorrupt(format!(
                "unknown entry kind '{}'",
                other
            ))),
        }
    }
}

/// How a batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    FailedPermanent,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Completed => "completed",
            BatchStatus::FailedPermanent => "failed_permanent",
        }
    }
}

/// Everything written when a batch is settled
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReconciliation {
    pub batch_id: String,
    pub kind: RecordKind,
    pub job_id: Option<String>,
    pub record_keys: Vec<String>,
    pub status: BatchStatus,
    /// Per-record results; empty for a permanently failed batch
    pub results: Vec<TransferResult>,
    pub reason: Option<String>,
}

impl BatchReconciliation {
    pub fn completed(handle: &JobHandle, results: Vec<TransferResult>) -> Self {
        Self {
            batch_id: handle.batch_id.clone(),
            kind: handle.kind,
            job_id: Some(handle.job_id.clone()),
            record_keys: handle.record_keys.clone(),
            status: BatchStatus::Completed,
            results,
            reason: None,
        }
    }

    pub fn failed_permanent(
        batch_id: impl Into<String>,
        kind: RecordKind,
        job_id: Option<String>,
        record_keys: Vec<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            kind,
            job_id,
            record_keys,
            status: BatchStatus::FailedPermanent,
            results: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// One row of `ledger_entries`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Assigned by the database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub recorded_at: DateTime<Utc>,
    pub entry_kind: EntryKind,
    pub run_id: String,
    pub batch_id: String,
    pub record_kind: RecordKind,
    pub record_key: Option<String>,
    pub job_id: Option<String>,
    pub status: Option<String>,
    pub remote_id: Option<String>,
    pub details: JsonValue,
    pub previous_hash: Option<String>,
    pub entry_hash: Option<String>,
}

impl LedgerEntry {
    fn base(run_id: &str, entry_kind: EntryKind, batch_id: &str, record_kind: RecordKind) -> Self {
        Self {
            id: None,
            recorded_at: Utc::now(),
            entry_kind,
            run_id: run_id.to_string(),
            batch_id: batch_id.to_string(),
            record_kind,
            record_key: None,
            job_id: None,
            status: None,
            remote_id: None,
            details: json!({}),
            previous_hash: None,
            entry_hash: None,
        }
    }

    pub fn job_submitted(run_id: &str, handle: &JobHandle) -> Self {
        let mut entry = Self::base(run_id, EntryKind::JobSubmitted, &handle.batch_id, handle.kind);
        entry.job_id = Some(handle.job_id.clone());
        entry.details = json!({ "record_keys": handle.record_keys });
        entry
    }

    pub fn record_outcome(
        run_id: &str,
        batch: &BatchReconciliation,
        result: &TransferResult,
    ) -> Self {
        let mut entry = Self::base(run_id, EntryKind::RecordOutcome, &batch.batch_id, batch.kind);
        entry.record_key = Some(result.key.clone());
        entry.job_id = batch.job_id.clone();
        match &result.outcome {
            RecordOutcome::Succeeded { remote_id } => {
                entry.status = Some("succeeded".to_string());
                entry.remote_id = Some(remote_id.clone());
                entry.details = json!({ "position": result.position });
            }
            RecordOutcome::Failed { code, message } => {
                entry.status = Some("failed".to_string());
                entry.details = json!({
                    "position": result.position,
                    "code": code,
                    "message": message,
                });
            }
        }
        entry
    }

    pub fn batch_reconciled(run_id: &str, batch: &BatchReconciliation) -> Self {
        let mut entry = Self::base(run_id, EntryKind::BatchReconciled, &batch.batch_id, batch.kind);
        entry.job_id = batch.job_id.clone();
        entry.status = Some(batch.status.as_str().to_string());
        entry.details = json!({
            "records": batch.record_keys.len(),
            "reason": batch.reason,
        });
        entry
    }

    /// Timestamp as stored and hashed
    pub fn recorded_at_text(&self) -> String {
        self.recorded_at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Record keys carried by a `job_submitted` entry
    pub fn submitted_keys(&self) -> Vec<String> {
        self.details
            .get("record_keys")
            .and_then(JsonValue::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Compute hash of this entry, chained to `previous_hash`
    pub fn compute_hash(&self) -> String {
        use sha2::{Digest, Sha256};

        let data = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.recorded_at_text(),
            self.entry_kind.as_str(),
            self.run_id,
            self.batch_id,
            self.record_kind.as_str(),
            self.record_key.as_deref().unwrap_or_default(),
            self.job_id.as_deref().unwrap_or_default(),
            self.status.as_deref().unwrap_or_default(),
            self.remote_id.as_deref().unwrap_or_default(),
            self.details,
            self.previous_hash.as_deref().unwrap_or_default(),
        );

        hex::encode(Sha256::digest(data.as_bytes()))
    }
}

/// Counters reconstructed by replay, for status output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounts {
    pub entries: usize,
    pub jobs_submitted: usize,
    pub batches_completed: usize,
    pub batches_failed: usize,
    pub people_succeeded: usize,
    pub salaries_succeeded: usize,
    pub records_failed: usize,
}

/// What a restart needs to know
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    pub identities: HashMap<NaturalKey, String>,
    pub succeeded_salaries: HashSet<SalaryKey>,
    /// Submitted jobs with no `batch_reconciled` entry, oldest first
    pub orphans: Vec<JobHandle>,
    pub counts: LedgerCounts,
}

impl LedgerState {
    pub fn identities(&self) -> impl Iterator<Item = salsync_common::types::ExternalIdentity> + '_ {
        self.identities
            .iter()
            .map(|(key, remote_id)| salsync_common::types::ExternalIdentity {
                natural_key: key.clone(),
                remote_id: remote_id.clone(),
            })
    }
}

/// Result of walking the hash chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub entries: usize,
    /// Id of the first entry whose hash or link does not match
    pub broken_at: Option<i64>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.broken_at.is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn handle() -> JobHandle {
        JobHandle {
            job_id: "750x".into(),
            batch_id: "person-run-1".into(),
            kind: RecordKind::Person,
            record_keys: vec!["lovelace|ada||".into(), "hopper|grace||".into()],
        }
    }

    #[test]
    fn test_entry_kind_round_trip() {
        assert_eq!(
            "batch_reconciled".parse::<EntryKind>().unwrap(),
            EntryKind::BatchReconciled
        );
        assert!("job_started".parse::<EntryKind>().is_err());
    }

    #[test]
    fn test_submitted_keys() {
        let entry = LedgerEntry::job_submitted("run", &handle());
        assert_eq!(entry.submitted_keys(), handle().record_keys);
        assert_eq!(entry.job_id.as_deref(), Some("750x"));
    }

    #[test]
    fn test_hash_depends_on_chain_and_content() {
        let mut entry = LedgerEntry::job_submitted("run", &handle());
        let first = entry.compute_hash();
        assert_eq!(first, entry.compute_hash());

        entry.previous_hash = Some("abc".into());
        let chained = entry.compute_hash();
        assert_ne!(first, chained);

        entry.remote_id = Some("001".into());
        assert_ne!(chained, entry.compute_hash());
    }

    #[test]
    fn test_failed_outcome_details() {
        let batch = BatchReconciliation::completed(&handle(), Vec::new());
        let result = TransferResult {
            position: 1,
            key: "hopper|grace||".into(),
            outcome: RecordOutcome::failed("DUPLICATE_VALUE", "dup"),
        };
        let entry = LedgerEntry::record_outcome("run", &batch, &result);
        assert_eq!(entry.status.as_deref(), Some("failed"));
        assert_eq!(entry.details["code"], "DUPLICATE_VALUE");
        assert!(entry.remote_id.is_none());
    }
}
