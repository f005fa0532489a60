//! Shared fixtures for engine integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use rusqlite::{params, Connection};
use salsync_common::types::{RecordKind, RecordOutcome, TransferResult};
use salsync_common::{Result, SyncError};
use salsync_engine::batcher::TransferBatch;
use salsync_engine::config::SyncConfig;
use salsync_engine::ledger::{
    BatchReconciliation, IntegrityReport, LedgerState, ResultLedger, SqliteLedger,
};
use salsync_engine::record::OutboundRecord;
use salsync_engine::retry::{PollPolicy, VirtualClock};
use salsync_engine::transfer::{
    BulkTransfer, Credential, CredentialRefresher, JobHandle, JobStatus,
};
use salsync_engine::Pipeline;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Source snapshot
// ============================================================================

pub struct Snapshot {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl Snapshot {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salaries.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Person (ID INTEGER PRIMARY KEY, FirstName TEXT, LastName TEXT,
                                  Department TEXT);
             CREATE TABLE Salary (ID INTEGER PRIMARY KEY, PersonID INTEGER, Title TEXT,
                                  Employer TEXT, Salary REAL, Bonus REAL, TotalPay REAL,
                                  EntryDate TEXT, SourceFile TEXT, LineNumber INTEGER);",
        )
        .unwrap();
        Self { dir, path }
    }

    pub fn person(&self, id: i64, first: &str, last: &str) -> &Self {
        let conn = Connection::open(&self.path).unwrap();
        conn.execute(
            "INSERT INTO Person (ID, FirstName, LastName, Department) VALUES (?1, ?2, ?3, 'Engineering')",
            params![id, first, last],
        )
        .unwrap();
        self
    }

    pub fn salary(&self, id: i64, person_id: i64, entry_date: &str, amount: f64) -> &Self {
        let conn = Connection::open(&self.path).unwrap();
        conn.execute(
            "INSERT INTO Salary (ID, PersonID, Title, Employer, Salary, Bonus, TotalPay,
                                 EntryDate, SourceFile, LineNumber)
             VALUES (?1, ?2, 'Engineer', 'Acme', ?3, 0, ?3, ?4, 'payroll.csv', ?1)",
            params![id, person_id, amount, entry_date],
        )
        .unwrap();
        self
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.dir.path().join("ledger.db")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.dir.path().join("logs")
    }
}

// ============================================================================
// Scripted remote store
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Submit { kind: RecordKind, batch_id: String },
    Poll { job_id: String },
    Fetch { job_id: String },
}

struct FakeJob {
    kind: RecordKind,
    polls_until_done: u32,
    results: Vec<TransferResult>,
}

#[derive(Default)]
struct RemoteState {
    next_id: u32,
    jobs: HashMap<String, FakeJob>,
    /// External-id value -> creation count
    created: HashMap<String, usize>,
    person_ids: HashSet<String>,
    calls: Vec<Call>,
    expired_tokens: HashSet<String>,
    rejected_kinds: HashSet<RecordKind>,
    failing_keys: HashSet<String>,
    hold_polls: HashMap<RecordKind, u32>,
    cancel_on_submit: Option<CancellationToken>,
}

/// In-memory bulk API: applies records at submission, completes jobs after
/// a scripted number of in-progress polls
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keep every job of `kind` in progress for `polls` polls
    pub fn hold_in_progress(&self, kind: RecordKind, polls: u32) {
        self.state.lock().unwrap().hold_polls.insert(kind, polls);
    }

    /// Reject every submission of `kind` with a non-retryable error
    pub fn reject(&self, kind: RecordKind) {
        self.state.lock().unwrap().rejected_kinds.insert(kind);
    }

    pub fn accept(&self, kind: RecordKind) {
        self.state.lock().unwrap().rejected_kinds.remove(&kind);
    }

    /// Fail one record (by external-id value) inside otherwise good batches
    pub fn fail_record(&self, key: &str) {
        self.state.lock().unwrap().failing_keys.insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failing_keys.clear();
    }

    /// Cancel `token` as soon as the first job is submitted
    pub fn cancel_on_first_submit(&self, token: CancellationToken) {
        self.state.lock().unwrap().cancel_on_submit = Some(token);
    }

    pub fn expire_token(&self, token: &str) {
        self.state
            .lock()
            .unwrap()
            .expired_tokens
            .insert(token.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn submits(&self, kind: RecordKind) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Submit { kind: k, .. } if *k == kind))
            .count()
    }

    /// How many times a record with this external id was created
    pub fn creations(&self, key: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .created
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn created_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().unwrap().created.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn total_creations(&self) -> usize {
        self.state.lock().unwrap().created.values().sum()
    }

    fn authorize(state: &RemoteState, credential: &Credential) -> Result<()> {
        if state.expired_tokens.contains(&credential.access_token) {
            return Err(SyncError::AuthExpired("INVALID_SESSION_ID".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BulkTransfer for FakeRemote {
    async fn submit(&self, credential: &Credential, batch: &TransferBatch) -> Result<JobHandle> {
        let mut state = self.state.lock().unwrap();
        Self::authorize(&state, credential)?;
        state.calls.push(Call::Submit {
            kind: batch.kind,
            batch_id: batch.id.clone(),
        });
        if let Some(token) = state.cancel_on_submit.take() {
            token.cancel();
        }
        if state.rejected_kinds.contains(&batch.kind) {
            return Err(SyncError::Rejected("create job returned 400 Bad Request".into()));
        }

        state.next_id += 1;
        let job_id = format!("750{:05}", state.next_id);

        let mut results = Vec::new();
        for (position, record) in batch.records.iter().enumerate() {
            let key = record.key().to_string();
            let dangling = match record {
                OutboundRecord::Salary(payload) => {
                    !state.person_ids.contains(&payload.person_remote_id)
                }
                OutboundRecord::Person(_) => false,
            };
            let outcome = if state.failing_keys.contains(&key) {
                RecordOutcome::failed("FIELD_CUSTOM_VALIDATION_EXCEPTION", "rejected by rule")
            } else if dangling {
                RecordOutcome::failed("INVALID_CROSS_REFERENCE_KEY", "no such account")
            } else {
                state.next_id += 1;
                let remote_id = match record.kind() {
                    RecordKind::Person => format!("001{:05}", state.next_id),
                    RecordKind::Salary => format!("a0B{:05}", state.next_id),
                };
                if record.kind() == RecordKind::Person {
                    state.person_ids.insert(remote_id.clone());
                }
                *state.created.entry(key.clone()).or_default() += 1;
                RecordOutcome::Succeeded { remote_id }
            };
            results.push(TransferResult {
                position,
                key,
                outcome,
            });
        }

        let polls_until_done = state.hold_polls.get(&batch.kind).copied().unwrap_or(0);
        state.jobs.insert(
            job_id.clone(),
            FakeJob {
                kind: batch.kind,
                polls_until_done,
                results,
            },
        );

        Ok(JobHandle {
            job_id,
            batch_id: batch.id.clone(),
            kind: batch.kind,
            record_keys: batch.record_keys(),
        })
    }

    async fn poll(&self, credential: &Credential, handle: &JobHandle) -> Result<JobStatus> {
        let mut state = self.state.lock().unwrap();
        Self::authorize(&state, credential)?;
        state.calls.push(Call::Poll {
            job_id: handle.job_id.clone(),
        });
        let job = state
            .jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| SyncError::Rejected(format!("job {} not found", handle.job_id)))?;
        if job.polls_until_done > 0 {
            job.polls_until_done -= 1;
            return Ok(JobStatus::InProgress);
        }
        Ok(JobStatus::Completed)
    }

    async fn fetch_results(
        &self,
        credential: &Credential,
        handle: &JobHandle,
    ) -> Result<Vec<TransferResult>> {
        let mut state = self.state.lock().unwrap();
        Self::authorize(&state, credential)?;
        state.calls.push(Call::Fetch {
            job_id: handle.job_id.clone(),
        });
        state
            .jobs
            .get(&handle.job_id)
            .map(|job| job.results.clone())
            .ok_or_else(|| SyncError::Rejected(format!("job {} not found", handle.job_id)))
    }
}

impl FakeRemote {
    /// Kind of the job a call refers to
    pub fn kind_of(&self, call: &Call) -> Option<RecordKind> {
        let state = self.state.lock().unwrap();
        match call {
            Call::Submit { kind, .. } => Some(*kind),
            Call::Poll { job_id } | Call::Fetch { job_id } => {
                state.jobs.get(job_id).map(|job| job.kind)
            }
        }
    }
}

// ============================================================================
// Ledger and credentials
// ============================================================================

/// Ledger whose reconcile writes can be made to fail
pub struct FlakyLedger {
    inner: SqliteLedger,
    fail_reconcile: AtomicBool,
}

impl FlakyLedger {
    pub fn open(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteLedger::open(path).unwrap(),
            fail_reconcile: AtomicBool::new(false),
        })
    }

    pub fn fail_reconcile(&self, fail: bool) {
        self.fail_reconcile.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultLedger for FlakyLedger {
    async fn record_submission(&self, run_id: &str, handle: &JobHandle) -> Result<()> {
        self.inner.record_submission(run_id, handle).await
    }

    async fn reconcile_batch(&self, run_id: &str, batch: &BatchReconciliation) -> Result<()> {
        if self.fail_reconcile.load(Ordering::SeqCst) {
            return Err(SyncError::ledger("disk I/O error"));
        }
        self.inner.reconcile_batch(run_id, batch).await
    }

    async fn replay(&self) -> Result<LedgerState> {
        self.inner.replay().await
    }

    async fn verify_integrity(&self) -> Result<IntegrityReport> {
        self.inner.verify_integrity().await
    }
}

pub struct StaticRefresher(pub &'static str);

#[async_trait]
impl CredentialRefresher for StaticRefresher {
    async fn refresh(&self, expired: &Credential) -> Option<Credential> {
        Some(Credential::new(expired.instance_url.clone(), self.0))
    }
}

pub fn credential(token: &str) -> Credential {
    Credential::new("https://acme.my.salesforce.com", token)
}

/// Small batches and a generous poll budget
pub fn test_config(batch_size: usize) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.batch.max_records = batch_size;
    config.source.page_size = 2;
    config.poll = PollPolicy {
        timeout_secs: 24 * 60 * 60,
        ..PollPolicy::default()
    };
    config
}

pub fn pipeline(
    config: SyncConfig,
    remote: &Arc<FakeRemote>,
    ledger: Arc<dyn ResultLedger>,
    token: &str,
    snapshot: &Snapshot,
) -> Pipeline {
    Pipeline::new(config, remote.clone(), ledger, credential(token))
        .with_clock(Arc::new(VirtualClock::new()))
        .with_report_dir(snapshot.report_dir())
}
