//! Result ledger trait and SQLite implementation

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use salsync_common::types::{NaturalKey, RecordKind, SalaryKey};
use salsync_common::{Result, SyncError};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::schema;
use super::types::{
    BatchReconciliation, BatchStatus, EntryKind, IntegrityReport, LedgerEntry, LedgerState,
};
use crate::transfer::JobHandle;

/// Durable record of submissions and outcomes (dependency injection seam)
#[async_trait]
pub trait ResultLedger: Send + Sync {
    /// Record that a batch became a remote job
    ///
    /// Must be durable before the job is polled.
    async fn record_submission(&self, run_id: &str, handle: &JobHandle) -> Result<()>;

    /// Write every record outcome of a batch plus its `batch_reconciled`
    /// marker in one transaction
    async fn reconcile_batch(&self, run_id: &str, batch: &BatchReconciliation) -> Result<()>;

    /// Rebuild identities, succeeded salaries and orphaned jobs
    async fn replay(&self) -> Result<LedgerState>;

    /// Walk the hash chain
    async fn verify_integrity(&self) -> Result<IntegrityReport>;
}

/// SQLite-backed ledger
pub struct SqliteLedger {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteLedger {
    /// Open (or create) the ledger file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| SyncError::ledger(format!("Failed to open ledger database: {}", e)))?;

        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| SyncError::ledger(format!("Failed to enable WAL: {}", e)))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| SyncError::ledger(format!("Failed to set synchronous mode: {}", e)))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened ledger");

        schema::init_schema(&conn)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory ledger, lost on drop
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            SyncError::ledger(format!("Failed to create in-memory database: {}", e))
        })?;

        schema::init_schema(&conn)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| SyncError::ledger(format!("Failed to acquire ledger lock: {}", e)))
    }

    fn last_entry_hash(conn: &Connection) -> Result<Option<String>> {
        conn.query_row(
            "SELECT entry_hash FROM ledger_entries ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(|e| SyncError::ledger(format!("Failed to read last entry hash: {}", e)))
    }

    /// Chain, hash and insert one entry; returns its hash
    fn append(
        tx: &Transaction<'_>,
        mut entry: LedgerEntry,
        previous: Option<String>,
    ) -> Result<String> {
        entry.previous_hash = previous;
        let entry_hash = entry.compute_hash();

        tx.execute(
            r#"
            INSERT INTO ledger_entries (
                recorded_at, entry_kind, run_id, batch_id, record_kind,
                record_key, job_id, status, remote_id, details,
                previous_hash, entry_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                entry.recorded_at_text(),
                entry.entry_kind.as_str(),
                entry.run_id,
                entry.batch_id,
                entry.record_kind.as_str(),
                entry.record_key,
                entry.job_id,
                entry.status,
                entry.remote_id,
                entry.details.to_string(),
                entry.previous_hash,
                entry_hash,
            ],
        )
        .map_err(|e| SyncError::ledger(format!("Failed to insert ledger entry: {}", e)))?;

        Ok(entry_hash)
    }

    fn write_all(&self, entries: Vec<LedgerEntry>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| SyncError::ledger(format!("Failed to begin transaction: {}", e)))?;

        let mut previous = Self::last_entry_hash(&tx)?;
        for entry in entries {
            previous = Some(Self::append(&tx, entry, previous)?);
        }

        tx.commit()
            .map_err(|e| SyncError::ledger(format!("Failed to commit ledger entries: {}", e)))
    }

    fn load_entries(conn: &Connection) -> Result<Vec<StoredRow>> {
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, recorded_at, entry_kind, run_id, batch_id, record_kind,
                       record_key, job_id, status, remote_id, details,
                       previous_hash, entry_hash
                FROM ledger_entries
                ORDER BY id ASC
                "#,
            )
            .map_err(|e| SyncError::LedgerCorrupt(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(StoredRow {
                    id: row.get(0)?,
                    recorded_at: row.get(1)?,
                    entry_kind: row.get(2)?,
                    run_id: row.get(3)?,
                    batch_id: row.get(4)?,
                    record_kind: row.get(5)?,
                    record_key: row.get(6)?,
                    job_id: row.get(7)?,
                    status: row.get(8)?,
                    remote_id: row.get(9)?,
                    details: row.get(10)?,
                    previous_hash: row.get(11)?,
                    entry_hash: row.get(12)?,
                })
            })
            .map_err(|e| SyncError::LedgerCorrupt(format!("Failed to query entries: {}", e)))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SyncError::LedgerCorrupt(format!("Failed to read entries: {}", e)))
    }
}

/// Raw column values, parsed after the statement is done
struct StoredRow {
    id: i64,
    recorded_at: String,
    entry_kind: String,
    run_id: String,
    batch_id: String,
    record_kind: String,
    record_key: Option<String>,
    job_id: Option<String>,
    status: Option<String>,
    remote_id: Option<String>,
    details: String,
    previous_hash: Option<String>,
    entry_hash: String,
}

impl StoredRow {
    fn into_entry(self) -> Result<LedgerEntry> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            SyncError::LedgerCorrupt(format!("entry {}: bad {}: {}", self.id, what, e))
        };

        let recorded_at = chrono::DateTime::parse_from_rfc3339(&self.recorded_at)
            .map_err(|e| corrupt("recorded_at", &e))?
            .with_timezone(&chrono::Utc);
        let details = serde_json::from_str(&self.details).map_err(|e| corrupt("details", &e))?;

        Ok(LedgerEntry {
            id: Some(self.id),
            recorded_at,
            entry_kind: self.entry_kind.parse()?,
            record_kind: self.record_kind.parse()?,
            run_id: self.run_id,
            batch_id: self.batch_id,
            record_key: self.record_key,
            job_id: self.job_id,
            status: self.status,
            remote_id: self.remote_id,
            details,
            previous_hash: self.previous_hash,
            entry_hash: Some(self.entry_hash),
        })
    }
}

#[async_trait]
impl ResultLedger for SqliteLedger {
    async fn record_submission(&self, run_id: &str, handle: &JobHandle) -> Result<()> {
        self.write_all(vec![LedgerEntry::job_submitted(run_id, handle)])?;
        debug!(batch_id = %handle.batch_id, job_id = %handle.job_id, "Recorded job submission");
        Ok(())
    }

    async fn reconcile_batch(&self, run_id: &str, batch: &BatchReconciliation) -> Result<()> {
        let mut entries: Vec<LedgerEntry> = batch
            .results
            .iter()
            .map(|result| LedgerEntry::record_outcome(run_id, batch, result))
            .collect();
        entries.push(LedgerEntry::batch_reconciled(run_id, batch));

        self.write_all(entries)?;
        debug!(
            batch_id = %batch.batch_id,
            status = batch.status.as_str(),
            records = batch.results.len(),
            "Reconciled batch"
        );
        Ok(())
    }

    async fn replay(&self) -> Result<LedgerState> {
        let rows = {
            let conn = self.lock()?;
            Self::load_entries(&conn)?
        };

        let mut state = LedgerState::default();
        // batch_id -> (submission order, handle)
        let mut open_jobs: HashMap<String, (usize, JobHandle)> = HashMap::new();

        for (order, row) in rows.into_iter().enumerate() {
            let entry = row.into_entry()?;
            state.counts.entries += 1;

            match entry.entry_kind {
                EntryKind::JobSubmitted => {
                    state.counts.jobs_submitted += 1;
                    let job_id = entry.job_id.clone().ok_or_else(|| {
                        SyncError::LedgerCorrupt(format!(
                            "job_submitted entry for batch {} has no job id",
                            entry.batch_id
                        ))
                    })?;
                    let handle = JobHandle {
                        job_id,
                        batch_id: entry.batch_id.clone(),
                        kind: entry.record_kind,
                        record_keys: entry.submitted_keys(),
                    };
                    open_jobs.insert(entry.batch_id, (order, handle));
                }
                EntryKind::RecordOutcome => {
                    let Some(key) = entry.record_key else {
                        return Err(SyncError::LedgerCorrupt(format!(
                            "record_outcome entry in batch {} has no record key",
                            entry.batch_id
                        )));
                    };
                    match (entry.status.as_deref(), entry.remote_id) {
                        (Some("succeeded"), Some(remote_id)) => match entry.record_kind {
                            RecordKind::Person => {
                                state.counts.people_succeeded += 1;
                                match state.identities.entry(NaturalKey::from_stored(key)) {
                                    Entry::Occupied(existing) => {
                                        if *existing.get() != remote_id {
                                            warn!(
                                                natural_key = %existing.key(),
                                                kept = %existing.get(),
                                                ignored = %remote_id,
                                                "Conflicting identities in ledger, keeping the first"
                                            );
                                        }
                                    }
                                    Entry::Vacant(slot) => {
                                        slot.insert(remote_id);
                                    }
                                }
                            }
                            RecordKind::Salary => {
                                state.counts.salaries_succeeded += 1;
                                state.succeeded_salaries.insert(SalaryKey::from_stored(key));
                            }
                        },
                        (Some("failed"), _) => state.counts.records_failed += 1,
                        (status, _) => {
                            return Err(SyncError::LedgerCorrupt(format!(
                                "record_outcome for {} has unexpected status {:?}",
                                key, status
                            )))
                        }
                    }
                }
                EntryKind::BatchReconciled => {
                    open_jobs.remove(&entry.batch_id);
                    match entry.status.as_deref() {
                        Some(s) if s == BatchStatus::Completed.as_str() => {
                            state.counts.batches_completed += 1
                        }
                        _ => state.counts.batches_failed += 1,
                    }
                }
            }
        }

        let mut orphans: Vec<(usize, JobHandle)> = open_jobs.into_values().collect();
        orphans.sort_by_key(|(order, _)| *order);
        state.orphans = orphans.into_iter().map(|(_, handle)| handle).collect();

        Ok(state)
    }

    async fn verify_integrity(&self) -> Result<IntegrityReport> {
        let rows = {
            let conn = self.lock()?;
            Self::load_entries(&conn)?
        };

        let mut report = IntegrityReport {
            entries: rows.len(),
            broken_at: None,
        };
        let mut expected_previous: Option<String> = None;

        for row in rows {
            let id = row.id;
            let entry = match row.into_entry() {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(entry_id = id, error = %e, "Unreadable ledger entry");
                    report.broken_at = Some(id);
                    break;
                }
            };

            if entry.previous_hash != expected_previous
                || entry.entry_hash.as_deref() != Some(entry.compute_hash().as_str())
            {
                warn!(entry_id = id, "Ledger hash chain broken");
                report.broken_at = Some(id);
                break;
            }
            expected_previous = entry.entry_hash;
        }

        Ok(report)
    }
}
