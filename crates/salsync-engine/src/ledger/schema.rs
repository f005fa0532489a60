//! SQLite schema for the result ledger

use rusqlite::Connection;
use salsync_common::{Result, SyncError};

/// Bumped when `ledger_entries` changes shape
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize ledger database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            recorded_at TEXT NOT NULL,
            entry_kind TEXT NOT NULL,       -- job_submitted | record_outcome | batch_reconciled
            run_id TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            record_kind TEXT NOT NULL,      -- person | salary

            record_key TEXT,
            job_id TEXT,
            status TEXT,                    -- succeeded | failed | completed | failed_permanent
            remote_id TEXT,
            details TEXT NOT NULL,          -- JSON

            -- Tamper detection
            previous_hash TEXT,
            entry_hash TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_entries_batch
            ON ledger_entries(batch_id);

        CREATE INDEX IF NOT EXISTS idx_ledger_entries_kind
            ON ledger_entries(entry_kind, record_kind);
        "#,
    )
    .map_err(|e| SyncError::ledger(format!("Failed to create ledger schema: {}", e)))?;

    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| SyncError::ledger(format!("Failed to read schema version: {}", e)))?;

    match version {
        0 => conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| SyncError::ledger(format!("Failed to set schema version: {}", e))),
        SCHEMA_VERSION => Ok(()),
        other => Err(SyncError::LedgerCorrupt(format!(
            "ledger schema version {} is not supported (expected {})",
            other, SCHEMA_VERSION
        ))),
    }
}
