//! Checkpoint & result ledger
//!
//! An append-only, hash-chained log of job submissions and per-record
//! outcomes. Replaying it on start-up yields the confirmed identities, the
//! salary keys already created, and any job that was submitted but never
//! reconciled.

pub mod schema;
pub mod store;
pub mod types;

pub use store::{ResultLedger, SqliteLedger};
pub use types::{
    BatchReconciliation, BatchStatus, EntryKind, IntegrityReport, LedgerCounts, LedgerEntry,
    LedgerState,
};
