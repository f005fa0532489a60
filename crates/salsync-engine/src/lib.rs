//! salsync Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch synchronization of person and salary rows from a SQLite snapshot
//! into a remote CRM bulk-ingest API.
//!
//! # Architecture
//!
//! ```text
//! source ──► resolver ──► batcher ──► dispatch ──► transfer (bulk jobs)
//!                ▲                       │
//!                └──────── ledger ◄──────┘
//! ```
//!
//! - [`source`]: lazy, restartable cursors over the `Person` and `Salary` tables
//! - [`resolver`]: natural-key deduplication and confirmed remote identities
//! - [`batcher`]: size- and count-bounded homogeneous batches
//! - [`transfer`]: the [`transfer::BulkTransfer`] seam and its HTTP client
//! - [`job`]: per-job state machine (submit, poll, fetch)
//! - [`ledger`]: append-only, hash-chained checkpoint log
//! - [`dispatch`]: bounded pool of in-flight jobs, sole ledger writer
//! - [`pipeline`]: the end-to-end run and its [`report::SyncSummary`]

pub mod batcher;
pub mod config;
pub mod dispatch;
pub mod job;
pub mod ledger;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod source;
pub mod transfer;

pub use config::SyncConfig;
pub use pipeline::Pipeline;
pub use report::SyncSummary;
