//! salsync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, logging, and error handling for the salsync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the [`SyncError`] taxonomy shared by the engine and CLI
//! - **Types**: person/salary records, natural keys, transfer results
//! - **Logging**: `tracing` subscriber initialisation for console and per-run log files
//!
//! # Example
//!
//! ```no_run
//! use salsync_common::types::NaturalKey;
//!
//! let key = NaturalKey::new("  Ada ", "LOVELACE", Some("Engineering"), None);
//! assert_eq!(key.as_str(), "lovelace|ada|engineering|");
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SyncError};
