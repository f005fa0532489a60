//! CLI command implementations
//!
//! Each subcommand has its own module.

pub mod ledger;
pub mod run;

use salsync_engine::SyncConfig;
use std::path::Path;

use crate::error::{CliError, Result};

/// Defaults, then the config file, then `SALSYNC_*` environment variables
pub fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    SyncConfig::load(path).map_err(CliError::from)
}
