//! salsync CLI Library
//!
//! Command-line front end for the salary sync pipeline.
//!
//! - **Sync**: push people and salary history to the CRM (`salsync run`)
//! - **Ledger**: inspect and verify the checkpoint ledger (`salsync ledger status/verify`)

pub mod commands;
pub mod error;
pub mod progress;

pub use error::{CliError, Result};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Process exit code for a run that finished with failed or blocked records
pub const EXIT_PARTIAL: i32 = 2;

/// Process exit code for a fatal error
pub const EXIT_FATAL: i32 = 1;

/// salsync - salary history sync to a CRM bulk API
#[derive(Parser, Debug)]
#[command(name = "salsync")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration file
    #[arg(short, long, env = "SALSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sync people and salaries from a snapshot to the CRM
    Run(RunArgs),

    /// Inspect the checkpoint ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// SQLite snapshot to read from
    #[arg(short, long)]
    pub source: Option<PathBuf>,

    /// Ledger database
    #[arg(short, long)]
    pub ledger: Option<PathBuf>,

    /// CRM instance URL
    #[arg(long, env = "SALSYNC_INSTANCE_URL")]
    pub instance_url: Option<String>,

    /// Access token; prompted for when omitted on a terminal
    #[arg(long, env = "SALSYNC_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Sync only the first N people (and their salaries)
    #[arg(long)]
    pub limit: Option<usize>,

    /// Maximum records per bulk job
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Maximum concurrently open bulk jobs
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// Record type id of the org's active Person Account record type.
    /// Required when the org has more than one Account record type; without
    /// it person accounts are created with the org default.
    #[arg(long, env = "SALSYNC_PERSON_RECORD_TYPE_ID")]
    pub person_record_type_id: Option<String>,

    /// Directory for the error report
    #[arg(long)]
    pub report_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum LedgerCommand {
    /// Show replayed counts and unreconciled jobs
    Status {
        /// Ledger database
        #[arg(short, long)]
        ledger: Option<PathBuf>,
    },

    /// Verify the ledger hash chain
    Verify {
        /// Ledger database
        #[arg(short, long)]
        ledger: Option<PathBuf>,
    },
}
