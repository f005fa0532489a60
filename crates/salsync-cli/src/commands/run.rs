//! `salsync run` command implementation
//!
//! Wires configuration, credentials and Ctrl-C handling around one
//! [`Pipeline`] run, then prints the summary.

use colored::Colorize;
use salsync_engine::config::SyncConfig;
use salsync_engine::ledger::SqliteLedger;
use salsync_engine::pipeline::DEFAULT_REPORT_DIR;
use salsync_engine::report::{KindCounts, SyncSummary};
use salsync_engine::source::SqliteSource;
use salsync_engine::transfer::{BulkApiClient, Credential};
use salsync_engine::Pipeline;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::load_config;
use crate::error::{CliError, Result};
use crate::progress;
use crate::{RunArgs, EXIT_PARTIAL};

/// Execute a sync run; returns the process exit code
pub async fn run(config_path: Option<&Path>, args: &RunArgs) -> Result<i32> {
    let config = apply_flags(load_config(config_path)?, args);
    config.validate()?;

    let source_path = config.source.path.clone().ok_or_else(|| {
        CliError::config("no source snapshot given; pass --source or set SALSYNC_SOURCE")
    })?;
    let credential = resolve_credential(args)?;

    let source = SqliteSource::open(&source_path)?.with_person_limit(config.source.person_limit);
    let ledger = Arc::new(SqliteLedger::open(&config.ledger.path)?);
    let transfer = Arc::new(BulkApiClient::new(&config.remote)?);
    let report_dir = args
        .report_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_DIR));

    info!(
        source = %source_path.display(),
        ledger = %config.ledger.path.display(),
        instance = %credential.instance_url,
        "Starting salsync"
    );

    let pipeline = Pipeline::new(config, transfer, ledger, credential).with_report_dir(report_dir);

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(cancel.clone()));

    let spinner = if io::stderr().is_terminal() {
        progress::create_spinner(&format!("Syncing (run {})", pipeline.run_id()))
    } else {
        progress::hidden()
    };
    let summary = pipeline.run(&source, &cancel).await;
    spinner.finish_and_clear();
    watcher.abort();

    print_summary(&summary);
    Ok(exit_code(&summary))
}

/// Command-line flags win over file and environment settings
pub fn apply_flags(mut config: SyncConfig, args: &RunArgs) -> SyncConfig {
    if let Some(ref source) = args.source {
        config.source.path = Some(source.clone());
    }
    if let Some(ref ledger) = args.ledger {
        config.ledger.path = ledger.clone();
    }
    if args.limit.is_some() {
        config.source.person_limit = args.limit;
    }
    if let Some(size) = args.batch_size {
        config.batch.max_records = size;
    }
    if let Some(n) = args.max_in_flight {
        config.concurrency.max_in_flight = n;
    }
    if let Some(ref id) = args.person_record_type_id {
        config.remote.person_record_type_id = Some(id.clone());
    }
    config
}

/// 0 clean, 2 when anything failed, was blocked or was interrupted, 1 on a fatal error
pub fn exit_code(summary: &SyncSummary) -> i32 {
    if summary.fatal.is_some() {
        crate::EXIT_FATAL
    } else if summary.has_failures() || summary.interrupted {
        EXIT_PARTIAL
    } else {
        0
    }
}

fn resolve_credential(args: &RunArgs) -> Result<Credential> {
    let instance_url = args
        .instance_url
        .clone()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| {
            CliError::config("no instance URL; pass --instance-url or set SALSYNC_INSTANCE_URL")
        })?;

    let token = match args.access_token.clone().filter(|t| !t.trim().is_empty()) {
        Some(token) => token,
        None if io::stdin().is_terminal() => prompt_token()?,
        None => {
            return Err(CliError::config(
                "no access token; pass --access-token or set SALSYNC_ACCESS_TOKEN",
            ))
        }
    };

    Ok(Credential::new(instance_url, token))
}

fn prompt_token() -> Result<String> {
    inquire::Password::new("Access token:")
        .without_confirmation()
        .with_display_mode(inquire::PasswordDisplayMode::Hidden)
        .prompt()
        .map_err(|e| CliError::prompt(e.to_string()))
}

async fn cancel_on_signal(cancel: CancellationToken) {
    if let Err(e) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        return;
    }
    eprintln!(
        "{} Interrupted, waiting for open jobs to finish...",
        "→".yellow()
    );
    info!("Received Ctrl+C, draining in-flight jobs");
    cancel.cancel();
}

fn print_summary(summary: &SyncSummary) {
    let elapsed = summary
        .finished_at
        .and_then(|end| (end - summary.started_at).to_std().ok())
        .map(progress::format_duration)
        .unwrap_or_default();

    println!();
    if let Some(ref fatal) = summary.fatal {
        println!("{} Sync aborted: {}", "✗".red().bold(), fatal.message);
    } else if summary.interrupted {
        println!("{} Sync interrupted after {}", "→".yellow(), elapsed);
    } else if summary.has_failures() {
        println!("{} Sync finished with failures in {}", "!".yellow().bold(), elapsed);
    } else {
        println!("{} Sync finished in {}", "✓".green().bold(), elapsed);
    }
    println!("  {} {}", "Run:".cyan(), summary.run_id);

    print_counts("People", &summary.people);
    print_counts("Salaries", &summary.salaries);

    if summary.recovered_batches > 0 {
        println!(
            "  {} {}",
            "Recovered jobs:".cyan(),
            summary.recovered_batches
        );
    }
    if summary.failed_batches > 0 {
        println!("  {} {}", "Failed jobs:".red(), summary.failed_batches);
    }
    if let Some(ref report) = summary.error_report {
        println!("  {} {}", "Error report:".cyan(), report.display());
    }
}

fn print_counts(label: &str, counts: &KindCounts) {
    println!(
        "  {} read {}, created {}, skipped {}, failed {}",
        format!("{}:", label).bold(),
        counts.read,
        counts.created.to_string().green(),
        counts.skipped,
        counts.unsuccessful().to_string().red()
    );
    let details: Vec<String> = [
        ("duplicates", counts.duplicates),
        ("malformed", counts.malformed),
        ("blocked", counts.blocked_by_dependency),
        ("oversized", counts.oversized),
    ]
    .into_iter()
    .filter(|(_, n)| *n > 0)
    .map(|(name, n)| format!("{} {}", name, n))
    .collect();
    if !details.is_empty() {
        println!("    {}", details.join(", ").dimmed());
    }
}
