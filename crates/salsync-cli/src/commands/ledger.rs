//! `salsync ledger` command implementation
//!
//! Read-only views of the checkpoint ledger.

use colored::Colorize;
use salsync_engine::ledger::{ResultLedger, SqliteLedger};
use std::path::{Path, PathBuf};

use super::load_config;
use crate::error::{CliError, Result};
use crate::LedgerCommand;

/// Execute ledger command
pub async fn run(config_path: Option<&Path>, command: &LedgerCommand) -> Result<()> {
    match command {
        LedgerCommand::Status { ledger } => {
            status(&resolve_path(config_path, ledger.as_deref())?).await
        }
        LedgerCommand::Verify { ledger } => {
            verify(&resolve_path(config_path, ledger.as_deref())?).await
        }
    }
}

fn resolve_path(config_path: Option<&Path>, flag: Option<&Path>) -> Result<PathBuf> {
    let path = match flag {
        Some(path) => path.to_path_buf(),
        None => load_config(config_path)?.ledger.path,
    };
    if !path.is_file() {
        return Err(CliError::LedgerNotFound(path.display().to_string()));
    }
    Ok(path)
}

async fn status(path: &Path) -> Result<()> {
    let ledger = SqliteLedger::open(path)?;
    let state = ledger.replay().await?;
    let counts = &state.counts;

    println!("{} Ledger {}", "→".cyan(), path.display().to_string().bold());
    println!("  {} {}", "Entries:".cyan(), counts.entries);
    println!("  {} {}", "Jobs submitted:".cyan(), counts.jobs_submitted);
    println!(
        "  {} {} completed, {} failed",
        "Batches:".cyan(),
        counts.batches_completed,
        counts.batches_failed
    );
    println!(
        "  {} {} people, {} salaries",
        "Confirmed:".cyan(),
        state.identities.len(),
        state.succeeded_salaries.len()
    );
    println!("  {} {}", "Failed records:".cyan(), counts.records_failed);

    if state.orphans.is_empty() {
        println!("  {} none", "Open jobs:".cyan());
    } else {
        println!(
            "  {} {} (recovered on the next run)",
            "Open jobs:".yellow(),
            state.orphans.len()
        );
        for handle in &state.orphans {
            println!(
                "    {} {} {} ({} records)",
                handle.job_id.bold(),
                handle.kind,
                handle.batch_id.dimmed(),
                handle.record_keys.len()
            );
        }
    }

    Ok(())
}

async fn verify(path: &Path) -> Result<()> {
    println!("{} Verifying ledger integrity...", "→".cyan());

    let ledger = SqliteLedger::open(path)?;
    let report = ledger.verify_integrity().await?;

    match report.broken_at {
        None => {
            println!("{} Ledger verified successfully", "✓".green().bold());
            println!("  {} {} entries, hash chain intact", "→".cyan(), report.entries);
            Ok(())
        }
        Some(at) => {
            println!("{} Ledger verification FAILED", "✗".red().bold());
            println!("  {} Hash chain breaks at entry #{}", "→".yellow(), at);
            Err(CliError::LedgerBroken { at })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_ledger_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.db");
        let err = resolve_path(None, Some(&missing)).unwrap_err();
        assert!(matches!(err, CliError::LedgerNotFound(_)));
    }

    #[tokio::test]
    async fn test_verify_fresh_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        SqliteLedger::open(&path).unwrap();

        verify(&path).await.unwrap();
        status(&path).await.unwrap();
    }
}
