//! salsync CLI - Main entry point

use clap::Parser;
use salsync_cli::{Cli, Commands, EXIT_FATAL};
use salsync_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // Pick up SALSYNC_* settings from a local .env before anything reads them
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Verbose: debug to the console as well; otherwise only warnings on the
    // console and the full run log in a file
    let log_config = if cli.verbose {
        LogConfig::builder()
            .level(LogLevel::Debug)
            .output(LogOutput::Both)
            .log_file_prefix("salsync")
            .build()
    } else {
        LogConfig::builder()
            .level(LogLevel::Info)
            .output(LogOutput::File)
            .log_file_prefix("salsync")
            .build()
    };

    // Environment variables take precedence
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);

    // The CLI works without logging; a failure here is not fatal
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        }
    };

    let code = match execute_command(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            EXIT_FATAL
        }
    };

    let run_log = guard.as_ref().and_then(|g| g.log_file());
    if let (Commands::Run(_), Some(path)) = (&cli.command, run_log) {
        println!("  Run log: {}", path.display());
    }

    if code != 0 {
        // Flush the run log before exiting
        drop(guard);
        process::exit(code);
    }
}

/// Execute the CLI command; returns the process exit code
async fn execute_command(cli: &Cli) -> salsync_cli::Result<i32> {
    let config = cli.config.as_deref();

    match &cli.command {
        Commands::Run(args) => salsync_cli::commands::run::run(config, args).await,
        Commands::Ledger { command } => {
            salsync_cli::commands::ledger::run(config, command).await?;
            Ok(0)
        }
    }
}
