//! Run logging
//!
//! Centralised `tracing` setup for the salsync binaries:
//!
//! - Output to console, a per-run log file, or both
//! - Text or JSON formatting
//! - Level and per-module filter directives
//! - Environment overrides (`SALSYNC_LOG_*`)
//!
//! Library code logs through `tracing` macros with structured fields and never
//! prints directly:
//!
//! ```rust
//! use tracing::{info, warn};
//!
//! let batch_id = "person-1a2b-0001";
//! info!(batch_id, records = 200, "Submitting batch");
//! warn!(batch_id, attempt = 2, "Submission failed, retrying");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use salsync_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     // Keep the guard alive until exit so buffered file output is flushed
//!     let _guard = init_logging(&config)?;
//!     info!("salsync started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Parse a case-insensitive keyword against an alias table
fn parse_keyword<T: Copy>(what: &str, value: &str, table: &[(&str, T)]) -> Result<T> {
    let wanted = value.trim().to_ascii_lowercase();
    table
        .iter()
        .find(|(name, _)| *name == wanted)
        .map(|(_, v)| *v)
        .ok_or_else(|| {
            let names: Vec<&str> = table.iter().map(|(name, _)| *name).collect();
            anyhow::anyhow!(
                "Invalid log {} '{}', expected one of: {}",
                what,
                value,
                names.join(", ")
            )
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const NAMES: &'static [(&'static str, LogLevel)] = &[
        ("trace", LogLevel::Trace),
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("warning", LogLevel::Warn),
        ("error", LogLevel::Error),
    ];

    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_keyword("level", s, Self::NAMES)
    }
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// stderr only
    #[default]
    Console,
    /// The per-run log file only
    File,
    Both,
}

impl LogOutput {
    const NAMES: &'static [(&'static str, LogOutput)] = &[
        ("console", LogOutput::Console),
        ("stderr", LogOutput::Console),
        ("file", LogOutput::File),
        ("both", LogOutput::Both),
    ];

    fn includes_console(self) -> bool {
        self != LogOutput::File
    }

    fn includes_file(self) -> bool {
        self != LogOutput::Console
    }
}

impl std::str::FromStr for LogOutput {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_keyword("output", s, Self::NAMES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event, for log shippers
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_keyword("format", s, &[("text", LogFormat::Text), ("json", LogFormat::Json)])
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,

    /// Directory for run log files and error reports
    pub log_dir: PathBuf,

    /// Log file name prefix ("salsync" -> "salsync-20250101_120000.log")
    pub log_file_prefix: String,

    /// Additional filter directives (e.g. "reqwest=warn,salsync_engine=debug")
    pub filter_directives: Option<String>,

    pub include_location: bool,
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "salsync".to_string(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    /// Defaults overlaid with `SALSYNC_LOG_*` variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Overlay `SALSYNC_LOG_*` variables:
    ///
    /// | variable | values |
    /// |---|---|
    /// | `SALSYNC_LOG_LEVEL` | trace, debug, info, warn, error |
    /// | `SALSYNC_LOG_OUTPUT` | console, file, both |
    /// | `SALSYNC_LOG_FORMAT` | text, json |
    /// | `SALSYNC_LOG_DIR` | directory for run logs and error reports |
    /// | `SALSYNC_LOG_FILE_PREFIX` | run log file name prefix |
    /// | `SALSYNC_LOG_FILTER` | extra `EnvFilter` directives |
    pub fn with_env_overrides(mut self) -> Result<Self> {
        let var = |name: &str| std::env::var(format!("SALSYNC_LOG_{}", name)).ok();

        if let Some(level) = var("LEVEL") {
            self.level = level.parse()?;
        }
        if let Some(output) = var("OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = var("FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = var("DIR") {
            self.log_dir = dir.into();
        }
        if let Some(prefix) = var("FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        self.filter_directives = var("FILTER").or(self.filter_directives);

        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Path of the run log file for a run started at `started`
    pub fn run_log_path(&self, started: DateTime<Local>) -> PathBuf {
        self.log_dir.join(format!(
            "{}-{}.log",
            self.log_file_prefix,
            run_stamp(started)
        ))
    }
}

/// Fluent construction of a [`LogConfig`] on top of the defaults
#[derive(Default)]
pub struct LogConfigBuilder(LogConfig);

impl LogConfigBuilder {
    pub fn level(self, level: LogLevel) -> Self {
        Self(LogConfig { level, ..self.0 })
    }

    pub fn output(self, output: LogOutput) -> Self {
        Self(LogConfig { output, ..self.0 })
    }

    pub fn format(self, format: LogFormat) -> Self {
        Self(LogConfig { format, ..self.0 })
    }

    pub fn log_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self(LogConfig {
            log_dir: dir.into(),
            ..self.0
        })
    }

    pub fn log_file_prefix(self, prefix: impl Into<String>) -> Self {
        Self(LogConfig {
            log_file_prefix: prefix.into(),
            ..self.0
        })
    }

    pub fn filter_directives(self, filter: impl Into<String>) -> Self {
        Self(LogConfig {
            filter_directives: Some(filter.into()),
            ..self.0
        })
    }

    pub fn build(self) -> LogConfig {
        self.0
    }
}

/// Timestamp fragment used in run log and error report file names
pub fn run_stamp(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Keeps the non-blocking file writer alive; drop it last to flush the log
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
    log_file: Option<PathBuf>,
}

impl LogGuard {
    /// The run log file, when file output is enabled
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

/// Install the global subscriber described by `config`
///
/// Call once at startup and hold the returned guard for the lifetime of the
/// program.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let mut filter =
        EnvFilter::from_default_env().add_directive(config.level.to_tracing_level().into());

    if let Some(ref directives) = config.filter_directives {
        for directive in directives.split(',').filter(|d| !d.trim().is_empty()) {
            filter = filter.add_directive(
                directive
                    .trim()
                    .parse()
                    .context("Failed to parse filter directive")?,
            );
        }
    }

    let mut layers = Vec::new();
    let mut worker = None;
    let mut log_file = None;

    if config.output.includes_console() {
        layers.push(fmt_layer(config, std::io::stderr, true));
    }

    if config.output.includes_file() {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;

        let path = config.run_log_path(Local::now());
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.log", config.log_file_prefix));
        let appender = tracing_appender::rolling::never(&config.log_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        layers.push(fmt_layer(config, non_blocking, false));
        worker = Some(guard);
        log_file = Some(path);
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(LogGuard {
        _worker: worker,
        log_file,
    })
}

fn fmt_layer<S, W>(config: &LogConfig, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}
