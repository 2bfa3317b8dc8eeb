//! Log output for the CLI and fetch workers.
//!
//! The console shows what the user asked for. The per-run log file keeps
//! everything down to TRACE, including the `peer` span each race worker
//! runs in. Failures the race swallows can be traced back to one address there.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name of the trace log, overwritten on every run.
pub const LOG_FILE_NAME: &str = "undertow-last-run.log";

/// Terse stderr output; `RUST_LOG` takes precedence over `level`.
fn console_layer<S>(level: Level) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter)
}

/// Full trace with source locations. Closing a worker span logs how long
/// that peer was busy.
fn trace_file_layer<S>(log_file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(Mutex::new(log_file))
        .with_filter(LevelFilter::TRACE)
}

/// Installs the global subscriber and returns the path of the trace log.
///
/// `logs_dir` defaults to `./logs` and is created if missing.
///
/// # Errors
/// - `Box<dyn std::error::Error>` - Logs directory or file cannot be created,
///   or a global subscriber is already installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let logs_path = logs_dir.unwrap_or_else(|| Path::new("logs"));
    create_dir_all(logs_path)?;

    let log_file_path = logs_path.join(LOG_FILE_NAME);
    let log_file = File::create(&log_file_path)?;

    tracing_subscriber::registry()
        .with(console_layer(console_level))
        .with(trace_file_layer(log_file))
        .try_init()?;

    tracing::debug!(
        console = %console_level,
        log_file = %log_file_path.display(),
        "tracing initialized"
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Fetch outcomes
    Info,
    /// Per-peer failures
    Debug,
    /// Every ignored wire message
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use undertow_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Debug.as_tracing_level();
    /// assert_eq!(level, tracing::Level::DEBUG);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::str::FromStr for CliLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(CliLogLevel::Error),
            "warn" => Ok(CliLogLevel::Warn),
            "info" => Ok(CliLogLevel::Info),
            "debug" => Ok(CliLogLevel::Debug),
            "trace" => Ok(CliLogLevel::Trace),
            _ => Err(format!("Invalid log level: {s}")),
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliLogLevel::Error => write!(f, "error"),
            CliLogLevel::Warn => write!(f, "warn"),
            CliLogLevel::Info => write!(f, "info"),
            CliLogLevel::Debug => write!(f, "debug"),
            CliLogLevel::Trace => write!(f, "trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("DEBUG".parse::<CliLogLevel>().unwrap(), CliLogLevel::Debug);
        assert_eq!(CliLogLevel::Warn.to_string(), "warn");
        assert_eq!(CliLogLevel::Trace.as_tracing_level(), Level::TRACE);
        assert!("loud".parse::<CliLogLevel>().is_err());
    }

    #[test]
    fn test_init_tracing_writes_log_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let logs = temp_dir.path().join("nested/logs");

        let path = init_tracing(Level::WARN, Some(&logs)).unwrap();
        assert_eq!(path, logs.join(LOG_FILE_NAME));
        assert!(path.exists());

        // below the console level, but the file keeps it with its span fields
        tracing::debug_span!("peer", peer = %"10.0.0.7:6881", exchange = "metadata")
            .in_scope(|| tracing::debug!("handshake rejected"));
        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.contains("peer=10.0.0.7:6881"));
        assert!(log.contains("exchange=\"metadata\""));
        assert!(log.contains("handshake rejected"));
        assert!(log.contains("close"));

        // the global subscriber can only be installed once
        assert!(init_tracing(Level::WARN, Some(&logs)).is_err());
    }
}
