//! Structured logging for pipewright.
//!
//! Levels follow the usual `tracing` conventions:
//! - ERROR: failures that leave a pipeline or task without a terminal record
//! - WARN: recoverable conditions (retries, timeouts, superseded decisions)
//! - INFO: coordination decisions, state transitions, escalations
//! - DEBUG: queue and registry traces
//! - TRACE: per-record engine activity
//!
//! Debug mode can be enabled with `--debug` or `PIPEWRIGHT_DEBUG=1`.
//! `RUST_LOG` takes precedence over both when set.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "PIPEWRIGHT_DEBUG";

/// Initialize logging to ~/.pipewright/pipewright.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting. Returns whether
/// this call installed the subscriber.
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_with_debug(debug: bool) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false);

    let result = match log_file() {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed(result)
}

/// A refused install is reported through whichever subscriber is active.
fn installed(result: Result<(), Box<dyn std::error::Error + Send + Sync>>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "logging already initialized");
            false
        }
    }
}

/// Path of the log file, if a home directory is available.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".pipewright").join("pipewright.log"))
}

fn log_file() -> Option<File> {
    let path = log_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok()?;
    }
    // Truncate on startup
    File::create(&path).ok()
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "pipewright=debug"
    } else {
        "pipewright=info"
    }
}
