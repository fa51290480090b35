//! Logging setup for the conductor binary.
//!
//! Log levels:
//! - ERROR: worker crashes, unresolvable deadlocks
//! - WARN: unhealthy workers, forced lock releases, stale heartbeats
//! - INFO: startup, shutdown, worker and connection lifecycle
//! - DEBUG: lock traffic and task transitions
//! - TRACE: per-check health details and event drops
//!
//! Debug mode can be enabled with `--debug` or `CONDUCTOR_DEBUG=1`. An
//! explicit `RUST_LOG` always wins. Library code only emits `tracing`
//! events; installing the subscriber is the binary's job.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

const LOG_FILE: &str = "conductor.log";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to `~/.conductor/conductor.log`.
pub fn init() -> Option<WorkerGuard> {
    init_with_debug(false)
}

/// Initialize logging with explicit debug mode. The log file is truncated
/// on every start. Falls back to stderr when the file cannot be opened.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the background writer.
pub fn init_with_debug(debug: bool) -> Option<WorkerGuard> {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::new(default_directive(debug_enabled)),
    };

    match prepare_log_file() {
        Some(path) => {
            let dir = path.parent().map(PathBuf::from).unwrap_or_default();
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
                .try_init();
            installed.ok().map(|_| guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init();
            None
        }
    }
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the log file, if a home directory is available.
pub fn log_path() -> Option<PathBuf> {
    Config::conductor_dir().ok().map(|dir| dir.join(LOG_FILE))
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "conductor=debug,info"
    } else {
        "info"
    }
}

fn prepare_log_file() -> Option<PathBuf> {
    let path = log_path()?;
    let dir = path.parent()?;
    std::fs::create_dir_all(dir).ok()?;
    // Truncate on startup
    std::fs::write(&path, "").ok()?;
    Some(path)
}
