//! Tracing subscriber setup for the server.
//!
//! Two modes, picked by `[server] production`:
//! - **Production**: JSON lines in a daily rolling file, compact stdout for journald
//! - **Development**: pretty stdout with span open/close events

use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::Context;
use beaconwatch_core::config::ServerSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive used when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "BEACONWATCH_LOG_LEVEL";

const DEFAULT_LEVEL: &str = "info";
const LOG_FILE_PREFIX: &str = "beaconwatch";

// Dropping a guard stops its writer thread, so both live until exit.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber for `settings`.
///
/// In production, logs go to `settings.log_dir` (or the platform default,
/// `/var/log/beaconwatch` on Linux) as daily rolling JSON files and to stdout
/// without colors. Otherwise only stdout is used, pretty printed.
///
/// # Errors
///
/// Returns an error if the filter directive is malformed or the log
/// directory cannot be created.
pub fn init(settings: &ServerSettings) -> anyhow::Result<()> {
    let env_filter = env_filter()?;
    if settings.production {
        let log_dir = settings.log_dir.clone().unwrap_or_else(default_log_directory);
        init_production(env_filter, log_dir)
    } else {
        init_development(env_filter);
        Ok(())
    }
}

fn env_filter() -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| DEFAULT_LEVEL.to_string());
    EnvFilter::try_new(&directive).with_context(|| format!("Invalid {LOG_LEVEL_ENV}: {directive}"))
}

fn init_production(env_filter: EnvFilter, log_dir: PathBuf) -> anyhow::Result<()> {
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    // One file per day, named beaconwatch.YYYY-MM-DD
    let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own timestamps and has no use for colors
    let journal_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(journal_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    tracing::info!(log_dir = %log_dir.display(), "File logging enabled");
    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    let console_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .init();
}

fn default_log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/beaconwatch")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "beaconwatch")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}
