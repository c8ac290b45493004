//! Logging and tracing configuration
//!
//! Provides structured logging for both CLI and daemon modes. The daemon
//! logs to a file since it is expected to run under a supervisor, and
//! additionally mirrors each log line into the active run's event stream
//! through the output relay.

use std::path::PathBuf;
use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::daemon::relay::{OutputRelay, RelayLogWriter};

use super::paths;

/// Initialize tracing for the CLI (stdout logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
pub fn init_cli() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("testd=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}

/// Initialize tracing for the daemon
///
/// The daemon logs to:
/// 1. A daily-rotated log file under the platform data directory
/// 2. stderr (inherited from the spawning process for early errors)
/// 3. The output relay, which forwards each line as a `log` event while a
///    run is in progress
///
/// Returns the log file directory (if file logging could be set up) and the
/// appender worker guard, which must be kept alive for the daemon lifetime.
pub fn init_daemon(relay: Arc<OutputRelay>) -> (Option<PathBuf>, Option<WorkerGuard>) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("testd=debug,info"));

    if let Some(log_dir) = paths::log_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let appender = tracing_appender::rolling::daily(&log_dir, "daemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);

            let stderr_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .compact();

            let relay_layer = fmt::layer()
                .with_writer(RelayLogWriter::new(relay.clone()))
                .with_ansi(false)
                .with_target(false)
                .compact();

            tracing_subscriber::registry()
                .with(filter)
                .with(file_layer)
                .with(stderr_layer)
                .with(relay_layer)
                .init();

            return (Some(log_dir), Some(guard));
        }
        eprintln!("Warning: could not create log directory {}", log_dir.display());
    }

    // Fallback: stderr + relay only
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .compact();

    let relay_layer = fmt::layer()
        .with_writer(RelayLogWriter::new(relay))
        .with_ansi(false)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(relay_layer)
        .init();

    (None, None)
}
