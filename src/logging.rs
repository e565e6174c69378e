//! Tracing configuration and log routing.
//!
//! The console logs to stderr using a compact formatter (stdout stays free for the CLI runner's
//! JSON output) and, optionally, to a file. When `PIPECONSOLE_LOG_FILE` is set, logs are appended
//! to that path; otherwise a file logger is created under `logs/pipeconsole.log`. External stage
//! output echoed by the supervisor goes through the same layers, so the file layer uses a
//! non-blocking writer.
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Options controlling subscriber installation.
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    /// Filter applied when `RUST_LOG` is unset.
    pub default_filter: &'static str,
    /// Whether to add the file layer.
    pub file: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            default_filter: "info",
            file: true,
        }
    }
}

/// Configure tracing subscribers for stderr and file logging with the server defaults.
pub fn init_tracing() {
    init_tracing_with(LogOptions::default());
}

/// Configure tracing subscribers.
///
/// - Respects `RUST_LOG` for filtering (falls back to `options.default_filter`).
/// - Installs a compact stderr layer and, when requested and available, a file layer.
/// - Keeps the non-blocking writer guard alive for the process lifetime.
pub fn init_tracing_with(options: LogOptions) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_filter));
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let file_writer = if options.file {
        configure_file_writer()
    } else {
        None
    };

    if let Some(writer) = file_writer {
        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .compact();

        registry.with(file_layer).init();
    } else {
        registry.init();
    }
}

/// Build a non-blocking writer for file logging.
///
/// Returns `None` when the logs directory cannot be created or the target file cannot be opened.
fn configure_file_writer() -> Option<NonBlocking> {
    if let Ok(path) = std::env::var("PIPECONSOLE_LOG_FILE") {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file);
                let _ = LOG_GUARD.set(guard);
                Some(non_blocking)
            }
            Err(err) => {
                eprintln!("Failed to open log file {path}: {err}");
                None
            }
        }
    } else {
        if let Err(err) = std::fs::create_dir_all("logs") {
            eprintln!("Failed to create logs directory: {err}");
            return None;
        }
        let file_appender = tracing_appender::rolling::never("logs", "pipeconsole.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);
        Some(non_blocking)
    }
}
