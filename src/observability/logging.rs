//! Tracing subscriber setup for the binary

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install console logging plus a daily rolling file under `CONCORD_LOG_DIR`
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard
/// flushes the file writer and must be held for the life of the process.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut guard = None;
    let file_layer = std::env::var("CONCORD_LOG_DIR")
        .ok()
        .and_then(|dir| match preflight_log_dir(&dir) {
            Ok(()) => {
                // rolling::daily panics if the first file can't be created
                let appender = tracing_appender::rolling::daily(&dir, "concord.log");
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard = Some(file_guard);
                eprintln!("Logging to: {}/concord.log", dir);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir, e
                );
                None
            }
        });

    let (plain, json) = if config.json {
        (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .with(file_layer)
        .try_init();

    guard
}

/// Minimal logging for short CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

fn preflight_log_dir(dir: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let marker = Path::new(dir).join(".concord_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)?;
    let _ = std::fs::remove_file(&marker);
    Ok(())
}
