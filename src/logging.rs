//! Tracing setup for the supervisor and one-shot CLI commands.

use crate::config::LoggingConfig;
use std::path::Path;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "guard-supervisor.log";

/// Install the global subscriber for the long-running daemon.
///
/// `RUST_LOG` wins over the configured level. The file layer is only added when the
/// reports directory is writable, since `tracing_appender::rolling::daily` panics if it
/// cannot create its first file.
pub fn init_logging(config: &LoggingConfig, reports_dir: &Path) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hookguard={}", config.level, config.level)));

    let file_layer = if config.file && preflight_writable(reports_dir) {
        let file_appender = tracing_appender::rolling::daily(reports_dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep the guard alive for the process lifetime
        Box::leak(Box::new(guard));

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    } else {
        None
    };

    let (json_layer, console_layer) = if config.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            ),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let file_logging_enabled = file_layer.is_some();
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init();

    if file_logging_enabled {
        eprintln!("Logging to: {}/{}", reports_dir.display(), LOG_FILE_NAME);
    }
}

/// Minimal logging for one-shot CLI commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .try_init();
}

fn preflight_writable(dir: &Path) -> bool {
    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "Warning: Could not create log directory {} ({}), file logging disabled",
            dir.display(),
            e
        );
        return false;
    }

    let probe = dir.join(".hookguard_write_test");
    match std::fs::OpenOptions::new().create(true).append(true).open(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(e) => {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                dir.display(),
                e
            );
            false
        }
    }
}
