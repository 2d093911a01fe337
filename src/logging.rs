//! Tracing subscriber setup.
//!
//! Output goes through a `tracing-appender` non-blocking writer to stdout,
//! stderr or a file. `RUST_LOG` overrides the configured level.

use std::fs::OpenOptions;
use std::io;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber.
///
/// The returned guard flushes buffered lines on drop and must be held for
/// the life of the program.
pub fn init_logging(config: &LoggingConfig, level_override: Option<Level>) -> io::Result<WorkerGuard> {
    let level = level_override.unwrap_or_else(|| parse_level(&config.level));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,rustls=warn",
            level.as_str().to_lowercase()
        ))
    });

    let (writer, guard) = match config.output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(io::stdout()),
        "stderr" => tracing_appender::non_blocking(io::stderr()),
        _ => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.output)?;
            tracing_appender::non_blocking(file)
        }
    };
    let to_file = !matches!(config.output.to_lowercase().as_str(), "stdout" | "stderr");

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(config.include_target),
            )
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(!to_file)
                    .with_target(config.include_target),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(!to_file)
                    .with_target(config.include_target),
            )
            .init(),
    }

    Ok(guard)
}

/// Parse a level name, falling back to `INFO`.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Map CLI verbosity flags onto a level, relative to `INFO`.
pub fn level_from_flags(verbose: u8, quiet: bool) -> Option<Level> {
    match (quiet, verbose) {
        (true, _) => Some(Level::ERROR),
        (false, 0) => None,
        (false, 1) => Some(Level::DEBUG),
        (false, _) => Some(Level::TRACE),
    }
}
