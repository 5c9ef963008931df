//! Tracing subscriber setup from the `logging` section.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogRotation, LoggingConfig};

/// Filter used when `RUST_LOG` is unset.
pub fn filter_directive(config: &LoggingConfig, debug: bool) -> String {
    let level = config.level.trim();
    if !level.is_empty() {
        level.to_string()
    } else if debug {
        "debug".to_string()
    } else {
        "info".to_string()
    }
}

fn rotation(rotate: LogRotation) -> Rotation {
    match rotate {
        LogRotation::Never => Rotation::NEVER,
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
    }
}

fn file_appender(config: &LoggingConfig) -> Result<RollingFileAppender> {
    let path = Path::new(&config.file);
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("logging.file '{}' has no file name", config.file))?;

    RollingFileAppender::builder()
        .rotation(rotation(config.rotate))
        .filename_prefix(file_name)
        .build(directory)
        .with_context(|| format!("failed to open log file '{}'", config.file))
}

/// Installs the global subscriber.
///
/// The returned guard flushes buffered lines on drop and must be held for
/// the life of the process.
pub fn init(config: &LoggingConfig, debug: bool) -> Result<WorkerGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directive(config, debug))
            .with_context(|| format!("invalid logging.level '{}'", config.level))?,
    };

    let (writer, guard) = if config.file.is_empty() {
        tracing_appender::non_blocking(std::io::stdout())
    } else {
        tracing_appender::non_blocking(file_appender(config)?)
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(writer))
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

/// Stderr subscriber for failures that happen before the configuration
/// is available.
pub fn init_fallback() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
