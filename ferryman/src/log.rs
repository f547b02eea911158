//! Logger setup: console by default, file when configured.

use std::path::Path;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Keep this alive for as long as logs should be flushed.
pub struct LoggerGuard {
    _appender_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// `FERRYMAN_LOG` takes precedence over the configured level and accepts
/// full tracing directives.
pub fn init(level: &str, file: Option<&Path>) -> anyhow::Result<LoggerGuard> {
    let filter = match std::env::var("FERRYMAN_LOG") {
        Ok(directives) => EnvFilter::try_new(directives),
        Err(_) => EnvFilter::try_new(format!("ferryman={level}")),
    }
    .context("invalid log directives")?;

    let registry = tracing_subscriber::registry().with(filter);

    let guard = match file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().context("log file has no name")?;
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            registry.with(tracing_subscriber::fmt::layer()).init();
            None
        }
    };

    Ok(LoggerGuard {
        _appender_guard: guard,
    })
}
