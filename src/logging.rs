// =============================================================================
// Logging bootstrap
// =============================================================================
//
// Library code only emits `tracing` events; this is the one place a
// subscriber gets installed, and only the binary calls it.
//
//   console  human-readable fmt layer on stdout
//   file     plain-text fmt layer into `<log_dir>/<timestamp>.log`, written
//            from a background thread (keep the returned guard alive)
//
// `RUST_LOG` takes precedence over `logging.level`.
// =============================================================================

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogHandler, LoggingConfig};

/// Name of the log file opened at `started`.
pub fn log_file_name(started: DateTime<Utc>) -> String {
    started.format("%Y_%m_%d_%H_%M_%S_%3f.log").to_string()
}

/// Filter from `RUST_LOG` when it parses, else from the configured level.
fn env_filter(rust_log: Option<&str>, level: &str) -> anyhow::Result<EnvFilter> {
    if let Some(filter) = rust_log.and_then(|d| EnvFilter::try_new(d).ok()) {
        return Ok(filter);
    }

    // A bare word would otherwise be accepted as a target name.
    if !level.contains(['=', ',']) {
        level
            .trim()
            .parse::<LevelFilter>()
            .map_err(|_| anyhow!("invalid log level '{level}'"))?;
    }
    EnvFilter::try_new(level).with_context(|| format!("invalid log filter '{level}'"))
}

/// Assemble the subscriber described by `config` without installing it.
///
/// `rust_log` is the value of `RUST_LOG`, if any.
pub fn build(
    config: &LoggingConfig,
    rust_log: Option<&str>,
) -> anyhow::Result<(impl Subscriber + Send + Sync + 'static, Option<WorkerGuard>)> {
    let filter = env_filter(rust_log, &config.level)?;

    let console = config
        .handlers
        .contains(&LogHandler::Console)
        .then(|| fmt::layer().with_target(false));

    let (file, guard) = if config.handlers.contains(&LogHandler::File) {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("failed to create log directory {}", config.log_dir.display())
        })?;
        let appender = tracing_appender::rolling::never(&config.log_dir, log_file_name(Utc::now()));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file);

    Ok((subscriber, guard))
}

/// Install the global subscriber described by `config`.
///
/// Returns the file writer's guard when the file handler is enabled;
/// dropping it flushes and closes the file.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let (subscriber, guard) = build(config, rust_log.as_deref())?;

    subscriber
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::info!(
        level = %config.level,
        handlers = ?config.handlers,
        log_dir = %config.log_dir.display(),
        "logging initialized"
    );

    Ok(guard)
}
