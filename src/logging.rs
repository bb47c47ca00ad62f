//! Subscriber setup: console output, optionally JSON, optionally mirrored to
//! daily rolling files.
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const LOG_FILE_PREFIX: &str = "watch-relay.log";

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub verbose: bool,
    pub json: bool,
    /// Directory for rolling log files; console only when unset.
    pub dir: Option<PathBuf>,
}

/// Level used when `RUST_LOG` is unset.
pub fn default_level(verbose: bool, log_level: Option<&str>) -> &'static str {
    let debug_env = log_level
        .map(|l| l.trim().eq_ignore_ascii_case("debug"))
        .unwrap_or(false);
    if verbose || debug_env {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process or buffered file output is lost.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let level = default_level(config.verbose, std::env::var("LOG_LEVEL").ok().as_deref());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = if config.json {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer().compact().with_target(false).boxed()
    };

    let (file, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if config.json {
                fmt::layer().json().with_writer(writer).boxed()
            } else {
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(writer)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_switches() {
        assert_eq!(default_level(false, None), "info");
        assert_eq!(default_level(true, None), "debug");
        assert_eq!(default_level(false, Some("debug")), "debug");
        assert_eq!(default_level(false, Some(" DEBUG ")), "debug");
        assert_eq!(default_level(false, Some("warn")), "info");
    }
}
