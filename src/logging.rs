//! Tracing subscriber setup. Only the binary calls this; the engine just emits events.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::{EngineError, Result};

const DEFAULT_LEVEL: &str = "info";

/// Install the global subscriber. Logs go to stderr so command output stays clean.
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = build_env_filter(&settings.level);
    let installed = match settings.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_thread_names(true),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_names(true),
            )
            .try_init(),
    };
    installed.map_err(|err| EngineError::Config(format!("failed to install tracing subscriber: {err}")))
}

/// `RUST_LOG` wins over the configured level.
fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| parse_level(level))
}

/// The configured directive, or `info` when it does not parse.
fn parse_level(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}
