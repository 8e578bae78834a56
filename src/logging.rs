//! Structured logging initialization.
//!
//! `RUST_LOG`, when set, takes precedence over the configured level.

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::{
    config::{LogFormat, LoggingConfig},
    error::{Error, Result},
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed or the level directive does
/// not parse.
///
/// ```ignore
/// let config = LoggingConfig::default();
/// mill_serve::logging::init(&config)?;
/// tracing::info!("server starting");
/// ```
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;

    tracing_subscriber::registry()
        .with(layer(config).with_filter(filter))
        .try_init()
        .map_err(|e| Error::Config(format!("cannot install logger: {e}")))
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if std::env::var("RUST_LOG").is_ok() {
        return Ok(EnvFilter::from_default_env());
    }
    EnvFilter::try_new(config.level.as_str())
        .map_err(|e| Error::Config(format!("invalid log level {:?}: {e}", config.level)))
}

fn layer(config: &LoggingConfig) -> BoxedLayer {
    let base = fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => base.pretty().with_ansi(true).boxed(),
        (LogFormat::Pretty, false) => base.pretty().with_ansi(true).without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().with_ansi(true).boxed(),
        (LogFormat::Compact, false) => base.compact().with_ansi(true).without_time().boxed(),
        (LogFormat::Json, true) => base.json().boxed(),
        (LogFormat::Json, false) => base.json().without_time().boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_level_is_config_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "mill_serve=loud".into(),
            ..LoggingConfig::default()
        };
        assert!(matches!(env_filter(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_every_format_builds() {
        for format in [LogFormat::Pretty, LogFormat::Compact, LogFormat::Json] {
            for timestamps in [true, false] {
                let config = LoggingConfig {
                    format,
                    timestamps,
                    ..LoggingConfig::default()
                };
                let _ = layer(&config);
            }
        }
    }
}
