//! Tracing subscriber setup.
//!
//! `log` macros are bridged into `tracing` through `tracing-log`, so both
//! operational log lines and spans end up in the same formatter.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, VidpipeError};

/// Builds the level filter. `RUST_LOG` wins over the configured level.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| VidpipeError::Logging(format!("invalid level '{}': {}", config.level, e)))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;

    tracing_log::LogTracer::init().map_err(|e| VidpipeError::Logging(e.to_string()))?;

    let (pretty, json) = match config.format {
        LogFormat::Pretty => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_current_span(true).with_span_list(false)),
        ),
    };

    let subscriber = Registry::default().with(filter).with(pretty).with(json);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| VidpipeError::Logging(e.to_string()))?;

    log::debug!("Logging initialized ({:?}, level {})", config.format, config.level);
    Ok(())
}
