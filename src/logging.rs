//! Structured logging with tracing
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! The `KB_LOG` environment variable takes precedence over the configured
//! level and accepts full `EnvFilter` directives (`kbsearch=debug,warn`).

use tracing::Level;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::error::{KbError, KbResult};

/// Environment variable holding a filter directive.
pub const LOG_ENV_VAR: &str = "KB_LOG";

/// Install the global subscriber.
///
/// Fails if the configured level is not a valid filter. Calling it twice is
/// harmless; the second subscriber is ignored.
pub fn init(config: &LoggingConfig) -> KbResult<()> {
    parse_log_level(&config.level)?;
    let filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(&config.level));

    // The layer types differ, hence the two branches
    let result = if config.json {
        let layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_names(true);
        Registry::default().with(filter).with(layer).try_init()
    } else {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact();
        Registry::default().with(filter).with(layer).try_init()
    };

    if result.is_ok() {
        tracing::debug!("Logging initialized with level: {}", config.level);
    }
    Ok(())
}

/// Parse log level string to tracing Level
pub fn parse_log_level(level: &str) -> KbResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(KbError::Config {
            reason: format!("Invalid log level: {level}. Use trace, debug, info, warn, or error"),
        }),
    }
}
