//! Logging setup.
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the embedding program. The monitor binary and the C ABI layer use the
//! helpers here.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No subscriber is installed
    Silent,
    /// Compact stderr output
    Development,
    /// Verbose output with thread ids and source locations
    Debug,
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),
}

/// Install a subscriber for `mode`.
///
/// # Environment Variables
///
/// - `AUDIO_EVENTS_LOG_LEVEL`: filter directive (e.g. `debug`, `audio_events::bridge=trace`)
/// - `RUST_LOG`: used when the above is unset
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => install(env_filter("info"), false),
        LoggingMode::Debug => install(env_filter("debug"), true),
    }
}

/// Initialize logging from `AUDIO_EVENTS_LOG_MODE`
/// (`silent`, `development` or `debug`; defaults to `development`).
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    init_logging(mode_from(std::env::var("AUDIO_EVENTS_LOG_MODE").ok().as_deref()))
}

/// Install a compact subscriber with an explicit filter directive.
pub fn init_with_level(directive: &str) -> Result<(), LoggingError> {
    install(EnvFilter::new(directive), false)
}

/// Check if a global subscriber has been installed.
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

fn mode_from(value: Option<&str>) -> LoggingMode {
    match value {
        Some("silent") => LoggingMode::Silent,
        Some("debug") => LoggingMode::Debug,
        _ => LoggingMode::Development,
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    if let Ok(level) = std::env::var("AUDIO_EVENTS_LOG_LEVEL") {
        EnvFilter::new(level)
    } else if let Ok(rust_log) = std::env::var("RUST_LOG") {
        EnvFilter::new(rust_log)
    } else {
        EnvFilter::new(default_level)
    }
}

fn install(filter: EnvFilter, verbose: bool) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let result = if verbose {
        Registry::default()
            .with(
                fmt::layer()
                    .pretty()
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(filter)
            .try_init()
    } else {
        Registry::default()
            .with(fmt::layer().with_target(false).compact())
            .with(filter)
            .try_init()
    };

    result.map_err(|e| LoggingError::TracingInit(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(mode_from(Some("silent")), LoggingMode::Silent);
        assert_eq!(mode_from(Some("debug")), LoggingMode::Debug);
        assert_eq!(mode_from(Some("bogus")), LoggingMode::Development);
        assert_eq!(mode_from(None), LoggingMode::Development);
    }

    #[test]
    fn test_silent_installs_nothing() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
    }
}
