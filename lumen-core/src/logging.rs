//! Logging initialization for the Lumen display stack.
//!
//! Built on the `tracing` ecosystem. The compositor process calls
//! [`init_logging`] once at startup; library code and tests can fall back
//! to [`init_minimal_logging`], which never fails even when a global
//! subscriber is already installed.

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::CoreError;

static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Initializes a minimal logging setup, directing messages to `stderr`.
///
/// Intended for tests and early startup before configuration is loaded.
/// Filters based on `RUST_LOG`, defaulting to "info". Errors (e.g., a
/// global subscriber already set) are ignored.
pub fn init_minimal_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initializes the global logging system with the given level string.
///
/// # Errors
///
/// Returns [`CoreError::LoggingInitialization`] if the level is not one of
/// `trace`, `debug`, `info`, `warn`, `error`, or if a global subscriber was
/// already installed by a previous call.
pub fn init_logging(level: &str) -> Result<(), CoreError> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        invalid => {
            return Err(CoreError::LoggingInitialization(format!(
                "invalid log level: {}",
                invalid
            )));
        }
    };

    if LOGGING_INITIALIZED.set(()).is_err() {
        return Err(CoreError::LoggingInitialization(
            "logging already initialized".to_string(),
        ));
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level.to_string()))
        .try_init()
        .map_err(|e| CoreError::LoggingInitialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_rejects_unknown_level() {
        let result = init_logging("loud");
        assert!(matches!(
            result,
            Err(CoreError::LoggingInitialization(_))
        ));
    }

    #[test]
    fn init_minimal_logging_is_idempotent() {
        init_minimal_logging();
        init_minimal_logging();
    }
}
