//! Configuration types for the Lumen display stack.
//!
//! Configuration is loaded from a TOML file and validated before use.
//! Every field has a sensible default so a missing file or a partial file
//! still yields a working setup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default software vsync cadence: 60 Hz.
const DEFAULT_VSYNC_PERIOD_US: u64 = 16_666;

fn default_vsync_period_us() -> u64 {
    DEFAULT_VSYNC_PERIOD_US
}

fn default_buffer_count() -> usize {
    3
}

fn default_max_dirty_rects() -> usize {
    32
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level configuration for the compositor process.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CompositorConfig {
    /// Software vsync period in microseconds, used when hardware vsync is
    /// unavailable or disabled.
    #[serde(rename = "vsync-period-us")]
    pub vsync_period_us: u64,

    /// Number of buffer slots negotiated for new buffer queues.
    #[serde(rename = "buffer-count")]
    pub buffer_count: usize,

    /// Maximum number of rectangles a damage region may accumulate before
    /// it collapses to its bounding rectangle.
    #[serde(rename = "max-dirty-rects")]
    pub max_dirty_rects: usize,

    /// Log level for the compositor process.
    #[serde(rename = "log-level")]
    pub log_level: String,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            vsync_period_us: default_vsync_period_us(),
            buffer_count: default_buffer_count(),
            max_dirty_rects: default_max_dirty_rects(),
            log_level: default_log_level(),
        }
    }
}

impl CompositorConfig {
    /// Loads and validates a configuration from a TOML file.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field values after parsing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vsync_period_us == 0 {
            return Err(ConfigError::ValidationError(
                "vsync-period-us must be greater than zero".to_string(),
            ));
        }
        if self.buffer_count < 2 {
            return Err(ConfigError::ValidationError(format!(
                "buffer-count must be at least 2, got {}",
                self.buffer_count
            )));
        }
        if self.max_dirty_rects == 0 {
            return Err(ConfigError::ValidationError(
                "max-dirty-rects must be greater than zero".to_string(),
            ));
        }
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "unknown log level: {}",
                other
            ))),
        }
    }

    /// The software vsync period as a [`Duration`].
    pub fn vsync_period(&self) -> Duration {
        Duration::from_micros(self.vsync_period_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = CompositorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vsync_period(), Duration::from_micros(16_666));
        assert_eq!(config.buffer_count, 3);
    }

    #[test]
    fn load_from_path_parses_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "vsync-period-us = 8333").unwrap();
        writeln!(file, "buffer-count = 2").unwrap();

        let config = CompositorConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.vsync_period_us, 8333);
        assert_eq!(config.buffer_count, 2);
        // Unspecified fields keep their defaults.
        assert_eq!(config.max_dirty_rects, 32);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn load_from_path_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer-count = 1").unwrap();

        let result = CompositorConfig::load_from_path(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn load_from_path_missing_file_is_read_error() {
        let result = CompositorConfig::load_from_path(Path::new("/nonexistent/lumen.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }
}
