//! Bridge configuration types and defaults.
//!
//! This module defines the configuration options for the bridge, including
//! the size of the blocking worker pool and logging defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of blocking worker threads for native calls
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default number of blocking worker threads for event finishing work
pub const DEFAULT_EVENT_WORKERS: usize = 2;

/// Upper bound on either pool
pub const MAX_WORKER_THREADS: usize = 64;

/// Default tracing filter directive
pub const DEFAULT_LOG_FILTER: &str = "telldus_bridge=info";

const CRATE_TARGET: &str = "telldus_bridge";

/// Configuration for the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Maximum number of native calls running concurrently off the control thread
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Maximum number of events being finished concurrently
    #[serde(default = "default_event_workers")]
    pub event_workers: usize,

    /// Tracing filter used by `init_logging`
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Log this crate at debug level regardless of `log_filter`
    #[serde(default)]
    pub debug: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            event_workers: DEFAULT_EVENT_WORKERS,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            debug: false,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the native call worker count
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the event worker count
    pub fn with_event_workers(mut self, workers: usize) -> Self {
        self.event_workers = workers;
        self
    }

    /// Set the tracing filter
    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Enable debug logging for the bridge
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Parse a configuration from JSON
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Filter directives to install, with `debug` applied.
    ///
    /// Debug mode replaces any directive for this crate with
    /// `telldus_bridge=debug` and keeps the rest.
    pub fn log_directives(&self) -> String {
        if !self.debug {
            return self.log_filter.clone();
        }
        self.log_filter
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty() && !d.starts_with(CRATE_TARGET))
            .chain(std::iter::once("telldus_bridge=debug"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("worker_threads", self.worker_threads),
            ("event_workers", self.event_workers),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    reason: "must be greater than 0".into(),
                });
            }
            if value > MAX_WORKER_THREADS {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    reason: format!("must be at most {}", MAX_WORKER_THREADS),
                });
            }
        }

        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "log_filter".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue {
        /// The field name
        field: String,
        /// The reason it's invalid
        reason: String,
    },

    /// Missing required field
    #[error("Missing required configuration field: {field}")]
    MissingField {
        /// The field name
        field: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Default value functions for serde
fn default_worker_threads() -> usize {
    DEFAULT_WORKER_THREADS
}

fn default_event_workers() -> usize {
    DEFAULT_EVENT_WORKERS
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.worker_threads, DEFAULT_WORKER_THREADS);
        assert_eq!(config.event_workers, DEFAULT_EVENT_WORKERS);
        assert!(!config.debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = BridgeConfig::new()
            .with_worker_threads(8)
            .with_event_workers(1)
            .with_debug(true);

        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.event_workers, 1);
        assert!(config.debug);
    }

    #[test]
    fn test_debug_raises_crate_level() {
        let config = BridgeConfig::new();
        assert_eq!(config.log_directives(), DEFAULT_LOG_FILTER);

        let config = config.with_debug(true);
        assert_eq!(config.log_directives(), "telldus_bridge=debug");

        let config = BridgeConfig::new()
            .with_log_filter("warn, telldus_bridge::events=trace,tokio=info")
            .with_debug(true);
        assert_eq!(config.log_directives(), "warn,tokio=info,telldus_bridge=debug");
    }

    #[test]
    fn test_config_validation() {
        assert!(BridgeConfig::new().with_worker_threads(0).validate().is_err());
        assert!(BridgeConfig::new().with_event_workers(65).validate().is_err());
        assert!(BridgeConfig::new().with_log_filter("  ").validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = BridgeConfig::from_json_str(r#"{"workerThreads": 2}"#).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.event_workers, DEFAULT_EVENT_WORKERS);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_invalid_json_rejected() {
        let err = BridgeConfig::from_json_str(r#"{"workerThreads": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"eventWorkers": 3, "debug": true}}"#).unwrap();

        let config = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.event_workers, 3);
        assert!(config.debug);
    }

    #[test]
    fn test_missing_file() {
        let err = BridgeConfig::from_file("/nonexistent/telldus-bridge.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
