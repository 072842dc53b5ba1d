//! Configuration management for CloseCircuit.
//!
//! This module provides the application configuration:
//! - Loading from YAML files
//! - Environment variable overrides (`CLOSECIRCUIT__SECTION__KEY`)
//! - Validation of all settings
//! - Discovery, routing, stream and logging sections

use crate::discovery_config::{DiscoveryConfig, RoutingConfig};
use crate::error::{ConfigError, Result};
use crate::retry::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CLOSECIRCUIT";

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use closecircuit_core::config::AppConfig;
///
/// // Load from file
/// let config = AppConfig::from_file("closecircuit.yaml").unwrap();
///
/// // Validate before use
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// WS-Discovery client settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Reachability routing table settings
    #[serde(default)]
    pub routing: RoutingConfig,

    /// MJPEG stream settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::InvalidFormat {
            reason: e.to_string(),
        })
    }

    /// Loads configuration using the `config` crate. The file is optional;
    /// `CLOSECIRCUIT__*` environment variables override its values.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or merged.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config
            .try_deserialize()
            .map_err(|e| ConfigError::InvalidFormat {
                reason: e.to_string(),
            })
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<()> {
        self.discovery
            .validate()
            .map_err(|reason| ConfigError::invalid("discovery", reason))?;

        self.routing
            .validate()
            .map_err(|reason| ConfigError::invalid("routing", reason))?;

        self.stream
            .validate()
            .map_err(|reason| ConfigError::invalid("stream", reason))?;

        Ok(())
    }
}

/// MJPEG stream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Cap on buffered bytes while waiting for a frame boundary (None = unbounded)
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: Option<usize>,

    /// Backoff between reconnects to a dropped stream
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

fn default_max_buffer_bytes() -> Option<usize> {
    Some(8 * 1024 * 1024)
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: default_max_buffer_bytes(),
            reconnect: BackoffConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Validates the stream settings.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_buffer_bytes == Some(0) {
            return Err("max_buffer_bytes cannot be 0 (omit it to disable the cap)".to_string());
        }

        self.reconnect
            .validate()
            .map_err(|e| format!("reconnect: {}", e))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

    // Builder tests read the process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream.max_buffer_bytes, Some(8 * 1024 * 1024));
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
discovery:
  interface: p2p-wlan0-0
  probe_interval_ms: null
  probe_types:
    - dn:NetworkVideoTransmitter
    - tds:Device
routing:
  delinquency_interval_ms: 4500
stream:
  max_buffer_bytes: 1048576
logging:
  level: debug
  format: json
"#;

        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.discovery.interface.as_deref(), Some("p2p-wlan0-0"));
        assert_eq!(config.discovery.probe_interval(), None);
        assert_eq!(config.discovery.probe_types.len(), 2);
        assert_eq!(config.discovery.port, 3702);
        assert_eq!(config.routing.delinquency_interval(), Duration::from_millis(4500));
        assert_eq!(config.routing.playback_path, "/video");
        assert_eq!(config.stream.max_buffer_bytes, Some(1_048_576));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_yaml() {
        let result = AppConfig::from_yaml("routing: [not, a, map]");
        assert!(matches!(result, Err(ConfigError::InvalidFormat { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_buffer_cap() {
        let mut config = AppConfig::default();
        config.stream.max_buffer_bytes = Some(0);

        match config.validate() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "stream"),
            other => panic!("expected invalid stream config, got {:?}", other),
        }
    }

    #[test]
    fn test_from_config_builder_reads_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "routing:\n  delinquency_interval_ms: 6000\n  playback_path: /mjpeg").unwrap();

        let config = AppConfig::from_config_builder(file.path()).unwrap();
        assert_eq!(config.routing.delinquency_interval_ms, 6000);
        assert_eq!(config.routing.playback_path, "/mjpeg");
        assert_eq!(config.discovery, DiscoveryConfig::default());
    }

    #[test]
    fn test_from_config_builder_missing_file_uses_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let config = AppConfig::from_config_builder("/nonexistent/closecircuit.yaml").unwrap();
        assert_eq!(config.routing, RoutingConfig::default());
    }

    #[test]
    fn test_from_config_builder_env_overrides_file() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        const KEY: &str = "CLOSECIRCUIT__ROUTING__DELINQUENCY_INTERVAL_MS";

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "routing:\n  delinquency_interval_ms: 6000\n  playback_path: /mjpeg").unwrap();

        let prev = env::var(KEY).ok();
        env::set_var(KEY, "7777");
        let result = AppConfig::from_config_builder(file.path());
        match prev {
            Some(v) => env::set_var(KEY, v),
            None => env::remove_var(KEY),
        }

        let config = result.unwrap();
        assert_eq!(config.routing.delinquency_interval_ms, 7777);
        assert_eq!(config.routing.playback_path, "/mjpeg");
        assert_eq!(config.discovery, DiscoveryConfig::default());
    }

    #[test]
    fn test_from_file_missing() {
        let result = AppConfig::from_file("/nonexistent/closecircuit.yaml");
        assert!(matches!(result, Err(ConfigError::LoadFailed { .. })));
    }
}
