//! # CloseCircuit Core
//!
//! Configuration, error types and the small async building blocks shared by the
//! CloseCircuit camera discovery and streaming crates.
//!
//! - **Configuration**: `AppConfig` and its sections, loadable from YAML files
//!   with environment variable overrides.
//! - **Errors**: `ConfigError` for everything that can go wrong while loading
//!   or validating configuration.
//! - **Retry**: exponential backoff helpers for operations that eventually succeed.
//! - **Blocking**: a bridge that runs blocking work off the async scheduler and
//!   lets the caller abandon it through a cancellation token.
//! - **Observable**: a latest-value subject that only publishes real changes.
//!
//! ## Example
//!
//! ```
//! use closecircuit_core::config::AppConfig;
//!
//! let config = AppConfig::from_yaml("routing:\n  delinquency_interval_ms: 5000\n").unwrap();
//! assert!(config.validate().is_ok());
//! assert_eq!(config.routing.delinquency_interval().as_millis(), 5000);
//! ```

pub mod blocking;
pub mod config;
pub mod discovery_config;
pub mod error;
pub mod observable;
pub mod retry;

// Re-export commonly used types for convenience
pub use config::AppConfig;
pub use discovery_config::{DiscoveryConfig, RoutingConfig};
pub use error::{ConfigError, Result};
pub use observable::Observable;
pub use retry::BackoffConfig;
