//! Error types for configuration handling.

use thiserror::Error;

/// Result type alias using ConfigError as the error type.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors related to loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read or merged
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Configuration content could not be deserialized
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// A field holds a value outside its allowed range
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
