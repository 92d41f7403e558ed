//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested file does not exist.
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// The sources could not be merged into a [`ScionConfig`](super::ScionConfig).
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A value is out of range or inconsistent.
    #[error("invalid configuration: {message}")]
    ValidationError { message: String },

    /// A required value is empty.
    #[error("missing required configuration field: {field}")]
    MissingField { field: String },

    /// A plugin name is not a dotted identifier.
    #[error("invalid plugin name: '{0}'")]
    InvalidPluginName(String),

    /// A configured variable collides with a loader-managed attribute.
    #[error("variable '{variable}' of '{owner}' is reserved")]
    ReservedVariable { owner: String, variable: String },
}

impl ConfigError {
    /// Creates a validation error with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates a reserved variable error.
    pub fn reserved_variable(owner: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::ReservedVariable {
            owner: owner.into(),
            variable: variable.into(),
        }
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
