//! Runtime error types.

use scion_loader::{LoaderError, PluginError};
use thiserror::Error;

pub use crate::config::{ConfigError, ConfigResult};

/// Errors raised while building or driving a runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    /// The runtime was asked to start twice.
    #[error("runtime is already running")]
    AlreadyRunning,
}

impl From<PluginError> for RuntimeError {
    fn from(error: PluginError) -> Self {
        Self::Loader(LoaderError::Plugin(error))
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
