//! Error types for the shared client registries.

use thiserror::Error;

// =============================================================================
// Registry Errors
// =============================================================================

/// Errors raised by [`CommandRegistry`](crate::CommandRegistry) and
/// [`EventHandlerRegistry`](crate::EventHandlerRegistry).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A command with the same name is already registered.
    #[error("command '{name}' is already registered")]
    DuplicateCommand {
        /// The conflicting command name.
        name: String,
    },

    /// No command is registered under this name.
    #[error("command '{name}' not found")]
    CommandNotFound {
        /// The missing command name.
        name: String,
    },

    /// An event name was empty.
    #[error("event name must not be empty")]
    EmptyEventName,
}

impl RegistryError {
    /// Creates a [`RegistryError::DuplicateCommand`].
    pub fn duplicate_command(name: impl Into<String>) -> Self {
        Self::DuplicateCommand { name: name.into() }
    }

    /// Creates a [`RegistryError::CommandNotFound`].
    pub fn command_not_found(name: impl Into<String>) -> Self {
        Self::CommandNotFound { name: name.into() }
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
