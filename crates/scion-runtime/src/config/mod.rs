//! Runtime configuration.
//!
//! Layered loading through figment ([`ConfigLoader`]), the serde schema
//! ([`ScionConfig`]) and the checks run before a runtime is built
//! ([`validate_config`]).

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    LoaderConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, PluginSettings,
    ScionConfig, SpanEventConfig,
};
pub use validation::validate_config;
