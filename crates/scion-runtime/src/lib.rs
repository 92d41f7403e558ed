//! Scion Runtime - configuration, logging and lifecycle for a plugin host.
//!
//! This crate provides:
//! - Layered configuration with figment (`ScionConfig`, `ConfigLoader`)
//! - Logging setup on tracing-subscriber (`LoggingBuilder`, `SpanEvents`)
//! - `ScionRuntime`, which wires a `Client` and a `PluginLoader` from
//!   configuration, autoloads plugins and unloads them on shutdown
//!
//! ```ignore
//! use scion_runtime::ScionRuntime;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // scion.toml:
//!     //   [loader]
//!     //   search_paths = ["plugins"]
//!     //   autoload = ["greeter", "extras.*"]
//!     let runtime = ScionRuntime::new()?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{
    ConfigError, ConfigLoader, ConfigResult, LoaderConfig, LoggingConfig, PluginSettings,
    ScionConfig,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{CLIENT_ID, RuntimeBuilder, ScionRuntime};

pub use tracing;
pub use tracing_subscriber;

/// Logging macros and span helpers.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
