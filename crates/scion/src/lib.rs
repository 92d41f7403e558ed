//! # Scion
//!
//! A hot-reloading plugin host.
//!
//! ## Overview
//!
//! Plugins are modules whose bodies register side effects (event handlers,
//! commands) on a shared [`Client`](prelude::Client). The loader records what
//! every plugin changed, so unloading or reloading a plugin rolls back exactly
//! its own effects, and keeps plugins that depend on each other in step:
//!
//! ```text
//! ┌──────────────┐   load/unload/reload   ┌──────────────┐   snapshots   ┌────────────┐
//! │ ScionRuntime │───────────────────────▶│ PluginLoader │──────────────▶│   Client   │
//! │ (config,     │                        │ trees, tasks │               │ events     │
//! │  logging)    │                        │ pipeline     │◀──────────────│ commands   │
//! └──────────────┘                        └──────┬───────┘   diffs       └────────────┘
//!                                                │ module bodies
//!                                         ┌──────▼───────┐
//!                                         │ ModuleCatalog│
//!                                         └──────────────┘
//! ```
//!
//! - **scion-core**: the client and its registries
//! - **scion-loader**: plugins, dependency trees, the staged pipeline, snapshots
//! - **scion-runtime**: configuration, logging and lifecycle
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use scion::prelude::*;
//!
//! async fn on_ready(_: Event) {}
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(ModuleCatalog::new());
//!     catalog.insert("greeter", |scope| {
//!         scope.on_event("ready", on_ready)?;
//!         Ok(())
//!     });
//!
//!     let loader = PluginLoader::new(Client::new("bot"), catalog.clone());
//!     loader.load("greeter").await?;
//!     loader.reload("greeter").await?;
//!     loader.unload_all().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: TOML configuration files
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use scion_core as core;
pub use scion_loader as loader;
pub use scion_runtime as runtime;

/// Everything a plugin host or a plugin body usually needs.
pub mod prelude {
    pub use std::sync::Arc;

    // Runtime - configured entry point
    pub use scion_runtime::{ScionConfig, ScionRuntime};

    // Shared context plugins mutate
    pub use scion_core::{Client, Event};

    // Loading and reloading
    pub use scion_loader::{
        BlockingPluginLoader, LoaderError, ModuleCatalog, PluginConfig, PluginLoader,
        PluginState,
    };

    // Writing plugin bodies
    pub use scion_loader::{BodyError, BodyResult, Hook, ModuleScope, Variable};
}
