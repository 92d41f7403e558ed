//! # Scion Loader
//!
//! Hot-reloading plugin loader.
//!
//! Plugins are units of code resolved by a [`SourceProvider`] and executed
//! inside a [`Module`]. While a plugin loads, the loader records:
//!
//! - the plugins it depends on, discovered through [`ModuleScope::import`]
//!   or declared up front with [`PluginConfig::requires`]
//! - the side effects it has on the shared [`Client`](scion_core::Client),
//!   as a snapshot difference that is reverted when it unloads
//!
//! Related plugins form [`PluginTree`]s which are loaded dependencies first
//! and unloaded dependents first. Concurrent requests for the same plugin
//! share one task, and failures in a batch are collected into a single
//! [`PluginBatchError`].
//!
//! ```rust,ignore
//! use scion_loader::prelude::*;
//!
//! let catalog = Arc::new(ModuleCatalog::new());
//! catalog.insert("storage", |scope| {
//!     scope.set("items", Mutex::new(Vec::<String>::new()))?;
//!     Ok(())
//! });
//! catalog.insert("notes", |scope| {
//!     let storage = scope.import("storage")?;
//!     scope.command("note", "Stores a note", move |args: Vec<String>| { /* ... */ })?;
//!     Ok(())
//! });
//!
//! let loader = PluginLoader::new(Client::new("main"), catalog);
//! loader.load("notes").await?; // loads storage first
//! ```

pub mod error;
pub mod extractor;
pub mod helpers;
pub mod loader;
pub mod module;
pub mod plugin;
pub mod snapshot;
pub mod source;
pub mod tree;

pub use error::{
    BoxError, LoaderError, LoaderResult, PluginBatchError, PluginError, PluginResult, SharedError,
};
pub use extractor::{Extracted, PluginExtractor, PluginSelector};
pub use loader::{
    Actions, BlockingPluginLoader, DEFAULT_ENTRY_POINT, DEFAULT_EXIT_POINT, LoadStatus,
    PluginLoader, PluginLoaderBuilder, UnloadStatus, WeakPluginLoader,
};
pub use module::{
    BodyError, BodyResult, Hook, HookResult, LoadOutcome, Module, ModuleBody, ModuleScope,
    Variable, Variables,
};
pub use plugin::{Plugin, PluginConfig, PluginRegistry, PluginState};
pub use snapshot::{
    Commands, DifferenceSet, EventHandlers, Snapshot, SnapshotDifference, SnapshotKind,
    SnapshotSet, SnapshotType, snapshot_kind,
};
pub use source::{ModuleCatalog, ModuleSpec, STATIC_MODULES, SourceProvider, StaticModule};
pub use tree::{PluginAction, PluginTree, PluginTreeIterator};

/// Re-exported for [`STATIC_MODULES`] registrations.
pub use linkme;

/// Everything a plugin host usually needs.
pub mod prelude {
    pub use std::sync::Arc;

    pub use scion_core::{Client, Event};

    pub use crate::{
        BodyError, BodyResult, Hook, LoaderError, ModuleCatalog, ModuleScope, PluginConfig,
        PluginLoader, PluginState, Variable,
    };
}
