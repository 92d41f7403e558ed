//! Error types for the plugin loader.
//!
//! - [`PluginError`]: one failure attributed to one plugin (or, for
//!   dependency cycles, a set of plugins).
//! - [`PluginBatchError`]: every failure collected during one loader call,
//!   together with the [`PluginTreeIterator`]s that drove each phase.
//! - [`LoaderError`]: what the public loader operations return.
//!
//! All three are `Clone` because the same result is handed to every caller
//! awaiting a shared load or unload task.

use std::collections::BTreeSet;
use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::plugin::Plugin;
use crate::tree::{PluginAction, PluginTreeIterator};

/// Boxed error returned by plugin code.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Shareable error cause.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

// =============================================================================
// PluginError
// =============================================================================

/// A failure attributed to a plugin.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// Nothing registered or discoverable matches the name.
    #[error("plugin '{name}' not found")]
    NotFound { name: String },

    /// The plugin's source no longer exists.
    #[error("source of plugin '{name}' is missing: {}", path.display())]
    SourceMissing { name: String, path: PathBuf },

    /// The plugin's current source does not compile.
    #[error("syntax error in plugin '{name}': {message}")]
    Syntax { name: String, message: String },

    /// The module body failed.
    #[error("plugin '{name}' failed to load: {source}")]
    Load { name: String, source: SharedError },

    /// The entry point failed.
    #[error("entry point of plugin '{name}' failed: {source}")]
    EntryPoint { name: String, source: SharedError },

    /// The exit point failed.
    #[error("exit point of plugin '{name}' failed: {source}")]
    ExitPoint { name: String, source: SharedError },

    /// A named entry/exit point is not defined by the module.
    #[error("plugin '{name}' has no hook named '{hook}'")]
    MissingHook { name: String, hook: String },

    /// A load was requested for a plugin that is already mid-load.
    #[error("circular load of plugin '{name}' (loading: {})", chain.join(" -> "))]
    CircularLoad { name: String, chain: Vec<String> },

    /// The dependency graph of a tree contains a cycle.
    #[error("plugin dependency cycle detected among: {}", plugins.join(", "))]
    CircularDependency { plugins: Vec<String> },

    /// An injected variable collides with a reserved module attribute.
    #[error("variable '{variable}' of plugin '{name}' uses a reserved name")]
    ReservedVariable { name: String, variable: String },

    /// Locked plugins cannot be removed from the registry.
    #[error("plugin '{name}' is locked")]
    Locked { name: String },

    /// Loaded plugins cannot be removed from the registry.
    #[error("plugin '{name}' is loaded and cannot be removed")]
    StillLoaded { name: String },

    /// An imported plugin did not end up loaded.
    #[error("plugin '{name}' requires '{dependency}', which is not loaded")]
    DependencyUnsatisfied { name: String, dependency: String },

    /// The executor task running plugin code died.
    #[error("task for plugin '{name}' aborted: {message}")]
    Join { name: String, message: String },
}

impl PluginError {
    /// Creates a [`PluginError::NotFound`].
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a [`PluginError::Load`] from any error.
    pub fn load(name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Load {
            name: name.into(),
            source: Arc::from(source.into()),
        }
    }

    /// Creates a [`PluginError::EntryPoint`].
    pub fn entry_point(name: impl Into<String>, source: BoxError) -> Self {
        Self::EntryPoint {
            name: name.into(),
            source: Arc::from(source),
        }
    }

    /// Creates a [`PluginError::ExitPoint`].
    pub fn exit_point(name: impl Into<String>, source: BoxError) -> Self {
        Self::ExitPoint {
            name: name.into(),
            source: Arc::from(source),
        }
    }

    /// Names of the plugins this error is directly about.
    pub fn plugin_names(&self) -> Vec<&str> {
        match self {
            Self::CircularDependency { plugins } => plugins.iter().map(String::as_str).collect(),
            Self::NotFound { name }
            | Self::SourceMissing { name, .. }
            | Self::Syntax { name, .. }
            | Self::Load { name, .. }
            | Self::EntryPoint { name, .. }
            | Self::ExitPoint { name, .. }
            | Self::MissingHook { name, .. }
            | Self::CircularLoad { name, .. }
            | Self::ReservedVariable { name, .. }
            | Self::Locked { name }
            | Self::StillLoaded { name }
            | Self::DependencyUnsatisfied { name, .. }
            | Self::Join { name, .. } => vec![name.as_str()],
        }
    }

    /// `true` for [`PluginError::CircularLoad`], directly or in the cause chain.
    pub fn is_circular_load(&self) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(error) = current {
            let error = unwrap_shared(error);
            if let Some(PluginError::CircularLoad { .. }) = error.downcast_ref::<PluginError>() {
                return true;
            }
            current = error.source();
        }
        false
    }
}

/// Result type for single-plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

// =============================================================================
// PluginBatchError
// =============================================================================

/// Every failure collected while running one loader call.
///
/// Per-plugin errors never abort a batch; they are gathered here and
/// returned once at the end, alongside the iterators of each phase so the
/// caller can see which trees succeeded, failed, or were cancelled.
#[derive(Debug, Clone)]
pub struct PluginBatchError {
    causes: Vec<PluginError>,
    iterators: Vec<PluginTreeIterator>,
}

impl PluginBatchError {
    pub(crate) fn new(causes: Vec<PluginError>, iterators: Vec<PluginTreeIterator>) -> Self {
        Self { causes, iterators }
    }

    /// The individual failures, in the order they happened.
    pub fn causes(&self) -> &[PluginError] {
        &self.causes
    }

    /// One human readable line per cause.
    pub fn messages(&self) -> Vec<String> {
        self.causes.iter().map(ToString::to_string).collect()
    }

    /// The iterators used, one per executed phase.
    pub fn iterators(&self) -> &[PluginTreeIterator] {
        &self.iterators
    }

    /// The iterator of a given phase, if that phase ran.
    pub fn iterator(&self, action: PluginAction) -> Option<&PluginTreeIterator> {
        self.iterators.iter().find(|it| it.action() == action)
    }

    /// Names of every plugin implicated by a cause.
    ///
    /// Cause chains are followed, so a plugin that failed because a plugin
    /// it imported failed reports both, and nested batches are unwrapped.
    pub fn plugin_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for cause in &self.causes {
            collect_names(cause, &mut names);
        }
        names
    }

    /// Every implicated plugin that took part in this batch.
    pub fn get_plugins(&self) -> Vec<Arc<Plugin>> {
        let names = self.plugin_names();
        let mut plugins: Vec<Arc<Plugin>> = Vec::new();
        for iterator in &self.iterators {
            for plugin in iterator.plugins() {
                if names.contains(plugin.name())
                    && !plugins.iter().any(|p| p.name() == plugin.name())
                {
                    plugins.push(plugin);
                }
            }
        }
        plugins.sort_by(|a, b| a.name().cmp(b.name()));
        plugins
    }
}

/// Looks through the `Arc` wrapper used for shared causes.
fn unwrap_shared<'a>(error: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    match error.downcast_ref::<SharedError>() {
        Some(shared) => shared.as_ref(),
        None => error,
    }
}

fn collect_names(error: &(dyn StdError + 'static), names: &mut BTreeSet<String>) {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(error) = current {
        let error = unwrap_shared(error);
        if let Some(plugin_error) = error.downcast_ref::<PluginError>() {
            names.extend(plugin_error.plugin_names().into_iter().map(str::to_string));
        } else if let Some(batch) = error.downcast_ref::<PluginBatchError>() {
            names.extend(batch.plugin_names());
        }
        current = error.source();
    }
}

impl fmt::Display for PluginBatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} plugin operation(s) failed", self.causes.len())?;
        for message in self.messages() {
            write!(f, "\n  - {message}")?;
        }
        Ok(())
    }
}

impl StdError for PluginBatchError {}

// =============================================================================
// LoaderError
// =============================================================================

/// Error returned by the public [`PluginLoader`](crate::PluginLoader) operations.
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    /// Raised before any tree was scheduled (resolution failure, reserved
    /// variable, removing a loaded plugin).
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// One or more per-plugin failures during the pipeline.
    #[error(transparent)]
    Batch(#[from] PluginBatchError),
}

impl LoaderError {
    /// The batch error, if this is one.
    pub fn batch(&self) -> Option<&PluginBatchError> {
        match self {
            Self::Batch(batch) => Some(batch),
            Self::Plugin(_) => None,
        }
    }

    /// Names of every implicated plugin.
    pub fn plugin_names(&self) -> BTreeSet<String> {
        match self {
            Self::Batch(batch) => batch.plugin_names(),
            Self::Plugin(error) => {
                let mut names = BTreeSet::new();
                collect_names(error, &mut names);
                names
            }
        }
    }
}

/// Result type for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
