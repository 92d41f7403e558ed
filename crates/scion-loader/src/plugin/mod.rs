//! Plugins: one loadable unit of code each.
//!
//! A [`Plugin`] owns its spec, its load state, the [`Module`] its code runs
//! in, and weak links to the plugins it depends on (children), the plugins
//! depending on it (parents) and, for packages, the plugins nested inside it
//! (sub-modules). Links never keep a plugin alive; the
//! [`PluginRegistry`] does.

mod config;
mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::helpers::short_name;
use crate::module::Module;
use crate::snapshot::DifferenceSet;
use crate::source::ModuleSpec;

pub use config::PluginConfig;
pub use registry::PluginRegistry;

// =============================================================================
// PluginState
// =============================================================================

/// Load state of a plugin.
///
/// ```text
/// register() ──► Undefined
///     load()  ──► Loaded        (body and entry point succeeded)
///             ──► Unsatisfied   (body asked to be skipped)
///   unload()  ──► Unloaded      (Loaded only)
///     load()  ──► Loaded | Unsatisfied   (from Unloaded / Unsatisfied)
/// ```
///
/// A failed load leaves the state the plugin had before the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginState {
    /// Registered, never executed.
    Undefined,
    /// Executed successfully and live.
    Loaded,
    /// Torn down after having been loaded.
    Unloaded,
    /// Last execution opted out of loading.
    Unsatisfied,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Undefined => "undefined",
            Self::Loaded => "loaded",
            Self::Unloaded => "unloaded",
            Self::Unsatisfied => "unsatisfied",
        })
    }
}

// =============================================================================
// Plugin
// =============================================================================

#[derive(Clone)]
struct Link {
    plugin: Weak<Plugin>,
    declared: bool,
}

struct PluginInner {
    state: PluginState,
    module: Option<Arc<Module>>,
    config: PluginConfig,
    child_plugins: BTreeMap<String, Link>,
    parent_plugins: BTreeMap<String, Link>,
    sub_module_plugins: BTreeMap<String, Weak<Plugin>>,
    snapshot_difference: Option<DifferenceSet>,
    snapshot_extractions: Vec<DifferenceSet>,
}

/// One loadable unit of code.
///
/// Exactly one `Plugin` exists per name within a loader. Equality and
/// hashing go by name.
pub struct Plugin {
    name: String,
    spec: ModuleSpec,
    inner: Mutex<PluginInner>,
}

fn upgrade_all<'a>(links: impl Iterator<Item = &'a Weak<Plugin>>) -> Vec<Arc<Plugin>> {
    links.filter_map(Weak::upgrade).collect()
}

impl Plugin {
    pub(crate) fn new(spec: ModuleSpec, config: PluginConfig) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name().to_string(),
            spec,
            inner: Mutex::new(PluginInner {
                state: PluginState::Undefined,
                module: None,
                config,
                child_plugins: BTreeMap::new(),
                parent_plugins: BTreeMap::new(),
                sub_module_plugins: BTreeMap::new(),
                snapshot_difference: None,
                snapshot_extractions: Vec::new(),
            }),
        })
    }

    // ─── Identity ────────────────────────────────────────────────────────────

    /// Dotted name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last dotted component.
    pub fn short_name(&self) -> &str {
        short_name(&self.name)
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        self.spec.path()
    }

    pub fn spec(&self) -> &ModuleSpec {
        &self.spec
    }

    pub fn is_package(&self) -> bool {
        self.spec.is_package()
    }

    // ─── State ───────────────────────────────────────────────────────────────

    pub fn state(&self) -> PluginState {
        self.inner.lock().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == PluginState::Loaded
    }

    pub(crate) fn set_state(&self, state: PluginState) {
        self.inner.lock().state = state;
    }

    /// The plugin's module, once it has been executed at least once.
    pub fn module(&self) -> Option<Arc<Module>> {
        self.inner.lock().module.clone()
    }

    pub(crate) fn set_module(&self, module: Option<Arc<Module>>) {
        self.inner.lock().module = module;
    }

    /// A copy of the current configuration.
    pub fn config(&self) -> PluginConfig {
        self.inner.lock().config.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().config.locked
    }

    pub(crate) fn merge_config(&self, config: PluginConfig) {
        self.inner.lock().config.merge(config);
    }

    // ─── Links ───────────────────────────────────────────────────────────────

    /// Plugins this one depends on.
    pub fn child_plugins(&self) -> Vec<Arc<Plugin>> {
        let inner = self.inner.lock();
        upgrade_all(inner.child_plugins.values().map(|link| &link.plugin))
    }

    /// Plugins depending on this one.
    pub fn parent_plugins(&self) -> Vec<Arc<Plugin>> {
        let inner = self.inner.lock();
        upgrade_all(inner.parent_plugins.values().map(|link| &link.plugin))
    }

    /// Plugins nested inside this package.
    pub fn sub_module_plugins(&self) -> Vec<Arc<Plugin>> {
        let inner = self.inner.lock();
        upgrade_all(inner.sub_module_plugins.values())
    }

    /// Names of the plugins this one depends on, sorted.
    pub fn child_names(&self) -> Vec<String> {
        self.inner.lock().child_plugins.keys().cloned().collect()
    }

    /// `true` when this plugin depends on `name`.
    pub fn depends_on(&self, name: &str) -> bool {
        self.inner.lock().child_plugins.contains_key(name)
    }

    /// `true` when this plugin depends on `name`, directly or through other
    /// plugins.
    pub fn depends_on_transitively(&self, name: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut pending = self.child_plugins();
        while let Some(plugin) = pending.pop() {
            if plugin.name == name {
                return true;
            }
            if seen.insert(plugin.name.clone()) {
                pending.extend(plugin.child_plugins());
            }
        }
        false
    }

    /// Records that `parent` depends on `child`, on both sides.
    ///
    /// A declared link stays declared if the same edge is later discovered.
    pub(crate) fn link(parent: &Arc<Plugin>, child: &Arc<Plugin>, declared: bool) {
        {
            let mut inner = parent.inner.lock();
            let link = inner
                .child_plugins
                .entry(child.name.clone())
                .or_insert_with(|| Link {
                    plugin: Arc::downgrade(child),
                    declared,
                });
            link.declared |= declared;
        }
        let mut inner = child.inner.lock();
        let link = inner
            .parent_plugins
            .entry(parent.name.clone())
            .or_insert_with(|| Link {
                plugin: Arc::downgrade(parent),
                declared,
            });
        link.declared |= declared;
    }

    /// Drops discovered links to children, before the body runs again.
    pub(crate) fn clear_discovered_children(self: &Arc<Self>) {
        let children = take_discovered(&mut self.inner.lock().child_plugins);
        for child in children {
            child.inner.lock().parent_plugins.remove(&self.name);
        }
    }

    /// Drops every discovered link in both directions. Declared links stay.
    pub(crate) fn clear_discovered_links(self: &Arc<Self>) {
        self.clear_discovered_children();
        let parents = take_discovered(&mut self.inner.lock().parent_plugins);
        for parent in parents {
            parent.inner.lock().child_plugins.remove(&self.name);
        }
    }

    /// Drops every link, declared ones and sub-modules included.
    pub(crate) fn clear_all_links(self: &Arc<Self>) {
        let (children, parents) = {
            let mut inner = self.inner.lock();
            inner.sub_module_plugins.clear();
            (
                std::mem::take(&mut inner.child_plugins),
                std::mem::take(&mut inner.parent_plugins),
            )
        };
        for child in children.values().filter_map(|link| link.plugin.upgrade()) {
            child.inner.lock().parent_plugins.remove(&self.name);
        }
        for parent in parents.values().filter_map(|link| link.plugin.upgrade()) {
            let mut inner = parent.inner.lock();
            inner.child_plugins.remove(&self.name);
            inner.sub_module_plugins.remove(&self.name);
        }
    }

    pub(crate) fn add_sub_module(&self, plugin: &Arc<Plugin>) {
        self.inner
            .lock()
            .sub_module_plugins
            .insert(plugin.name.clone(), Arc::downgrade(plugin));
    }

    pub(crate) fn remove_sub_module(&self, name: &str) {
        self.inner.lock().sub_module_plugins.remove(name);
    }

    // ─── Snapshots ───────────────────────────────────────────────────────────

    /// Side effects recorded by the last successful load.
    pub fn snapshot_difference(&self) -> Option<DifferenceSet> {
        self.inner.lock().snapshot_difference.clone()
    }

    pub(crate) fn set_snapshot_difference(&self, difference: Option<DifferenceSet>) {
        self.inner.lock().snapshot_difference = difference;
    }

    pub(crate) fn take_snapshot_difference(&self) -> Option<DifferenceSet> {
        self.inner.lock().snapshot_difference.take()
    }

    /// Differences of plugins loaded inline while this one executed.
    pub fn snapshot_extractions(&self) -> Vec<DifferenceSet> {
        self.inner.lock().snapshot_extractions.clone()
    }

    pub(crate) fn push_extraction(&self, difference: DifferenceSet) {
        self.inner.lock().snapshot_extractions.push(difference);
    }

    pub(crate) fn take_extractions(&self) -> Vec<DifferenceSet> {
        std::mem::take(&mut self.inner.lock().snapshot_extractions)
    }
}

fn take_discovered(links: &mut BTreeMap<String, Link>) -> Vec<Arc<Plugin>> {
    let names: Vec<String> = links
        .iter()
        .filter(|(_, link)| !link.declared)
        .map(|(name, _)| name.clone())
        .collect();
    names
        .iter()
        .filter_map(|name| links.remove(name))
        .filter_map(|link| link.plugin.upgrade())
        .collect()
}

impl PartialEq for Plugin {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Plugin {}

impl Hash for Plugin {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("children", &self.child_names())
            .finish()
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
