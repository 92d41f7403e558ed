//! Plugin trees: sets of plugins that have to be handled together.
//!
//! A [`PluginTree`] is the closure of a seed plugin over its dependency,
//! dependent and sub-module links. Trees are immutable; set operations
//! produce new trees. The dependency order of a tree is computed once and
//! cached.

mod iterator;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use tracing::trace;

use crate::error::{PluginError, PluginResult};
use crate::plugin::Plugin;

pub use iterator::{PluginAction, PluginTreeIterator};

struct TreeInner {
    plugins: BTreeMap<String, Arc<Plugin>>,
    sorted: OnceLock<PluginResult<Vec<Arc<Plugin>>>>,
}

/// An immutable set of related plugins with a cached dependency order.
///
/// Two trees are equal when they hold the same plugin names.
#[derive(Clone)]
pub struct PluginTree(Arc<TreeInner>);

impl PluginTree {
    /// The tree grown from `seed`.
    ///
    /// With `deep`, walks children, parents and sub-modules breadth first
    /// until nothing new is reached. Otherwise the tree is just the seed.
    pub fn new(seed: &Arc<Plugin>, deep: bool) -> Self {
        let mut plugins = BTreeMap::new();
        plugins.insert(seed.name().to_string(), Arc::clone(seed));
        if deep {
            let mut queue = VecDeque::from([Arc::clone(seed)]);
            while let Some(plugin) = queue.pop_front() {
                let related = plugin
                    .child_plugins()
                    .into_iter()
                    .chain(plugin.parent_plugins())
                    .chain(plugin.sub_module_plugins());
                for next in related {
                    if !plugins.contains_key(next.name()) {
                        plugins.insert(next.name().to_string(), Arc::clone(&next));
                        queue.push_back(next);
                    }
                }
            }
        }
        trace!(seed = %seed.name(), size = plugins.len(), deep, "Plugin tree built");
        Self::from_map(plugins)
    }

    /// A tree of exactly these plugins.
    pub fn from_plugins(plugins: impl IntoIterator<Item = Arc<Plugin>>) -> Self {
        Self::from_map(
            plugins
                .into_iter()
                .map(|plugin| (plugin.name().to_string(), plugin))
                .collect(),
        )
    }

    fn from_map(plugins: BTreeMap<String, Arc<Plugin>>) -> Self {
        Self(Arc::new(TreeInner {
            plugins,
            sorted: OnceLock::new(),
        }))
    }

    pub fn len(&self) -> usize {
        self.0.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.plugins.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.plugins.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Plugin>> {
        self.0.plugins.get(name)
    }

    /// Plugin names, sorted alphabetically.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.plugins.keys().map(String::as_str)
    }

    /// Plugins, sorted alphabetically.
    pub fn plugins(&self) -> impl Iterator<Item = &Arc<Plugin>> {
        self.0.plugins.values()
    }

    /// Plugins in dependency order: every plugin comes after the plugins it
    /// depends on. Ties go by name.
    ///
    /// Only links between members of the tree count. Fails with
    /// [`PluginError::CircularDependency`] when the links form a cycle.
    pub fn get_plugins_sorted(&self) -> PluginResult<&[Arc<Plugin>]> {
        self.0
            .sorted
            .get_or_init(|| self.sort())
            .as_deref()
            .map_err(Clone::clone)
    }

    /// The plugin that comes last in dependency order, naming the tree.
    ///
    /// `None` for empty or cyclic trees.
    pub fn get_entry_plugin(&self) -> Option<&Arc<Plugin>> {
        self.get_plugins_sorted().ok().and_then(<[_]>::last)
    }

    fn sort(&self) -> PluginResult<Vec<Arc<Plugin>>> {
        let plugins = &self.0.plugins;
        let mut pending: HashMap<&str, usize> = HashMap::with_capacity(plugins.len());
        let mut dependents: HashMap<String, Vec<&str>> = HashMap::new();
        for (name, plugin) in plugins {
            let children: Vec<String> = plugin
                .child_names()
                .into_iter()
                .filter(|child| child != name && plugins.contains_key(child))
                .collect();
            pending.insert(name.as_str(), children.len());
            for child in children {
                dependents.entry(child).or_default().push(name.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut sorted = Vec::with_capacity(plugins.len());
        while let Some(name) = ready.pop_first() {
            if let Some(plugin) = plugins.get(name) {
                sorted.push(Arc::clone(plugin));
            }
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if sorted.len() != plugins.len() {
            let mut cycle: Vec<String> = pending
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            cycle.sort();
            return Err(PluginError::CircularDependency { plugins: cycle });
        }
        Ok(sorted)
    }

    // ─── Set operations ──────────────────────────────────────────────────────

    pub fn is_subset(&self, other: &PluginTree) -> bool {
        self.names().all(|name| other.contains(name))
    }

    pub fn is_superset(&self, other: &PluginTree) -> bool {
        other.is_subset(self)
    }

    /// `true` when the trees share at least one plugin.
    pub fn intersects(&self, other: &PluginTree) -> bool {
        self.names().any(|name| other.contains(name))
    }

    pub fn intersection(&self, other: &PluginTree) -> PluginTree {
        Self::from_map(
            self.0
                .plugins
                .iter()
                .filter(|(name, _)| other.contains(name))
                .map(|(name, plugin)| (name.clone(), Arc::clone(plugin)))
                .collect(),
        )
    }

    pub fn union(&self, other: &PluginTree) -> PluginTree {
        let mut plugins = self.0.plugins.clone();
        for (name, plugin) in &other.0.plugins {
            plugins
                .entry(name.clone())
                .or_insert_with(|| Arc::clone(plugin));
        }
        Self::from_map(plugins)
    }

    /// This tree minus the named plugins.
    pub fn without<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> PluginTree {
        let mut plugins = self.0.plugins.clone();
        for name in names {
            plugins.remove(name);
        }
        Self::from_map(plugins)
    }
}

impl PartialEq for PluginTree {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_subset(other)
    }
}

impl Eq for PluginTree {}

impl Hash for PluginTree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for name in self.names() {
            name.hash(state);
        }
    }
}

impl fmt::Debug for PluginTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginTree")
            .field(&self.names().collect::<Vec<_>>())
            .finish()
    }
}
