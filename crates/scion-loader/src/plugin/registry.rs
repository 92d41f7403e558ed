//! Name and path lookup for registered plugins.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::helpers::{is_sub_module_of, parent_name};

use super::Plugin;

/// The loader's table of registered plugins.
///
/// Owns the only strong references the loader keeps; a plugin dropped from
/// here is gone once in-flight work releases it.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    by_name: BTreeMap<String, Arc<Plugin>>,
    by_path: HashMap<PathBuf, String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Plugin>> {
        self.by_name.get(name).cloned()
    }

    pub fn get_by_path(&self, path: &Path) -> Option<Arc<Plugin>> {
        self.by_path.get(path).and_then(|name| self.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// `true` when this exact plugin object is registered.
    pub fn contains_plugin(&self, plugin: &Arc<Plugin>) -> bool {
        self.by_name
            .get(plugin.name())
            .is_some_and(|registered| Arc::ptr_eq(registered, plugin))
    }

    /// All plugins, sorted by name.
    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.by_name.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Plugins nested under the package `name`, at any depth.
    pub fn with_prefix(&self, name: &str) -> Vec<Arc<Plugin>> {
        self.by_name
            .values()
            .filter(|plugin| is_sub_module_of(plugin.name(), name))
            .cloned()
            .collect()
    }

    /// The closest registered package enclosing `name`.
    pub fn nearest_package(&self, name: &str) -> Option<Arc<Plugin>> {
        let mut current = parent_name(name);
        while let Some(candidate) = current {
            if let Some(plugin) = self.by_name.get(candidate) {
                if plugin.is_package() {
                    return Some(Arc::clone(plugin));
                }
            }
            current = parent_name(candidate);
        }
        None
    }

    pub(crate) fn insert(&mut self, plugin: Arc<Plugin>) {
        self.by_path
            .insert(plugin.path().to_path_buf(), plugin.name().to_string());
        self.by_name.insert(plugin.name().to_string(), plugin);
    }

    /// Drops the plugin and every path alias pointing at it.
    pub(crate) fn remove(&mut self, name: &str) -> Option<Arc<Plugin>> {
        let plugin = self.by_name.remove(name)?;
        self.by_path.retain(|_, alias| alias != name);
        Some(plugin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginConfig;
    use crate::source::ModuleSpec;

    fn plugin(name: &str, is_package: bool) -> Arc<Plugin> {
        let file = if is_package {
            format!("memory/{}/mod.rs", name.replace('.', "/"))
        } else {
            format!("memory/{}.rs", name.replace('.', "/"))
        };
        Plugin::new(
            ModuleSpec::new(name, file, is_package),
            PluginConfig::default(),
        )
    }

    #[test]
    fn test_lookup_by_name_and_path() {
        let mut registry = PluginRegistry::new();
        registry.insert(plugin("a.b", false));
        assert!(registry.contains("a.b"));
        assert_eq!(
            registry
                .get_by_path(Path::new("memory/a/b.rs"))
                .unwrap()
                .name(),
            "a.b"
        );

        registry.remove("a.b");
        assert!(registry.get_by_path(Path::new("memory/a/b.rs")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_nearest_package() {
        let mut registry = PluginRegistry::new();
        registry.insert(plugin("pkg", true));
        registry.insert(plugin("pkg.inner", false));
        registry.insert(plugin("pkg.inner.deep", false));
        assert_eq!(
            registry.nearest_package("pkg.inner.deep").unwrap().name(),
            "pkg"
        );
        assert!(registry.nearest_package("pkg").is_none());
        assert_eq!(registry.with_prefix("pkg").len(), 2);
    }
}
