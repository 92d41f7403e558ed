//! Turning user input into plugins.
//!
//! Every loader operation accepts anything convertible into a
//! [`PluginSelector`]: names, `pkg.*` wildcards, source paths, plugin
//! handles, trees, or collections of those. [`PluginExtractor`] resolves a
//! selector against the registry first and the source provider second.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PluginError, PluginResult};
use crate::helpers::{is_sub_module_of, wildcard_prefix};
use crate::plugin::{Plugin, PluginRegistry};
use crate::source::{ModuleSpec, SourceProvider};
use crate::tree::PluginTree;

/// What a loader operation should act on.
#[derive(Debug, Clone)]
pub enum PluginSelector {
    /// A dotted name, or `pkg.*` for everything inside `pkg`.
    Name(String),
    /// A source file.
    Path(PathBuf),
    /// A plugin handle.
    Plugin(Arc<Plugin>),
    /// Every plugin of a tree.
    Tree(PluginTree),
    /// Several selectors.
    Many(Vec<PluginSelector>),
}

impl From<&str> for PluginSelector {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for PluginSelector {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<&String> for PluginSelector {
    fn from(name: &String) -> Self {
        Self::Name(name.clone())
    }
}

impl From<&Path> for PluginSelector {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for PluginSelector {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<Arc<Plugin>> for PluginSelector {
    fn from(plugin: Arc<Plugin>) -> Self {
        Self::Plugin(plugin)
    }
}

impl From<&Arc<Plugin>> for PluginSelector {
    fn from(plugin: &Arc<Plugin>) -> Self {
        Self::Plugin(Arc::clone(plugin))
    }
}

impl From<PluginTree> for PluginSelector {
    fn from(tree: PluginTree) -> Self {
        Self::Tree(tree)
    }
}

impl From<&PluginTree> for PluginSelector {
    fn from(tree: &PluginTree) -> Self {
        Self::Tree(tree.clone())
    }
}

impl<T: Into<PluginSelector>> From<Vec<T>> for PluginSelector {
    fn from(items: Vec<T>) -> Self {
        Self::Many(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<PluginSelector>, const N: usize> From<[T; N]> for PluginSelector {
    fn from(items: [T; N]) -> Self {
        Self::Many(items.into_iter().map(Into::into).collect())
    }
}

/// One resolved selector entry.
#[derive(Debug, Clone)]
pub enum Extracted {
    /// Already registered.
    Plugin(Arc<Plugin>),
    /// Discoverable through the source provider, not registered yet.
    Spec(ModuleSpec),
}

impl Extracted {
    pub fn name(&self) -> &str {
        match self {
            Self::Plugin(plugin) => plugin.name(),
            Self::Spec(spec) => spec.name(),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Plugin(plugin) => plugin.path(),
            Self::Spec(spec) => spec.path(),
        }
    }
}

/// Resolves selectors against a registry and a source provider.
pub struct PluginExtractor<'a> {
    registry: &'a PluginRegistry,
    source: &'a dyn SourceProvider,
}

impl<'a> PluginExtractor<'a> {
    pub fn new(registry: &'a PluginRegistry, source: &'a dyn SourceProvider) -> Self {
        Self { registry, source }
    }

    /// Resolves `selector`, without duplicates, in first-seen order.
    ///
    /// Fails with [`PluginError::NotFound`] on the first entry that matches
    /// nothing.
    pub fn extract(&self, selector: &PluginSelector) -> PluginResult<Vec<Extracted>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        self.collect(selector, &mut seen, &mut out)?;
        Ok(out)
    }

    /// Like [`extract`](Self::extract) but only accepts registered plugins.
    pub fn extract_registered(&self, selector: &PluginSelector) -> PluginResult<Vec<Arc<Plugin>>> {
        self.extract(selector)?
            .into_iter()
            .map(|entry| match entry {
                Extracted::Plugin(plugin) => Ok(plugin),
                Extracted::Spec(spec) => Err(PluginError::not_found(spec.name())),
            })
            .collect()
    }

    pub fn extract_names(&self, selector: &PluginSelector) -> PluginResult<Vec<String>> {
        Ok(self
            .extract(selector)?
            .iter()
            .map(|entry| entry.name().to_string())
            .collect())
    }

    pub fn extract_paths(&self, selector: &PluginSelector) -> PluginResult<Vec<PathBuf>> {
        Ok(self
            .extract(selector)?
            .iter()
            .map(|entry| entry.path().to_path_buf())
            .collect())
    }

    fn collect(
        &self,
        selector: &PluginSelector,
        seen: &mut BTreeSet<String>,
        out: &mut Vec<Extracted>,
    ) -> PluginResult<()> {
        let entries = match selector {
            PluginSelector::Name(name) => self.resolve_name(name)?,
            PluginSelector::Path(path) => vec![self.resolve_path(path)?],
            PluginSelector::Plugin(plugin) => vec![self.resolve_plugin(plugin)],
            PluginSelector::Tree(tree) => tree
                .plugins()
                .map(|plugin| self.resolve_plugin(plugin))
                .collect(),
            PluginSelector::Many(selectors) => {
                for selector in selectors {
                    self.collect(selector, seen, out)?;
                }
                return Ok(());
            }
        };
        for entry in entries {
            if seen.insert(entry.name().to_string()) {
                out.push(entry);
            }
        }
        Ok(())
    }

    fn resolve_name(&self, name: &str) -> PluginResult<Vec<Extracted>> {
        if let Some(plugin) = self.registry.get(name) {
            return Ok(vec![Extracted::Plugin(plugin)]);
        }
        if let Some(package) = wildcard_prefix(name) {
            let mut entries: Vec<Extracted> = self
                .registry
                .with_prefix(package)
                .into_iter()
                .map(Extracted::Plugin)
                .collect();
            for found in self.source.names() {
                if is_sub_module_of(&found, package) && !self.registry.contains(&found) {
                    if let Some(spec) = self.source.find_spec(&found) {
                        entries.push(Extracted::Spec(spec));
                    }
                }
            }
            if entries.is_empty() {
                return Err(PluginError::not_found(name));
            }
            entries.sort_by(|a, b| a.name().cmp(b.name()));
            return Ok(entries);
        }
        self.source
            .find_spec(name)
            .map(|spec| vec![Extracted::Spec(spec)])
            .ok_or_else(|| PluginError::not_found(name))
    }

    fn resolve_path(&self, path: &Path) -> PluginResult<Extracted> {
        if let Some(plugin) = self.registry.get_by_path(path) {
            return Ok(Extracted::Plugin(plugin));
        }
        let name = self.source.name_for_path(path);
        if let Some(plugin) = self.registry.get(&name) {
            return Ok(Extracted::Plugin(plugin));
        }
        self.source
            .find_spec(&name)
            .map(Extracted::Spec)
            .ok_or_else(|| PluginError::not_found(path.display().to_string()))
    }

    /// A stale handle (removed, or replaced by a newer registration) falls
    /// back to its spec.
    fn resolve_plugin(&self, plugin: &Arc<Plugin>) -> Extracted {
        if self.registry.contains_plugin(plugin) {
            Extracted::Plugin(Arc::clone(plugin))
        } else {
            Extracted::Spec(plugin.spec().clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{BodyResult, ModuleScope};
    use crate::plugin::PluginConfig;
    use crate::source::ModuleCatalog;

    fn noop(_: &mut ModuleScope<'_>) -> BodyResult {
        Ok(())
    }

    fn setup() -> (PluginRegistry, ModuleCatalog) {
        let catalog = ModuleCatalog::new();
        catalog.insert_package("pkg", noop);
        catalog.insert("pkg.a", noop);
        catalog.insert("pkg.b", noop);
        catalog.insert("solo", noop);
        let mut registry = PluginRegistry::new();
        if let Some(spec) = catalog.find_spec("pkg.a") {
            registry.insert(Plugin::new(spec, PluginConfig::default()));
        }
        (registry, catalog)
    }

    #[test]
    fn test_names_and_wildcards() {
        let (registry, catalog) = setup();
        let extractor = PluginExtractor::new(&registry, &catalog);

        let entries = extractor
            .extract(&PluginSelector::from(["pkg.*", "solo", "pkg.a"]))
            .unwrap();
        let names: Vec<_> = entries.iter().map(Extracted::name).collect();
        assert_eq!(names, vec!["pkg.a", "pkg.b", "solo"]);
        assert!(matches!(entries[0], Extracted::Plugin(_)));
        assert!(matches!(entries[1], Extracted::Spec(_)));
    }

    #[test]
    fn test_paths() {
        let (registry, catalog) = setup();
        let extractor = PluginExtractor::new(&registry, &catalog);
        let names = extractor
            .extract_names(&PluginSelector::from(vec![
                PathBuf::from("memory/pkg/a.rs"),
                PathBuf::from("memory/pkg/mod.rs"),
            ]))
            .unwrap();
        assert_eq!(names, vec!["pkg.a", "pkg"]);
    }

    #[test]
    fn test_not_found() {
        let (registry, catalog) = setup();
        let extractor = PluginExtractor::new(&registry, &catalog);
        assert!(matches!(
            extractor.extract(&"missing".into()),
            Err(PluginError::NotFound { name }) if name == "missing"
        ));
        assert!(extractor.extract(&"nothing.*".into()).is_err());
        assert!(extractor.extract_registered(&"solo".into()).is_err());
        assert_eq!(extractor.extract_registered(&"pkg.a".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_stale_handle_falls_back_to_spec() {
        let (registry, catalog) = setup();
        let stale = Plugin::new(
            catalog.find_spec("pkg.a").unwrap(),
            PluginConfig::default(),
        );
        let extractor = PluginExtractor::new(&registry, &catalog);
        let entries = extractor.extract(&PluginSelector::from(&stale)).unwrap();
        assert!(matches!(entries[0], Extracted::Spec(_)));
    }
}
