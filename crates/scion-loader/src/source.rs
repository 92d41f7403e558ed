//! Where plugin code comes from.
//!
//! The loader never executes files itself; it asks a [`SourceProvider`] to
//! map a dotted name to a [`ModuleSpec`], to tell whether the backing file
//! still exists, to compile-check it, and to hand over the executable
//! [`ModuleBody`].
//!
//! [`ModuleCatalog`] is the built-in provider. Bodies are registered in code
//! (or contributed at link time through [`STATIC_MODULES`]), while paths,
//! existence and syntax state follow the plugin files under the catalog's
//! root when one is configured.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use linkme::distributed_slice;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{PluginError, PluginResult};
use crate::helpers::{is_package_path, name_to_relative_path, path_to_name};
use crate::module::{BodyResult, ModuleBody, ModuleScope};

// =============================================================================
// ModuleSpec
// =============================================================================

/// Location of one plugin module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleSpec {
    name: String,
    path: PathBuf,
    is_package: bool,
}

impl ModuleSpec {
    /// Creates a spec.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, is_package: bool) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_package,
        }
    }

    /// Dotted name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` for packages.
    pub fn is_package(&self) -> bool {
        self.is_package
    }
}

// =============================================================================
// SourceProvider
// =============================================================================

/// Resolves plugin names to code.
pub trait SourceProvider: Send + Sync + 'static {
    /// Finds the spec for a dotted name.
    fn find_spec(&self, name: &str) -> Option<ModuleSpec>;

    /// Maps a source path to the name it would be registered under.
    fn name_for_path(&self, path: &Path) -> String {
        path_to_name(&[], path)
    }

    /// `true` while the backing source exists.
    fn exists(&self, spec: &ModuleSpec) -> bool;

    /// Compile-checks the current source without executing it.
    fn check_source(&self, spec: &ModuleSpec) -> PluginResult<()>;

    /// Returns the executable body.
    fn load_source(&self, spec: &ModuleSpec) -> PluginResult<ModuleBody>;

    /// Every name this provider can resolve.
    fn names(&self) -> Vec<String>;
}

// =============================================================================
// Static registration
// =============================================================================

/// A module contributed at link time.
///
/// ```rust,ignore
/// use linkme::distributed_slice;
/// use scion_loader::source::{STATIC_MODULES, StaticModule};
///
/// #[distributed_slice(STATIC_MODULES)]
/// static GREETER: StaticModule = StaticModule {
///     name: "greeter",
///     is_package: false,
///     body: greeter_body,
/// };
/// ```
pub struct StaticModule {
    pub name: &'static str,
    pub is_package: bool,
    pub body: fn(&mut ModuleScope<'_>) -> BodyResult,
}

/// Link-time registry of modules, imported by
/// [`ModuleCatalog::with_static_modules`].
#[distributed_slice]
pub static STATIC_MODULES: [StaticModule];

// =============================================================================
// ModuleCatalog
// =============================================================================

/// Root used for catalogs without a filesystem root.
pub const MEMORY_ROOT: &str = "memory";

enum CatalogSource {
    Body(ModuleBody),
    Broken(String),
}

struct CatalogEntry {
    spec: ModuleSpec,
    source: CatalogSource,
}

/// Name -> module body table.
///
/// Without a root, paths are virtual (`memory/pkg/leaf.rs`) and a module
/// exists for as long as it is in the table. With [`with_root`], paths point
/// into that directory and a module also needs its file on disk.
///
/// [`with_root`]: ModuleCatalog::with_root
pub struct ModuleCatalog {
    roots: Vec<PathBuf>,
    on_disk: bool,
    entries: RwLock<BTreeMap<String, CatalogEntry>>,
}

impl Default for ModuleCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleCatalog {
    /// In-memory catalog.
    pub fn new() -> Self {
        Self {
            roots: vec![PathBuf::from(MEMORY_ROOT)],
            on_disk: false,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Catalog whose modules live under `root` on disk.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
            on_disk: true,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Adds another search root. The first matching root wins.
    pub fn search_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    /// Imports every [`STATIC_MODULES`] entry.
    pub fn with_static_modules(self) -> Self {
        for module in STATIC_MODULES {
            let body = ModuleBody::from_fn(module.body);
            self.insert_spec(self.spec_for(module.name, module.is_package), body);
        }
        debug!(count = STATIC_MODULES.len(), "Imported static modules");
        self
    }

    /// Search roots.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Registers a plain module.
    pub fn insert<F>(&self, name: &str, body: F) -> ModuleSpec
    where
        F: Fn(&mut ModuleScope<'_>) -> BodyResult + Send + Sync + 'static,
    {
        self.insert_spec(self.spec_for(name, false), ModuleBody::new(body))
    }

    /// Registers a package module.
    pub fn insert_package<F>(&self, name: &str, body: F) -> ModuleSpec
    where
        F: Fn(&mut ModuleScope<'_>) -> BodyResult + Send + Sync + 'static,
    {
        self.insert_spec(self.spec_for(name, true), ModuleBody::new(body))
    }

    /// Registers a module by file path. Files outside every root get a
    /// reserved name prefix.
    pub fn insert_path<F>(&self, path: impl AsRef<Path>, body: F) -> ModuleSpec
    where
        F: Fn(&mut ModuleScope<'_>) -> BodyResult + Send + Sync + 'static,
    {
        let path = path.as_ref();
        let spec = ModuleSpec::new(
            path_to_name(&self.roots, path),
            path,
            is_package_path(path),
        );
        self.insert_spec(spec, ModuleBody::new(body))
    }

    /// Swaps in a new body, as if the file had been edited.
    pub fn replace<F>(&self, name: &str, body: F) -> bool
    where
        F: Fn(&mut ModuleScope<'_>) -> BodyResult + Send + Sync + 'static,
    {
        match self.entries.write().get_mut(name) {
            Some(entry) => {
                entry.source = CatalogSource::Body(ModuleBody::new(body));
                trace!(module = %name, "Module source replaced");
                true
            }
            None => false,
        }
    }

    /// Marks the current source as not compiling.
    pub fn break_source(&self, name: &str, message: impl Into<String>) -> bool {
        match self.entries.write().get_mut(name) {
            Some(entry) => {
                entry.source = CatalogSource::Broken(message.into());
                true
            }
            None => false,
        }
    }

    /// Forgets a module, as if its file had been deleted.
    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    /// `true` when `name` is in the table.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    fn spec_for(&self, name: &str, is_package: bool) -> ModuleSpec {
        let root = self.roots.first().cloned().unwrap_or_default();
        ModuleSpec::new(
            name,
            root.join(name_to_relative_path(name, is_package)),
            is_package,
        )
    }

    fn insert_spec(&self, spec: ModuleSpec, body: ModuleBody) -> ModuleSpec {
        trace!(module = %spec.name(), path = %spec.path().display(), "Module added to catalog");
        self.entries.write().insert(
            spec.name().to_string(),
            CatalogEntry {
                spec: spec.clone(),
                source: CatalogSource::Body(body),
            },
        );
        spec
    }

    fn file_present(&self, spec: &ModuleSpec) -> bool {
        !self.on_disk || spec.path().is_file()
    }
}

impl SourceProvider for ModuleCatalog {
    fn find_spec(&self, name: &str) -> Option<ModuleSpec> {
        self.entries.read().get(name).map(|entry| entry.spec.clone())
    }

    fn name_for_path(&self, path: &Path) -> String {
        path_to_name(&self.roots, path)
    }

    fn exists(&self, spec: &ModuleSpec) -> bool {
        self.contains(spec.name()) && self.file_present(spec)
    }

    fn check_source(&self, spec: &ModuleSpec) -> PluginResult<()> {
        let entries = self.entries.read();
        let entry = entries
            .get(spec.name())
            .filter(|_| self.file_present(spec))
            .ok_or_else(|| PluginError::SourceMissing {
                name: spec.name().to_string(),
                path: spec.path().to_path_buf(),
            })?;
        if self.on_disk {
            std::fs::read(spec.path()).map_err(|e| PluginError::Syntax {
                name: spec.name().to_string(),
                message: e.to_string(),
            })?;
        }
        match &entry.source {
            CatalogSource::Body(_) => Ok(()),
            CatalogSource::Broken(message) => Err(PluginError::Syntax {
                name: spec.name().to_string(),
                message: message.clone(),
            }),
        }
    }

    fn load_source(&self, spec: &ModuleSpec) -> PluginResult<ModuleBody> {
        self.check_source(spec)?;
        let entries = self.entries.read();
        match entries.get(spec.name()).map(|entry| &entry.source) {
            Some(CatalogSource::Body(body)) => Ok(body.clone()),
            _ => Err(PluginError::not_found(spec.name())),
        }
    }

    fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("roots", &self.roots)
            .field("on_disk", &self.on_disk)
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut ModuleScope<'_>) -> BodyResult {
        Ok(())
    }

    #[distributed_slice(STATIC_MODULES)]
    static CATALOG_TEST_MODULE: StaticModule = StaticModule {
        name: "static_test_module",
        is_package: false,
        body: noop,
    };

    #[test]
    fn test_in_memory_paths() {
        let catalog = ModuleCatalog::new();
        let spec = catalog.insert_package("pkg", noop);
        assert_eq!(spec.path(), Path::new("memory/pkg/mod.rs"));
        assert_eq!(catalog.name_for_path(spec.path()), "pkg");
        assert!(catalog.exists(&spec));

        catalog.remove("pkg");
        assert!(!catalog.exists(&spec));
        assert!(matches!(
            catalog.check_source(&spec),
            Err(PluginError::SourceMissing { .. })
        ));
    }

    #[test]
    fn test_broken_then_fixed() {
        let catalog = ModuleCatalog::new();
        let spec = catalog.insert("a", noop);
        catalog.break_source("a", "expected `;`");
        assert!(matches!(
            catalog.load_source(&spec),
            Err(PluginError::Syntax { message, .. }) if message == "expected `;`"
        ));
        assert!(catalog.replace("a", noop));
        assert!(catalog.check_source(&spec).is_ok());
    }

    #[test]
    fn test_on_disk_existence() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = ModuleCatalog::with_root(dir.path());
        let spec = catalog.insert("tool", noop);
        assert_eq!(spec.path(), dir.path().join("tool.rs"));
        assert!(!catalog.exists(&spec));

        std::fs::write(spec.path(), "// tool").unwrap();
        assert!(catalog.exists(&spec));
        assert!(catalog.check_source(&spec).is_ok());

        std::fs::remove_file(spec.path()).unwrap();
        assert!(!catalog.exists(&spec));
    }

    #[test]
    fn test_static_modules_imported() {
        let catalog = ModuleCatalog::new().with_static_modules();
        assert!(catalog.contains("static_test_module"));
    }

    #[test]
    fn test_insert_path_outside_root() {
        let catalog = ModuleCatalog::new();
        let spec = catalog.insert_path("/opt/extra/tool.rs", noop);
        assert_eq!(spec.name(), "__scion_path__.opt.extra.tool");
        assert!(!spec.is_package());
    }
}
