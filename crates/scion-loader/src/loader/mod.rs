//! The plugin loader.
//!
//! [`PluginLoader`] owns the plugin registry and coordinates every load,
//! unload and reload:
//!
//! ```text
//! load/unload/reload(selector)
//!   └─ PluginExtractor      selector -> plugins
//!   └─ PluginTree           plugins  -> sorted trees (+ trees that failed before)
//!   └─ PluginTreeIterator   one per phase:
//!        syntax check ─► unload ─► unlink deleted ─► load
//!   └─ per-plugin task      deduplicated, run on the blocking pool
//!                           between two snapshots of the client
//! ```
//!
//! Failures never abort a batch. They are collected and returned once, as a
//! [`PluginBatchError`](crate::PluginBatchError).

mod blocking;
mod execute;
mod pipeline;
mod tasks;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use scion_core::Client;
use tracing::{debug, info};

use crate::error::{LoaderResult, PluginError, PluginResult};
use crate::extractor::{Extracted, PluginExtractor, PluginSelector};
use crate::module::{Variable, Variables, is_reserved};
use crate::plugin::{Plugin, PluginConfig, PluginRegistry};
use crate::snapshot::{SnapshotKind, default_snapshot_kinds};
use crate::source::{ModuleSpec, SourceProvider};
use crate::tree::PluginTree;

pub use blocking::BlockingPluginLoader;
pub use pipeline::Actions;

use tasks::TaskMaps;

/// Default name of the hook run after a module body.
pub const DEFAULT_ENTRY_POINT: &str = "setup";
/// Default name of the hook run before teardown.
pub const DEFAULT_EXIT_POINT: &str = "teardown";

/// Result of one plugin load task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The module executed and the plugin is now loaded.
    Loaded,
    /// Nothing to do.
    AlreadyLoaded,
    /// The module asked not to be loaded.
    Skipped,
}

/// Result of one plugin unload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadStatus {
    Unloaded,
    NotLoaded,
}

// =============================================================================
// Shared state
// =============================================================================

pub(crate) struct LoaderShared {
    pub(crate) client: Arc<Client>,
    pub(crate) source: Arc<dyn SourceProvider>,
    pub(crate) registry: RwLock<PluginRegistry>,
    default_variables: RwLock<Variables>,
    default_entry_point: Option<String>,
    default_exit_point: Option<String>,
    snapshot_kinds: Vec<SnapshotKind>,
    tasks: Mutex<TaskMaps>,
    currently_loading: Mutex<Vec<String>>,
    failed_trees: Mutex<Vec<PluginTree>>,
    /// Held while plugin code runs, so snapshot windows never overlap.
    execution: tokio::sync::Mutex<()>,
}

impl LoaderShared {
    /// The registered plugin `name`, registering it from source if needed.
    pub(crate) fn resolve_or_register(&self, name: &str) -> PluginResult<Arc<Plugin>> {
        let mut registry = self.registry.write();
        if let Some(plugin) = registry.get(name) {
            return Ok(plugin);
        }
        let spec = self
            .source
            .find_spec(name)
            .ok_or_else(|| PluginError::not_found(name))?;
        Ok(register_spec(&mut registry, spec, PluginConfig::default()))
    }

    /// Resolves a selector, registering discoverable plugins on the way.
    fn resolve(&self, selector: &PluginSelector) -> PluginResult<Vec<Arc<Plugin>>> {
        let mut registry = self.registry.write();
        let entries = PluginExtractor::new(&registry, self.source.as_ref()).extract(selector)?;
        Ok(entries
            .into_iter()
            .map(|entry| match entry {
                Extracted::Plugin(plugin) => plugin,
                Extracted::Spec(spec) => {
                    register_spec(&mut registry, spec, PluginConfig::default())
                }
            })
            .collect())
    }

    /// Resolves a selector against registered plugins only.
    fn resolve_registered(&self, selector: &PluginSelector) -> PluginResult<Vec<Arc<Plugin>>> {
        let registry = self.registry.read();
        PluginExtractor::new(&registry, self.source.as_ref()).extract_registered(selector)
    }

    /// Links every declared requirement of `plugin`.
    fn link_requirements(&self, plugin: &Arc<Plugin>) -> PluginResult<()> {
        for name in plugin.config().requires {
            let dependency = self.resolve_or_register(&name)?;
            Plugin::link(plugin, &dependency, true);
        }
        Ok(())
    }

    /// Removes a plugin that is not loaded from the registry and from every
    /// plugin linked to it.
    pub(crate) fn unlink_plugin(&self, plugin: &Arc<Plugin>) -> bool {
        if plugin.is_loaded() {
            return false;
        }
        let removed = {
            let mut registry = self.registry.write();
            if !registry.contains_plugin(plugin) {
                false
            } else {
                registry.remove(plugin.name());
                if let Some(package) = registry.nearest_package(plugin.name()) {
                    package.remove_sub_module(plugin.name());
                }
                true
            }
        };
        plugin.clear_all_links();
        plugin.set_module(None);
        if removed {
            info!(plugin = %plugin.name(), "Plugin unlinked");
        }
        removed
    }

    fn non_locked_plugins(&self) -> Vec<Arc<Plugin>> {
        self.registry
            .read()
            .plugins()
            .into_iter()
            .filter(|plugin| !plugin.is_locked())
            .collect()
    }
}

/// Creates and registers a plugin, wiring package membership both ways.
fn register_spec(registry: &mut PluginRegistry, spec: ModuleSpec, config: PluginConfig) -> Arc<Plugin> {
    let plugin = Plugin::new(spec, config);
    let outer = registry.nearest_package(plugin.name());
    registry.insert(Arc::clone(&plugin));
    if let Some(package) = &outer {
        package.add_sub_module(&plugin);
    }
    if plugin.is_package() {
        for nested in registry.with_prefix(plugin.name()) {
            let owner = registry.nearest_package(nested.name());
            if owner.is_some_and(|owner| Arc::ptr_eq(&owner, &plugin)) {
                plugin.add_sub_module(&nested);
                if let Some(package) = &outer {
                    package.remove_sub_module(nested.name());
                }
            }
        }
    }
    debug!(plugin = %plugin.name(), path = %plugin.path().display(), "Plugin registered");
    plugin
}

// =============================================================================
// PluginLoader
// =============================================================================

/// Loads, unloads and reloads plugins.
///
/// Cheap to clone; clones share the same registry and tasks.
///
/// ```rust,ignore
/// let catalog = Arc::new(ModuleCatalog::new());
/// catalog.insert("greeter", |scope| {
///     scope.on_event("message", |event: Event| async move { /* ... */ })?;
///     Ok(())
/// });
///
/// let loader = PluginLoader::new(Client::new("main"), catalog.clone());
/// loader.load("greeter").await?;
/// catalog.replace("greeter", new_body);
/// loader.reload("greeter").await?;
/// ```
#[derive(Clone)]
pub struct PluginLoader {
    shared: Arc<LoaderShared>,
}

/// A non-owning [`PluginLoader`] handle, stored in every module as
/// `__loader__`.
#[derive(Clone)]
pub struct WeakPluginLoader {
    shared: Weak<LoaderShared>,
}

impl WeakPluginLoader {
    pub fn upgrade(&self) -> Option<PluginLoader> {
        self.shared.upgrade().map(|shared| PluginLoader { shared })
    }
}

impl fmt::Debug for WeakPluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakPluginLoader")
    }
}

/// Builder for [`PluginLoader`].
pub struct PluginLoaderBuilder {
    client: Arc<Client>,
    source: Arc<dyn SourceProvider>,
    default_variables: Variables,
    default_entry_point: Option<String>,
    default_exit_point: Option<String>,
    snapshot_kinds: Vec<SnapshotKind>,
}

impl PluginLoaderBuilder {
    /// Hook name looked up after each body. `None` disables the default.
    pub fn default_entry_point(mut self, name: Option<&str>) -> Self {
        self.default_entry_point = name.map(str::to_string);
        self
    }

    /// Hook name looked up before each teardown. `None` disables the default.
    pub fn default_exit_point(mut self, name: Option<&str>) -> Self {
        self.default_exit_point = name.map(str::to_string);
        self
    }

    /// Adds a variable injected into every module.
    pub fn default_variable(mut self, name: impl Into<String>, value: Variable) -> Self {
        self.default_variables.insert(name.into(), value);
        self
    }

    pub fn default_variables(mut self, variables: Variables) -> Self {
        self.default_variables.extend(variables);
        self
    }

    /// Adds a snapshot category on top of event handlers and commands.
    pub fn snapshot_kind(mut self, kind: SnapshotKind) -> Self {
        if !self.snapshot_kinds.iter().any(|k| k.kind() == kind.kind()) {
            self.snapshot_kinds.push(kind);
        }
        self
    }

    /// Builds the loader. Fails when a default variable uses a reserved name.
    pub fn build(self) -> PluginResult<PluginLoader> {
        check_default_variables(&self.default_variables)?;
        Ok(self.finish())
    }

    fn finish(self) -> PluginLoader {
        PluginLoader {
            shared: Arc::new(LoaderShared {
                client: self.client,
                source: self.source,
                registry: RwLock::new(PluginRegistry::new()),
                default_variables: RwLock::new(self.default_variables),
                default_entry_point: self.default_entry_point,
                default_exit_point: self.default_exit_point,
                snapshot_kinds: self.snapshot_kinds,
                tasks: Mutex::new(TaskMaps::default()),
                currently_loading: Mutex::new(Vec::new()),
                failed_trees: Mutex::new(Vec::new()),
                execution: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

fn check_default_variables(variables: &Variables) -> PluginResult<()> {
    match variables.keys().find(|name| is_reserved(name)) {
        Some(variable) => Err(PluginError::ReservedVariable {
            name: "<default>".to_string(),
            variable: variable.clone(),
        }),
        None => Ok(()),
    }
}

impl PluginLoader {
    /// A loader with default settings.
    pub fn new(client: Arc<Client>, source: Arc<dyn SourceProvider>) -> Self {
        Self::builder(client, source).finish()
    }

    pub fn builder(client: Arc<Client>, source: Arc<dyn SourceProvider>) -> PluginLoaderBuilder {
        PluginLoaderBuilder {
            client,
            source,
            default_variables: Variables::new(),
            default_entry_point: Some(DEFAULT_ENTRY_POINT.to_string()),
            default_exit_point: Some(DEFAULT_EXIT_POINT.to_string()),
            snapshot_kinds: default_snapshot_kinds(),
        }
    }

    pub fn downgrade(&self) -> WeakPluginLoader {
        WeakPluginLoader {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The blocking convention of this loader, driven through `handle`.
    pub fn blocking(&self, handle: tokio::runtime::Handle) -> BlockingPluginLoader {
        BlockingPluginLoader::new(self.clone(), handle)
    }

    // ─── Registration ────────────────────────────────────────────────────────

    /// Registers plugins without loading them.
    ///
    /// Already registered plugins keep their identity and get `config`
    /// merged into theirs. Declared requirements are linked right away and
    /// registered from source when needed.
    pub fn register(
        &self,
        selector: impl Into<PluginSelector>,
        config: PluginConfig,
    ) -> LoaderResult<Vec<Arc<Plugin>>> {
        let selector = selector.into();
        let plugins = {
            let mut registry = self.shared.registry.write();
            let entries =
                PluginExtractor::new(&registry, self.shared.source.as_ref()).extract(&selector)?;
            for entry in &entries {
                config.validate(entry.name())?;
            }
            entries
                .into_iter()
                .map(|entry| match entry {
                    Extracted::Plugin(plugin) => {
                        plugin.merge_config(config.clone());
                        plugin
                    }
                    Extracted::Spec(spec) => register_spec(&mut registry, spec, config.clone()),
                })
                .collect::<Vec<_>>()
        };
        for plugin in &plugins {
            self.shared.link_requirements(plugin)?;
        }
        Ok(plugins)
    }

    /// Removes plugins from the registry.
    ///
    /// Fails with [`PluginError::StillLoaded`] if any of them is loaded and
    /// with [`PluginError::Locked`] if any of them is locked; nothing is
    /// removed in that case.
    pub fn remove(&self, selector: impl Into<PluginSelector>) -> LoaderResult<Vec<Arc<Plugin>>> {
        let plugins = self.shared.resolve_registered(&selector.into())?;
        if let Some(plugin) = plugins.iter().find(|plugin| plugin.is_loaded()) {
            return Err(PluginError::StillLoaded {
                name: plugin.name().to_string(),
            }
            .into());
        }
        if let Some(plugin) = plugins.iter().find(|plugin| plugin.is_locked()) {
            return Err(PluginError::Locked {
                name: plugin.name().to_string(),
            }
            .into());
        }
        for plugin in &plugins {
            self.shared.unlink_plugin(plugin);
        }
        self.shared.forget_failed(plugins.iter().map(|plugin| plugin.name()));
        Ok(plugins)
    }

    /// [`register`](Self::register) followed by [`load`](Self::load).
    pub async fn register_and_load(
        &self,
        selector: impl Into<PluginSelector>,
        config: PluginConfig,
    ) -> LoaderResult<Vec<Arc<Plugin>>> {
        let plugins = self.register(selector, config)?;
        self.shared
            .run_pipeline(plugins.clone(), Actions::LOAD)
            .await?;
        Ok(plugins)
    }

    // ─── Load / unload / reload ──────────────────────────────────────────────

    /// Loads plugins, and everything in their trees, registering them from
    /// source when needed. Loaded plugins are left alone.
    pub async fn load(&self, selector: impl Into<PluginSelector>) -> LoaderResult<Vec<Arc<Plugin>>> {
        let plugins = self.shared.resolve(&selector.into())?;
        self.shared
            .run_pipeline(plugins.clone(), Actions::LOAD)
            .await?;
        Ok(plugins)
    }

    /// Unloads plugins together with everything depending on them.
    pub async fn unload(
        &self,
        selector: impl Into<PluginSelector>,
    ) -> LoaderResult<Vec<Arc<Plugin>>> {
        let plugins = self.shared.resolve_registered(&selector.into())?;
        self.shared
            .run_pipeline(plugins.clone(), Actions::UNLOAD)
            .await?;
        Ok(plugins)
    }

    /// Unloads and loads plugins again, picking up source changes.
    ///
    /// Plugins whose new source does not compile are left loaded, and
    /// plugins whose source was deleted are unloaded and unlinked.
    pub async fn reload(
        &self,
        selector: impl Into<PluginSelector>,
    ) -> LoaderResult<Vec<Arc<Plugin>>> {
        let plugins = self.shared.resolve(&selector.into())?;
        self.shared
            .run_pipeline(plugins.clone(), Actions::RELOAD)
            .await?;
        Ok(plugins)
    }

    /// Loads every registered plugin that is not locked.
    pub async fn load_all(&self) -> LoaderResult<Vec<Arc<Plugin>>> {
        let plugins = self.shared.non_locked_plugins();
        self.shared
            .run_pipeline(plugins.clone(), Actions::LOAD)
            .await?;
        Ok(plugins)
    }

    /// Unloads every registered plugin that is not locked.
    pub async fn unload_all(&self) -> LoaderResult<Vec<Arc<Plugin>>> {
        let plugins = self.shared.non_locked_plugins();
        self.shared
            .run_pipeline(plugins.clone(), Actions::UNLOAD)
            .await?;
        Ok(plugins)
    }

    /// Reloads every registered plugin that is not locked.
    pub async fn reload_all(&self) -> LoaderResult<Vec<Arc<Plugin>>> {
        let plugins = self.shared.non_locked_plugins();
        self.shared
            .run_pipeline(plugins.clone(), Actions::RELOAD)
            .await?;
        Ok(plugins)
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    /// The shared client plugins register into.
    pub fn client(&self) -> &Arc<Client> {
        &self.shared.client
    }

    pub fn source(&self) -> &Arc<dyn SourceProvider> {
        &self.shared.source
    }

    pub fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.shared.registry.read().get(name)
    }

    pub fn get_plugin_by_path(&self, path: &Path) -> Option<Arc<Plugin>> {
        self.shared.registry.read().get_by_path(path)
    }

    /// Every registered plugin, sorted by name.
    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.shared.registry.read().plugins()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.get_plugin(name).is_some_and(|plugin| plugin.is_loaded())
    }

    /// Trees whose last load failed; retried with any request touching them.
    pub fn previously_failed_trees(&self) -> Vec<PluginTree> {
        self.shared.failed_trees.lock().clone()
    }

    // ─── Default variables ───────────────────────────────────────────────────

    /// Adds variables injected into every module that does not opt out.
    pub fn add_default_variables(&self, variables: Variables) -> PluginResult<()> {
        check_default_variables(&variables)?;
        self.shared.default_variables.write().extend(variables);
        Ok(())
    }

    pub fn remove_default_variables<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut defaults = self.shared.default_variables.write();
        for name in names {
            defaults.remove(name);
        }
    }

    /// Names of the default variables.
    pub fn default_variable_names(&self) -> Vec<String> {
        self.shared.default_variables.read().keys().cloned().collect()
    }
}

impl fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: BTreeMap<String, String> = self
            .plugins()
            .iter()
            .map(|plugin| (plugin.name().to_string(), plugin.state().to_string()))
            .collect();
        f.debug_struct("PluginLoader")
            .field("client", &self.shared.client.id())
            .field("plugins", &states)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use linkme::distributed_slice;
    use scion_core::{Event, HandlerEntry, HandlerId};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::error::LoaderError;
    use crate::module::{ATTR_FILE, ATTR_LOADER, BodyError, BodyResult, Hook, ModuleScope};
    use crate::plugin::PluginState;
    use crate::snapshot::EventHandlers;
    use crate::source::{ModuleCatalog, STATIC_MODULES, StaticModule};
    use crate::tree::PluginAction;

    async fn noop(_: Event) {}

    fn setup() -> (Arc<ModuleCatalog>, PluginLoader) {
        let catalog = Arc::new(ModuleCatalog::new());
        let loader = PluginLoader::new(Client::new("test"), catalog.clone());
        (catalog, loader)
    }

    /// A module that counts its executions and registers one handler.
    fn counting(catalog: &ModuleCatalog, name: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let runs = Arc::clone(&count);
        catalog.insert(name, move |scope| {
            runs.fetch_add(1, Ordering::SeqCst);
            scope.on_event("ready", noop)?;
            Ok(())
        });
        count
    }

    /// A module that fails while `broken` is set.
    fn breakable(catalog: &ModuleCatalog, name: &str, imports: Option<&'static str>) -> Arc<AtomicBool> {
        let broken = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&broken);
        catalog.insert(name, move |scope| {
            if let Some(dependency) = imports {
                scope.import(dependency)?;
            }
            if flag.load(Ordering::SeqCst) {
                return Err(BodyError::fail("module is broken"));
            }
            Ok(())
        });
        broken
    }

    fn tree_names(trees: &[PluginTree]) -> Vec<Vec<&str>> {
        trees.iter().map(|tree| tree.names().collect()).collect()
    }

    fn state(loader: &PluginLoader, name: &str) -> Option<PluginState> {
        loader.get_plugin(name).map(|plugin| plugin.state())
    }

    #[tokio::test]
    async fn test_dependencies_load_first() {
        let (catalog, loader) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let order = Arc::clone(&order);
            catalog.insert(name, move |scope| {
                order.lock().push(scope.name().to_string());
                Ok(())
            });
        }
        loader.register("c", PluginConfig::new().requires("b")).unwrap();
        loader.register("b", PluginConfig::new().requires("a")).unwrap();

        assert_ok!(loader.load("c").await);
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert!(["a", "b", "c"].iter().all(|name| loader.is_loaded(name)));
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let (catalog, loader) = setup();
        let count = counting(&catalog, "x");

        assert_ok!(loader.load("x").await);
        assert_ok!(loader.load("x").await);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(loader.client().events().len(), 1);
        assert_eq!(state(&loader, "x"), Some(PluginState::Loaded));
        assert_eq!(loader.shared.tasks.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_unload_reverts_side_effects() {
        let (catalog, loader) = setup();
        let count = counting(&catalog, "x");
        loader
            .client()
            .events()
            .register("ready", "host", noop)
            .unwrap();
        let before = loader.client().events().entries();

        assert_ok!(loader.load("x").await);
        assert_eq!(loader.client().events().len(), 2);

        assert_ok!(loader.unload("x").await);
        assert_eq!(loader.client().events().entries(), before);
        assert_eq!(state(&loader, "x"), Some(PluginState::Unloaded));

        // the module object survives and the body runs again
        let module = loader.get_plugin("x").unwrap().module().unwrap();
        assert_ok!(loader.load("x").await);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(Arc::ptr_eq(
            &module,
            &loader.get_plugin("x").unwrap().module().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_batch_failure_isolation() {
        let (catalog, loader) = setup();
        let a = counting(&catalog, "a");
        let c = counting(&catalog, "c");
        catalog.insert("b", |_| Err(BodyError::fail("b is broken")));
        loader.register(["a", "b"], PluginConfig::new()).unwrap();
        loader.register("c", PluginConfig::new().requires("b")).unwrap();

        let error = assert_err!(loader.load_all().await);
        let batch = error.batch().unwrap();
        let load = batch.iterator(PluginAction::Load).unwrap();
        assert_eq!(tree_names(load.done_success()), vec![vec!["a"]]);
        assert_eq!(tree_names(load.done_fail()), vec![vec!["b", "c"]]);
        assert!(load.done_cancelled().is_empty());
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(c.load(Ordering::SeqCst), 0);
        assert_eq!(batch.plugin_names(), BTreeSet::from(["b".to_string()]));
        assert_eq!(batch.messages().len(), 1);
        assert_eq!(state(&loader, "b"), Some(PluginState::Undefined));
    }

    #[tokio::test]
    async fn test_reload_all_isolates_and_retries() {
        let (catalog, loader) = setup();
        let a = counting(&catalog, "a");
        let b = breakable(&catalog, "b", None);
        let c = Arc::new(AtomicUsize::new(0));
        let runs = Arc::clone(&c);
        catalog.insert("c", move |scope| {
            runs.fetch_add(1, Ordering::SeqCst);
            scope.import("b")?;
            Ok(())
        });

        assert_ok!(loader.load(["a", "c"]).await);
        assert!(loader.is_loaded("b"));
        assert_eq!(c.load(Ordering::SeqCst), 1);

        b.store(true, Ordering::SeqCst);
        let error = assert_err!(loader.reload_all().await);
        let load = error.batch().unwrap().iterator(PluginAction::Load).unwrap();
        assert_eq!(tree_names(load.done_success()), vec![vec!["a"]]);
        assert_eq!(tree_names(load.done_fail()), vec![vec!["b", "c"]]);
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(c.load(Ordering::SeqCst), 1);
        assert!(!loader.is_loaded("b"));
        assert!(!loader.is_loaded("c"));

        b.store(false, Ordering::SeqCst);
        assert_ok!(loader.load("c").await);
        assert!(loader.is_loaded("b"));
        assert!(loader.is_loaded("c"));
        assert!(loader.previously_failed_trees().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_task() {
        let (catalog, loader) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let runs = Arc::clone(&count);
        catalog.insert("slow", move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Err(BodyError::fail("slow failure"))
        });

        let (first, second) = tokio::join!(loader.load("slow"), loader.load("slow"));
        let first = assert_err!(first);
        let second = assert_err!(second);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(first.to_string(), second.to_string());
        assert_eq!(loader.shared.tasks.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_load_waits_for_pending_unload() {
        let (catalog, loader) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let runs = Arc::clone(&count);
        catalog.insert("x", move |scope| {
            runs.fetch_add(1, Ordering::SeqCst);
            scope.set_hook(
                "teardown",
                Hook::sync(|_| {
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(())
                }),
            )?;
            Ok(())
        });
        assert_ok!(loader.load("x").await);

        let (unloaded, loaded) = tokio::join!(loader.unload("x"), async {
            tokio::task::yield_now().await;
            loader.load("x").await
        });
        assert_ok!(unloaded);
        assert_ok!(loaded);
        assert!(loader.is_loaded("x"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_load_after_queued_unload_wins() {
        let (catalog, loader) = setup();
        let entered = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        {
            let entered = Arc::clone(&entered);
            let released = Arc::clone(&released);
            catalog.insert("slow", move |_| {
                entered.fetch_add(1, Ordering::SeqCst);
                while !released.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            });
        }

        let mut first = Box::pin(loader.load("slow"));
        assert!(futures::poll!(first.as_mut()).is_pending());
        while entered.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let mut unload = Box::pin(loader.unload("slow"));
        assert!(futures::poll!(unload.as_mut()).is_pending());
        let mut second = Box::pin(loader.load("slow"));
        assert!(futures::poll!(second.as_mut()).is_pending());
        released.store(true, Ordering::SeqCst);

        let (first, unload, second) = tokio::join!(first, unload, second);
        assert_ok!(first);
        assert_ok!(unload);
        assert_ok!(second);
        assert!(loader.is_loaded("slow"));
        assert_eq!(entered.load(Ordering::SeqCst), 2);
        assert_eq!(loader.shared.tasks.lock().len(), 0);
    }

    #[tokio::test]
    async fn test_retry_pulls_in_failed_tree() {
        let (catalog, loader) = setup();
        let a = breakable(&catalog, "a", None);
        breakable(&catalog, "b", Some("a"));
        a.store(true, Ordering::SeqCst);

        let error = assert_err!(loader.load(["a", "b"]).await);
        assert_eq!(
            error.plugin_names(),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        let remembered = loader.previously_failed_trees();
        assert_eq!(tree_names(&remembered), vec![vec!["a", "b"]]);

        a.store(false, Ordering::SeqCst);
        assert_ok!(loader.load("b").await);
        assert!(loader.is_loaded("a"));
        assert!(loader.is_loaded("b"));
        assert!(loader.previously_failed_trees().is_empty());
        assert!(loader.get_plugin("b").unwrap().depends_on("a"));
    }

    #[tokio::test]
    async fn test_circular_load_detected() {
        let (catalog, loader) = setup();
        catalog.insert("ping", |scope| {
            scope.import("pong")?;
            Ok(())
        });
        catalog.insert("pong", |scope| {
            scope.import("ping")?;
            Ok(())
        });
        catalog.insert("selfish", |scope| {
            scope.import("selfish")?;
            Ok(())
        });

        let error = assert_err!(loader.load("ping").await);
        let batch = error.batch().unwrap();
        assert!(batch.causes().iter().any(PluginError::is_circular_load));
        assert!(!loader.is_loaded("ping"));
        assert!(!loader.is_loaded("pong"));

        let error = assert_err!(loader.load("selfish").await);
        assert!(error.batch().unwrap().causes()[0].is_circular_load());
        assert!(loader.shared.currently_loading.lock().is_empty());
    }

    #[tokio::test]
    async fn test_import_cannot_close_declared_cycle() {
        let (catalog, loader) = setup();
        counting(&catalog, "a");
        catalog.insert("b", |scope| {
            scope.import("a")?;
            Ok(())
        });
        loader.register("a", PluginConfig::new().requires("b")).unwrap();

        let error = assert_err!(loader.load("a").await);
        let batch = error.batch().unwrap();
        assert!(batch.causes().iter().any(PluginError::is_circular_load));
        assert!(!loader.is_loaded("a"));
        assert!(!loader.is_loaded("b"));
        assert!(!loader.get_plugin("b").unwrap().depends_on("a"));
        assert!(loader.client().events().is_empty());

        assert_ok!(loader.unload_all().await);
    }

    #[tokio::test]
    async fn test_declared_cycle_fails_its_tree_only() {
        let (catalog, loader) = setup();
        for name in ["a", "b", "c"] {
            counting(&catalog, name);
        }
        loader.register("a", PluginConfig::new().requires("b")).unwrap();
        loader.register("b", PluginConfig::new().requires("a")).unwrap();

        let error = assert_err!(loader.load(["a", "c"]).await);
        let batch = error.batch().unwrap();
        assert!(matches!(
            batch.causes(),
            [PluginError::CircularDependency { .. }]
        ));
        let check = batch.iterator(PluginAction::SyntaxCheck).unwrap();
        assert_eq!(tree_names(check.done_fail()), vec![vec!["a", "b"]]);
        assert!(loader.is_loaded("c"));
        assert!(!loader.is_loaded("a"));
        assert_eq!(loader.client().events().len(), 1);
        // cycles are configuration errors, not retried
        assert!(loader.previously_failed_trees().is_empty());
    }

    #[tokio::test]
    async fn test_unload_all_goes_past_a_cycle() {
        let (catalog, loader) = setup();
        for name in ["a", "b", "x"] {
            counting(&catalog, name);
        }
        assert_ok!(loader.load(["a", "b", "x"]).await);
        loader.register("a", PluginConfig::new().requires("b")).unwrap();
        loader.register("b", PluginConfig::new().requires("a")).unwrap();

        let error = assert_err!(loader.unload_all().await);
        let batch = error.batch().unwrap();
        assert!(matches!(
            batch.causes(),
            [PluginError::CircularDependency { .. }]
        ));
        let unload = batch.iterator(PluginAction::Unload).unwrap();
        assert_eq!(tree_names(unload.done_success()), vec![vec!["x"]]);
        assert_eq!(tree_names(unload.done_fail()), vec![vec!["a", "b"]]);
        assert!(!loader.is_loaded("x"));
        assert!(loader.is_loaded("a"));
        assert!(loader.is_loaded("b"));
        assert_eq!(loader.client().events().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_plugin() {
        let (_, loader) = setup();
        let error = assert_err!(loader.load("missing").await);
        assert!(matches!(error, LoaderError::Plugin(PluginError::NotFound { .. })));
        assert!(loader.plugins().is_empty());
    }

    #[tokio::test]
    async fn test_skip_leaves_plugin_unsatisfied() {
        let (catalog, loader) = setup();
        catalog.insert("needs_token", |scope| {
            scope.on_event("ready", noop)?;
            scope.require(&["token"])?;
            Ok(())
        });

        assert_ok!(loader.load("needs_token").await);
        assert_eq!(state(&loader, "needs_token"), Some(PluginState::Unsatisfied));
        assert!(loader.client().events().is_empty());

        loader
            .register(
                "needs_token",
                PluginConfig::new().variable("token", Variable::new("secret".to_string())),
            )
            .unwrap();
        assert_ok!(loader.load("needs_token").await);
        assert_eq!(state(&loader, "needs_token"), Some(PluginState::Loaded));
        assert_eq!(loader.client().events().len(), 1);
    }

    #[tokio::test]
    async fn test_variable_injection() {
        let (catalog, loader) = setup();
        loader
            .add_default_variables(Variables::from([(
                "greeting".to_string(),
                Variable::new("hello".to_string()),
            )]))
            .unwrap();
        for name in ["social", "loner"] {
            catalog.insert(name, |scope| {
                let seen = scope.variable::<String>("greeting").is_some();
                scope.set("seen_greeting", seen)?;
                Ok(())
            });
        }
        loader
            .register("loner", PluginConfig::new().extend_default_variables(false))
            .unwrap();
        assert_ok!(loader.load(["social", "loner"]).await);

        let seen = |name: &str| {
            let module = loader.get_plugin(name).unwrap().module().unwrap();
            *module.get_as::<bool>("seen_greeting").unwrap()
        };
        assert!(seen("social"));
        assert!(!seen("loner"));

        loader.remove_default_variables(["greeting"]);
        assert!(loader.default_variable_names().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_variables_rejected() {
        let (catalog, loader) = setup();
        counting(&catalog, "x");
        let error = assert_err!(loader.register(
            "x",
            PluginConfig::new().variable(ATTR_FILE, Variable::new(1u8))
        ));
        assert!(matches!(
            error,
            LoaderError::Plugin(PluginError::ReservedVariable { .. })
        ));
        assert!(loader.get_plugin("x").is_none());

        let defaults = Variables::from([(ATTR_LOADER.to_string(), Variable::new(0u8))]);
        assert!(loader.add_default_variables(defaults.clone()).is_err());
        let built = PluginLoader::builder(Client::new("other"), catalog.clone())
            .default_variables(defaults)
            .build();
        assert!(built.is_err());
    }

    #[tokio::test]
    async fn test_entry_and_exit_points() {
        let (catalog, loader) = setup();
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let hook_log = Arc::clone(&log);
        catalog.insert("hooked", move |scope| {
            let on_setup = Arc::clone(&hook_log);
            scope.set_hook(
                "setup",
                Hook::future(move |module| {
                    let log = Arc::clone(&on_setup);
                    async move {
                        tokio::task::yield_now().await;
                        log.lock().push(format!("setup {}", module.name()));
                        Ok(())
                    }
                }),
            )?;
            let on_teardown = Arc::clone(&hook_log);
            scope.set_hook(
                "teardown",
                Hook::sync(move |module| {
                    on_teardown.lock().push(format!("teardown {}", module.name()));
                    Ok(())
                }),
            )?;
            Ok(())
        });

        assert_ok!(loader.load("hooked").await);
        assert_ok!(loader.unload("hooked").await);
        assert_eq!(*log.lock(), vec!["setup hooked", "teardown hooked"]);
    }

    #[tokio::test]
    async fn test_missing_configured_entry_point() {
        let (catalog, loader) = setup();
        counting(&catalog, "plain");
        let error = assert_err!(
            loader
                .register_and_load("plain", PluginConfig::new().entry_point(Hook::named("start")))
                .await
        );
        assert!(matches!(
            error.batch().unwrap().causes(),
            [PluginError::MissingHook { hook, .. }] if hook == "start"
        ));
        assert_eq!(state(&loader, "plain"), Some(PluginState::Undefined));
        assert!(loader.client().events().is_empty());
    }

    #[tokio::test]
    async fn test_failing_exit_point_still_tears_down() {
        let (catalog, loader) = setup();
        catalog.insert("stubborn", |scope| {
            scope.on_event("ready", noop)?;
            scope.set_hook("teardown", Hook::sync(|_| Err("refusing to stop".into())))?;
            Ok(())
        });
        assert_ok!(loader.load("stubborn").await);

        let error = assert_err!(loader.unload("stubborn").await);
        let batch = error.batch().unwrap();
        assert!(matches!(batch.causes(), [PluginError::ExitPoint { .. }]));
        assert_eq!(batch.iterator(PluginAction::Unload).unwrap().done_fail().len(), 1);
        assert_eq!(state(&loader, "stubborn"), Some(PluginState::Unloaded));
        assert!(loader.client().events().is_empty());
    }

    #[tokio::test]
    async fn test_import_attributes_side_effects() {
        let (catalog, loader) = setup();
        counting(&catalog, "base");
        catalog.insert("top", |scope| {
            let base = scope.import("base")?;
            scope.set("base_name", base.name().to_string())?;
            scope.on_event("message", noop)?;
            Ok(())
        });

        assert_ok!(loader.load("top").await);
        let added = |name: &str| {
            loader
                .get_plugin(name)
                .and_then(|plugin| plugin.snapshot_difference())
                .and_then(|difference| difference.get::<EventHandlers>().map(|d| d.added().len()))
        };
        assert_eq!(added("base"), Some(1));
        assert_eq!(added("top"), Some(1));

        // unloading a dependency takes its dependents down too
        assert_ok!(loader.unload("base").await);
        assert!(!loader.is_loaded("top"));
        assert!(loader.client().events().is_empty());
    }

    #[tokio::test]
    async fn test_equivalent_handlers_owned_by_their_registrant() {
        let (catalog, loader) = setup();
        counting(&catalog, "shared");
        for name in ["left", "right"] {
            catalog.insert(name, |scope| {
                scope.import("shared")?;
                scope.on_event("ready", noop)?;
                Ok(())
            });
        }

        assert_ok!(loader.load(["left", "right"]).await);
        let owned = |name: &str| -> Vec<HandlerId> {
            loader
                .get_plugin(name)
                .and_then(|plugin| plugin.snapshot_difference())
                .and_then(|difference| {
                    difference
                        .get::<EventHandlers>()
                        .map(|d| d.added().iter().map(HandlerEntry::id).collect())
                })
                .unwrap_or_default()
        };
        let [shared, left, right] = ["shared", "left", "right"].map(owned);
        assert_eq!((shared.len(), left.len(), right.len()), (1, 1, 1));

        // three distinct registrations, each owned once, in registration order
        let registered: Vec<HandlerId> = loader
            .client()
            .events()
            .handlers("ready")
            .iter()
            .map(HandlerEntry::id)
            .collect();
        assert_eq!(registered, [shared, left, right].concat());

        assert_ok!(loader.unload_all().await);
        assert!(loader.client().events().is_empty());
    }

    #[tokio::test]
    async fn test_syntax_error_keeps_plugin_loaded() {
        let (catalog, loader) = setup();
        let count = counting(&catalog, "fragile");
        assert_ok!(loader.load("fragile").await);

        catalog.break_source("fragile", "unexpected token");
        let error = assert_err!(loader.reload("fragile").await);
        let batch = error.batch().unwrap();
        assert!(matches!(batch.causes(), [PluginError::Syntax { .. }]));
        assert_eq!(
            batch.iterator(PluginAction::SyntaxCheck).unwrap().done_fail().len(),
            1
        );
        assert!(loader.is_loaded("fragile"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(loader.client().events().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_source() {
        let (catalog, loader) = setup();
        counting(&catalog, "live");
        assert_ok!(loader.load("live").await);

        catalog.replace("live", |scope| {
            scope.on_event("message", noop)?;
            scope.on_event("message", noop)?;
            Ok(())
        });
        assert_ok!(loader.reload("live").await);
        assert!(loader.client().events().handlers("ready").is_empty());
        assert_eq!(loader.client().events().handlers("message").len(), 2);
    }

    #[tokio::test]
    async fn test_deleted_source_is_unlinked() {
        let (catalog, loader) = setup();
        counting(&catalog, "gone");
        assert_ok!(loader.load("gone").await);

        catalog.remove("gone");
        assert_ok!(loader.reload("gone").await);
        assert!(loader.get_plugin("gone").is_none());
        assert!(loader.client().events().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ModuleCatalog::with_root(dir.path()));
        let loader = PluginLoader::new(Client::new("disk"), catalog.clone());
        let spec = catalog.insert("tool", |scope| {
            scope.on_event("ready", noop)?;
            Ok(())
        });

        // no file yet: the unlink phase drops the registration again
        assert_ok!(loader.load("tool").await);
        assert!(loader.get_plugin("tool").is_none());

        std::fs::write(spec.path(), "// tool").unwrap();
        assert_ok!(loader.load("tool").await);
        assert!(loader.get_plugin_by_path(spec.path()).is_some());

        std::fs::remove_file(spec.path()).unwrap();
        assert_ok!(loader.reload_all().await);
        assert!(loader.get_plugin("tool").is_none());
        assert!(loader.get_plugin_by_path(spec.path()).is_none());
    }

    #[tokio::test]
    async fn test_remove_rules() {
        let (catalog, loader) = setup();
        counting(&catalog, "x");
        counting(&catalog, "guarded");
        assert_ok!(loader.load("x").await);

        let error = assert_err!(loader.remove("x"));
        assert!(matches!(error, LoaderError::Plugin(PluginError::StillLoaded { .. })));

        assert_ok!(loader.unload("x").await);
        assert_ok!(loader.remove("x"));
        assert!(loader.get_plugin("x").is_none());

        loader
            .register("guarded", PluginConfig::new().locked(true))
            .unwrap();
        let error = assert_err!(loader.remove("guarded"));
        assert!(matches!(error, LoaderError::Plugin(PluginError::Locked { .. })));
    }

    #[tokio::test]
    async fn test_bulk_operations_skip_locked() {
        let (catalog, loader) = setup();
        counting(&catalog, "free");
        counting(&catalog, "pinned");
        loader.register("free", PluginConfig::new()).unwrap();
        loader
            .register("pinned", PluginConfig::new().locked(true))
            .unwrap();

        assert_ok!(loader.load_all().await);
        assert!(loader.is_loaded("free"));
        assert!(!loader.is_loaded("pinned"));

        assert_ok!(loader.load("pinned").await);
        assert_ok!(loader.unload_all().await);
        assert!(!loader.is_loaded("free"));
        assert!(loader.is_loaded("pinned"));
    }

    #[tokio::test]
    async fn test_packages_and_wildcards() {
        let (catalog, loader) = setup();
        catalog.insert_package("pkg", |_| Ok(()));
        counting(&catalog, "pkg.a");
        counting(&catalog, "pkg.b");

        assert_ok!(loader.load(["pkg", "pkg.*"]).await);
        let package = loader.get_plugin("pkg").unwrap();
        let members: Vec<String> = package
            .sub_module_plugins()
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect();
        assert_eq!(members, vec!["pkg.a", "pkg.b"]);
        assert_eq!(loader.client().events().len(), 2);

        assert_ok!(loader.unload("pkg").await);
        assert!(loader.plugins().iter().all(|plugin| !plugin.is_loaded()));
        assert!(loader.client().events().is_empty());
    }

    fn linked_body(scope: &mut ModuleScope<'_>) -> BodyResult {
        scope.set("linked", true)?;
        Ok(())
    }

    #[distributed_slice(STATIC_MODULES)]
    static LINKED_LOADER_MODULE: StaticModule = StaticModule {
        name: "linked_loader_module",
        is_package: false,
        body: linked_body,
    };

    #[tokio::test]
    async fn test_static_modules() {
        let catalog = Arc::new(ModuleCatalog::new().with_static_modules());
        let loader = PluginLoader::new(Client::new("static"), catalog);
        assert_ok!(loader.load("linked_loader_module").await);
        let module = loader
            .get_plugin("linked_loader_module")
            .unwrap()
            .module()
            .unwrap();
        assert!(*module.get_as::<bool>("linked").unwrap());
        let owner = module.get_as::<WeakPluginLoader>(ATTR_LOADER).unwrap();
        assert!(owner.upgrade().is_some());
    }

    #[test]
    fn test_blocking_loader() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let (catalog, loader) = setup();
        let count = counting(&catalog, "x");
        let blocking = loader.blocking(runtime.handle().clone());

        assert_ok!(blocking.load("x"));
        assert_ok!(blocking.reload("x"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_ok!(blocking.unload_all());
        assert!(!loader.is_loaded("x"));
        assert_ok!(blocking.remove("x"));
    }
}
