//! Running plugin code.
//!
//! Module bodies and synchronous hooks run on tokio's blocking pool while
//! the loader-wide execution lock is held, bracketed by two snapshots of the
//! client. Inline loads triggered by [`ModuleScope::import`] run on the same
//! thread inside the importer's window.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::module::{ATTR_LOADER, ATTR_PLUGIN, Hook, LoadOutcome, Module, ModuleScope, Variable};
use crate::plugin::{Plugin, PluginConfig, PluginState};
use crate::snapshot::{DifferenceSet, SnapshotSet};

use super::{LoadStatus, LoaderShared, UnloadStatus, WeakPluginLoader};

/// Marks a plugin as mid-load for as long as it lives.
struct LoadingGuard<'a> {
    stack: &'a Mutex<Vec<String>>,
}

impl<'a> LoadingGuard<'a> {
    fn enter(stack: &'a Mutex<Vec<String>>, name: &str) -> PluginResult<Self> {
        let mut loading = stack.lock();
        if loading.iter().any(|n| n == name) {
            return Err(PluginError::CircularLoad {
                name: name.to_string(),
                chain: loading.clone(),
            });
        }
        loading.push(name.to_string());
        Ok(Self { stack })
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.stack.lock().pop();
    }
}

impl LoaderShared {
    // ─── Load ────────────────────────────────────────────────────────────────

    /// Runs one load under the execution lock.
    pub(crate) async fn execute_load(self: &Arc<Self>, plugin: Arc<Plugin>) -> PluginResult<LoadStatus> {
        let _execution = self.execution.lock().await;
        let shared = Arc::clone(self);
        let handle = Handle::current();
        let name = plugin.name().to_string();
        tokio::task::spawn_blocking(move || shared.load_plugin(&plugin, &handle))
            .await
            .map_err(|e| PluginError::Join {
                name,
                message: e.to_string(),
            })?
    }

    /// Executes a plugin's module. Blocking.
    pub(crate) fn load_plugin(
        self: &Arc<Self>,
        plugin: &Arc<Plugin>,
        handle: &Handle,
    ) -> PluginResult<LoadStatus> {
        if plugin.is_loaded() {
            return Ok(LoadStatus::AlreadyLoaded);
        }
        let _loading = LoadingGuard::enter(&self.currently_loading, plugin.name())?;
        let name = plugin.name();

        if !self.source.exists(plugin.spec()) {
            return Err(PluginError::SourceMissing {
                name: name.to_string(),
                path: plugin.path().to_path_buf(),
            });
        }
        let body = self.source.load_source(plugin.spec())?;
        let config = plugin.config();
        debug!(plugin = %name, state = %plugin.state(), "Executing plugin");

        plugin.clear_discovered_children();
        let before = config
            .take_snapshot_difference
            .then(|| SnapshotSet::capture(&self.snapshot_kinds, &self.client));

        let previous = plugin.module();
        let module = match &previous {
            Some(module) => {
                module.reset();
                Arc::clone(module)
            }
            None => Arc::new(Module::new(plugin.spec())),
        };
        module.set_reserved(ATTR_PLUGIN, Variable::new(Arc::downgrade(plugin)));
        module.set_reserved(
            ATTR_LOADER,
            Variable::new(WeakPluginLoader {
                shared: Arc::downgrade(self),
            }),
        );
        self.inject_variables(&module, &config)?;
        plugin.set_module(Some(Arc::clone(&module)));
        plugin.take_extractions();

        let outcome = {
            let mut scope = ModuleScope::new(self, plugin, &module, handle);
            body.execute(&mut scope)
        };
        let failure = match outcome {
            LoadOutcome::Loaded => self.run_entry_point(plugin, &module, &config, handle).err(),
            LoadOutcome::Failed(error) => Some(PluginError::load(name, error)),
            LoadOutcome::Skipped(reason) => {
                if let Some(difference) = self.window_difference(plugin, before) {
                    difference.revert();
                }
                plugin.set_state(PluginState::Unsatisfied);
                info!(plugin = %name, reason = %reason, "Plugin skipped");
                return Ok(LoadStatus::Skipped);
            }
        };

        let difference = self.window_difference(plugin, before);
        match failure {
            None => {
                plugin.set_snapshot_difference(difference);
                plugin.set_state(PluginState::Loaded);
                info!(plugin = %name, "Plugin loaded");
                Ok(LoadStatus::Loaded)
            }
            Some(failure) => {
                if let Some(difference) = difference {
                    difference.revert();
                }
                if previous.is_none() {
                    plugin.set_module(None);
                }
                error!(plugin = %name, error = %failure, "Plugin failed to load");
                Err(failure)
            }
        }
    }

    /// What this plugin's own code changed since `before`.
    fn window_difference(
        &self,
        plugin: &Plugin,
        before: Option<SnapshotSet>,
    ) -> Option<DifferenceSet> {
        let extractions = plugin.take_extractions();
        let before = before?;
        let mut difference =
            SnapshotSet::capture(&self.snapshot_kinds, &self.client).difference_from(&before);
        for extraction in &extractions {
            difference.extract(extraction);
        }
        Some(difference)
    }

    fn inject_variables(&self, module: &Module, config: &PluginConfig) -> PluginResult<()> {
        if config.extend_default_variables {
            for (name, value) in self.default_variables.read().iter() {
                module.set(name.clone(), value.clone())?;
            }
        }
        for (name, value) in &config.variables {
            module.set(name.clone(), value.clone())?;
        }
        Ok(())
    }

    fn run_entry_point(
        &self,
        plugin: &Plugin,
        module: &Arc<Module>,
        config: &PluginConfig,
        handle: &Handle,
    ) -> PluginResult<()> {
        let hook = resolve_hook(
            plugin,
            module,
            config.entry_point.as_ref(),
            self.default_entry_point.as_deref(),
        )?;
        let result = match hook {
            Some(Hook::Sync(hook)) => hook(module),
            Some(Hook::Async(hook)) => handle.block_on(hook(Arc::clone(module))),
            Some(Hook::Named(_)) | None => return Ok(()),
        };
        result.map_err(|e| PluginError::entry_point(plugin.name(), e))
    }

    // ─── Import ──────────────────────────────────────────────────────────────

    /// Backs [`ModuleScope::import`]: `importer` depends on `name`.
    pub(crate) fn import(
        self: &Arc<Self>,
        importer: &Arc<Plugin>,
        name: &str,
        handle: &Handle,
    ) -> PluginResult<Arc<Module>> {
        let target = self.resolve_or_register(name)?;
        // The new edge must not close a cycle with links already recorded,
        // declared requirements included.
        let closes_cycle = target.depends_on_transitively(importer.name());
        {
            let loading = self.currently_loading.lock();
            if Arc::ptr_eq(&target, importer)
                || closes_cycle
                || loading.iter().any(|n| n == target.name())
            {
                return Err(PluginError::CircularLoad {
                    name: target.name().to_string(),
                    chain: loading.clone(),
                });
            }
        }
        Plugin::link(importer, &target, false);
        debug!(plugin = %importer.name(), dependency = %target.name(), "Dependency discovered");

        if !target.is_loaded() {
            match self.load_plugin(&target, handle)? {
                LoadStatus::Loaded => {
                    if let Some(difference) = target.snapshot_difference() {
                        importer.push_extraction(difference);
                    }
                }
                LoadStatus::Skipped => {
                    return Err(PluginError::DependencyUnsatisfied {
                        name: importer.name().to_string(),
                        dependency: target.name().to_string(),
                    });
                }
                LoadStatus::AlreadyLoaded => {}
            }
        }
        target
            .module()
            .ok_or_else(|| PluginError::not_found(target.name()))
    }

    // ─── Unload ──────────────────────────────────────────────────────────────

    /// Runs one unload under the execution lock.
    ///
    /// A failing exit point is reported, but teardown still completes.
    pub(crate) async fn execute_unload(
        self: &Arc<Self>,
        plugin: Arc<Plugin>,
    ) -> PluginResult<UnloadStatus> {
        let _execution = self.execution.lock().await;
        if !plugin.is_loaded() {
            return Ok(UnloadStatus::NotLoaded);
        }
        let name = plugin.name().to_string();
        let failure = match plugin.module() {
            Some(module) => self.run_exit_point(&plugin, module).await.err(),
            None => None,
        };

        plugin.clear_discovered_links();
        if let Some(difference) = plugin.take_snapshot_difference() {
            difference.revert();
        }
        plugin.set_state(PluginState::Unloaded);

        match failure {
            None => {
                info!(plugin = %name, "Plugin unloaded");
                Ok(UnloadStatus::Unloaded)
            }
            Some(failure) => {
                warn!(plugin = %name, error = %failure, "Plugin unloaded with errors");
                Err(failure)
            }
        }
    }

    async fn run_exit_point(&self, plugin: &Plugin, module: Arc<Module>) -> PluginResult<()> {
        let config = plugin.config();
        let hook = resolve_hook(
            plugin,
            &module,
            config.exit_point.as_ref(),
            self.default_exit_point.as_deref(),
        )?;
        let result = match hook {
            Some(Hook::Sync(hook)) => tokio::task::spawn_blocking(move || hook(&module))
                .await
                .map_err(|e| PluginError::Join {
                    name: plugin.name().to_string(),
                    message: e.to_string(),
                })?,
            Some(Hook::Async(hook)) => hook(module).await,
            Some(Hook::Named(_)) | None => return Ok(()),
        };
        result.map_err(|e| PluginError::exit_point(plugin.name(), e))
    }
}

/// Picks the hook to run.
///
/// A configured hook must resolve; the loader-wide default name is optional.
fn resolve_hook(
    plugin: &Plugin,
    module: &Module,
    configured: Option<&Hook>,
    default: Option<&str>,
) -> PluginResult<Option<Hook>> {
    match configured {
        Some(hook) => match hook.resolve(module) {
            Some(resolved) => Ok(Some(resolved)),
            None => Err(PluginError::MissingHook {
                name: plugin.name().to_string(),
                hook: match hook {
                    Hook::Named(name) => name.clone(),
                    _ => "<hook>".to_string(),
                },
            }),
        },
        None => Ok(default.and_then(|name| Hook::named(name).resolve(module))),
    }
}
