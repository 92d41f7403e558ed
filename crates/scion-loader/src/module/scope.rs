use std::any::Any;
use std::sync::Arc;

use scion_core::{Client, CommandHandler, CommandId, Handler, HandlerId, RegistryResult};
use tokio::runtime::Handle;

use crate::error::PluginResult;
use crate::loader::LoaderShared;
use crate::plugin::Plugin;

use super::{BodyError, BodyResult, Hook, Module, Variable};

/// A module body's view of the world while it executes.
///
/// Besides namespace access, the scope is where dependencies are discovered:
/// [`import`](Self::import) records that the executing plugin depends on
/// another one and makes sure that plugin is loaded first.
pub struct ModuleScope<'a> {
    shared: &'a Arc<LoaderShared>,
    plugin: &'a Arc<Plugin>,
    module: &'a Arc<Module>,
    handle: &'a Handle,
}

impl<'a> ModuleScope<'a> {
    pub(crate) fn new(
        shared: &'a Arc<LoaderShared>,
        plugin: &'a Arc<Plugin>,
        module: &'a Arc<Module>,
        handle: &'a Handle,
    ) -> Self {
        Self {
            shared,
            plugin,
            module,
            handle,
        }
    }

    /// Name of the executing plugin.
    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    /// The executing plugin.
    pub fn plugin(&self) -> &Arc<Plugin> {
        self.plugin
    }

    /// The module being populated.
    pub fn module(&self) -> &Arc<Module> {
        self.module
    }

    /// The shared client.
    pub fn client(&self) -> &Arc<Client> {
        &self.shared.client
    }

    /// An injected variable (or any attribute set so far) as `T`.
    pub fn variable<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.module.get_as::<T>(name)
    }

    /// Sets a module attribute.
    pub fn set<T: Any + Send + Sync>(&self, name: &str, value: T) -> PluginResult<()> {
        self.module.set(name, Variable::new(value))
    }

    /// Exposes a hook under `name`, e.g. the default `setup`/`teardown`.
    pub fn set_hook(&self, name: &str, hook: Hook) -> PluginResult<()> {
        self.set(name, hook)
    }

    /// Skips loading unless every named variable is present.
    ///
    /// ```rust,ignore
    /// catalog.insert("greeter", |scope| {
    ///     scope.require(&["token"])?;
    ///     Ok(())
    /// });
    /// ```
    pub fn require(&self, names: &[&str]) -> BodyResult {
        let missing: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| !self.module.contains(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BodyError::skip(format!(
                "missing required variables: {}",
                missing.join(", ")
            )))
        }
    }

    /// Imports another plugin.
    ///
    /// Records "this plugin depends on `name`", loads `name` right here if it
    /// is not loaded yet, and returns its module. Importing a plugin that is
    /// itself in the middle of loading, or that already depends on this one,
    /// fails with [`PluginError::CircularLoad`](crate::PluginError::CircularLoad).
    pub fn import(&mut self, name: &str) -> PluginResult<Arc<Module>> {
        self.shared.import(self.plugin, name, self.handle)
    }

    /// Registers an event handler on the client, named after this plugin.
    pub fn on_event<H: Handler>(&self, event: &str, handler: H) -> RegistryResult<HandlerId> {
        self.shared
            .client
            .events()
            .register(event, self.plugin.name(), handler)
    }

    /// Registers a command on the client.
    pub fn command<H: CommandHandler>(
        &self,
        name: &str,
        description: &str,
        handler: H,
    ) -> RegistryResult<CommandId> {
        self.shared
            .client
            .commands()
            .register(name, description, handler)
    }
}
