use std::sync::Arc;

use tokio::runtime::Handle;

use crate::error::LoaderResult;
use crate::extractor::PluginSelector;
use crate::plugin::{Plugin, PluginConfig};

use super::PluginLoader;

/// The blocking calling convention of a [`PluginLoader`].
///
/// Every operation is driven to completion on the given runtime. Call it
/// from plain threads only: blocking inside an async task, or from a module
/// body (use [`ModuleScope::import`](crate::ModuleScope::import) there),
/// panics or deadlocks.
///
/// ```rust,ignore
/// let runtime = tokio::runtime::Runtime::new()?;
/// let loader = PluginLoader::new(client, catalog).blocking(runtime.handle().clone());
/// loader.load("greeter")?;
/// ```
#[derive(Clone)]
pub struct BlockingPluginLoader {
    loader: PluginLoader,
    handle: Handle,
}

impl BlockingPluginLoader {
    pub fn new(loader: PluginLoader, handle: Handle) -> Self {
        Self { loader, handle }
    }

    /// The wrapped async loader.
    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn register(
        &self,
        selector: impl Into<PluginSelector>,
        config: PluginConfig,
    ) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.loader.register(selector, config)
    }

    pub fn remove(&self, selector: impl Into<PluginSelector>) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.loader.remove(selector)
    }

    pub fn register_and_load(
        &self,
        selector: impl Into<PluginSelector>,
        config: PluginConfig,
    ) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.handle
            .block_on(self.loader.register_and_load(selector, config))
    }

    pub fn load(&self, selector: impl Into<PluginSelector>) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.handle.block_on(self.loader.load(selector))
    }

    pub fn unload(&self, selector: impl Into<PluginSelector>) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.handle.block_on(self.loader.unload(selector))
    }

    pub fn reload(&self, selector: impl Into<PluginSelector>) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.handle.block_on(self.loader.reload(selector))
    }

    pub fn load_all(&self) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.handle.block_on(self.loader.load_all())
    }

    pub fn unload_all(&self) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.handle.block_on(self.loader.unload_all())
    }

    pub fn reload_all(&self) -> LoaderResult<Vec<Arc<Plugin>>> {
        self.handle.block_on(self.loader.reload_all())
    }
}
