//! Runtime orchestration.
//!
//! [`ScionRuntime`] turns a [`ScionConfig`] into a running plugin host:
//! logging, a [`Client`], a catalog-backed [`PluginLoader`], configured
//! plugin registrations and the autoload batch. Stopping unloads every
//! unlocked plugin.
//!
//! ```rust,ignore
//! let runtime = ScionRuntime::builder()
//!     .config_file("config/scion.toml")
//!     .profile("production")
//!     .build()?;
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use scion_core::Client;
use scion_loader::{ModuleCatalog, PluginLoader};
use tokio::signal;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigLoader, LoaderConfig, ScionConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Id of the client a runtime creates.
pub const CLIENT_ID: &str = "scion";

/// A configured plugin host.
pub struct ScionRuntime {
    config: ScionConfig,
    catalog: Arc<ModuleCatalog>,
    loader: PluginLoader,
    running: RwLock<bool>,
    shutdown: CancellationToken,
}

impl ScionRuntime {
    /// Loads configuration from the current directory, falling back to
    /// defaults when it cannot be read.
    pub fn new() -> RuntimeResult<Self> {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                ScionConfig::default()
            });
        Self::from_config(&config)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Builds a runtime whose catalog is derived from `loader.search_paths`
    /// and holds every statically linked module.
    pub fn from_config(config: &ScionConfig) -> RuntimeResult<Self> {
        let catalog = Arc::new(catalog_for(&config.loader));
        Self::with_catalog(config, catalog)
    }

    /// Builds a runtime around an existing catalog.
    pub fn with_catalog(config: &ScionConfig, catalog: Arc<ModuleCatalog>) -> RuntimeResult<Self> {
        validate_config(config)?;
        logging::init_from_config(&config.logging);

        let loader = PluginLoader::builder(Client::new(CLIENT_ID), catalog.clone())
            .default_entry_point(config.loader.default_entry_point.as_deref())
            .default_exit_point(config.loader.default_exit_point.as_deref())
            .default_variables(config.loader.variables())
            .build()?;

        info!(
            log_level = %config.logging.level,
            roots = ?catalog.roots(),
            plugins = config.plugins.len(),
            "Runtime initialized from configuration"
        );

        Ok(Self {
            config: config.clone(),
            catalog,
            loader,
            running: RwLock::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ScionConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<Client> {
        self.loader.client()
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Cancelling this token stops [`run`](Self::run) and
    /// [`run_until`](Self::run_until).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Registers the configured plugins and loads the autoload selectors.
    ///
    /// Plugins that fail to register or load are logged; the rest stay up.
    pub async fn start(&self) -> RuntimeResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(RuntimeError::AlreadyRunning);
            }
            *running = true;
        }
        info!("Starting Scion runtime");

        for (name, settings) in &self.config.plugins {
            match self.loader.register(name.as_str(), settings.to_plugin_config()) {
                Ok(_) => debug!(plugin = %name, "Registered configured plugin"),
                Err(e) => error!(plugin = %name, error = %e, "Failed to register plugin"),
            }
        }

        let autoload = &self.config.loader.autoload;
        if !autoload.is_empty() {
            match self.loader.load(autoload.clone()).await {
                Ok(plugins) => info!(count = plugins.len(), "Autoload finished"),
                Err(e) => error!(
                    failed = ?e.plugin_names(),
                    error = %e,
                    "Autoload finished with errors"
                ),
            }
        }

        info!(loaded = self.loaded_count(), "Runtime started");
        Ok(())
    }

    /// Unloads every unlocked plugin.
    pub async fn stop(&self) -> RuntimeResult<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                warn!("Runtime is not running");
                return Ok(());
            }
            *running = false;
        }
        info!("Stopping Scion runtime");
        self.shutdown.cancel();

        let result = self.loader.unload_all().await;
        if let Err(e) = &result {
            error!(failed = ?e.plugin_names(), error = %e, "Error during plugin teardown");
        }
        info!(loaded = self.loaded_count(), "Runtime stopped");
        result.map(|_| ()).map_err(Into::into)
    }

    /// Runs until Ctrl+C, SIGTERM or [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Scion runtime is now running. Press Ctrl+C to stop.");
        self.wait_for_shutdown().await;
        self.stop().await
    }

    /// Runs until `shutdown` completes or the shutdown token is cancelled.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        tokio::select! {
            _ = shutdown => {}
            _ = self.shutdown.cancelled() => {}
        }
        self.stop().await
    }

    async fn wait_for_shutdown(&self) {
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                        _ = self.shutdown.cancelled() => info!("Shutdown requested"),
                    }
                    return;
                }
                Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
            }
        }

        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
            _ = self.shutdown.cancelled() => info!("Shutdown requested"),
        }
    }

    fn loaded_count(&self) -> usize {
        self.loader
            .plugins()
            .iter()
            .filter(|plugin| plugin.is_loaded())
            .count()
    }
}

/// On-disk catalog over the search paths, or an in-memory one without them.
fn catalog_for(loader: &LoaderConfig) -> ModuleCatalog {
    let mut roots = loader.search_paths.iter();
    let catalog = match roots.next() {
        Some(first) => roots.fold(ModuleCatalog::with_root(first), |catalog, root| {
            catalog.search_root(root)
        }),
        None => ModuleCatalog::new(),
    };
    catalog.with_static_modules()
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`ScionRuntime`] with custom configuration sources.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    catalog: Option<Arc<ModuleCatalog>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
            catalog: None,
        }
    }

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    pub fn merge(mut self, config: ScionConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses `catalog` instead of one derived from the configuration.
    pub fn catalog(mut self, catalog: Arc<ModuleCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(self) -> RuntimeResult<ScionRuntime> {
        let config = self.config_loader.load()?;
        match self.catalog {
            Some(catalog) => ScionRuntime::with_catalog(&config, catalog),
            None => ScionRuntime::from_config(&config),
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use scion_core::Event;
    use scion_loader::{BodyError, Hook, PluginState};
    use serde_json::{Value, json};
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::config::{ConfigError, PluginSettings};

    async fn noop(_: Event) {}

    fn catalog() -> Arc<ModuleCatalog> {
        let catalog = Arc::new(ModuleCatalog::new());
        catalog.insert("base", |scope| {
            scope.on_event("ready", noop)?;
            Ok(())
        });
        catalog.insert("greeter", |scope| {
            scope.on_event("message", noop)?;
            scope.set_hook("setup", Hook::sync(|_| Ok(())))?;
            Ok(())
        });
        catalog.insert("broken", |_| Err(BodyError::fail("broken on purpose")));
        catalog
    }

    fn config() -> ScionConfig {
        let mut config = ScionConfig::default();
        config.loader.autoload = vec!["greeter".into(), "broken".into()];
        config
            .loader
            .default_variables
            .insert("greeting".into(), json!("hello"));
        config.plugins.insert(
            "greeter".into(),
            PluginSettings {
                requires: vec!["base".into()],
                ..Default::default()
            },
        );
        config.plugins.insert(
            "pinned".into(),
            PluginSettings {
                locked: true,
                ..Default::default()
            },
        );
        config
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let runtime = ScionRuntime::with_catalog(&config(), catalog()).unwrap();
        assert_ok!(runtime.start().await);
        assert!(runtime.is_running().await);

        let loader = runtime.loader();
        assert!(loader.is_loaded("base"));
        assert!(loader.is_loaded("greeter"));
        assert!(!loader.is_loaded("broken"));
        // not in the catalog, logged and skipped
        assert!(loader.get_plugin("pinned").is_none());
        assert_eq!(runtime.client().events().len(), 2);

        let greeter = loader.get_plugin("greeter").unwrap().module().unwrap();
        assert_eq!(*greeter.get_as::<Value>("greeting").unwrap(), json!("hello"));

        assert_err!(runtime.start().await);

        assert_ok!(runtime.stop().await);
        assert!(!runtime.is_running().await);
        assert!(runtime.shutdown_token().is_cancelled());
        assert!(runtime.client().events().is_empty());
        assert_eq!(
            loader.get_plugin("greeter").map(|p| p.state()),
            Some(PluginState::Unloaded)
        );
    }

    #[tokio::test]
    async fn test_run_until_token() {
        let runtime = ScionRuntime::with_catalog(&config(), catalog()).unwrap();
        let token = runtime.shutdown_token();

        let (result, _) = tokio::join!(runtime.run_until(std::future::pending()), async {
            while !runtime.is_running().await {
                tokio::task::yield_now().await;
            }
            token.cancel();
        });
        assert_ok!(result);
        assert!(!runtime.is_running().await);
        assert!(!runtime.loader().is_loaded("greeter"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config
            .loader
            .default_variables
            .insert("__plugin__".into(), Value::Null);
        let error = ScionRuntime::with_catalog(&config, catalog()).err().unwrap();
        assert!(matches!(
            error,
            RuntimeError::Config(ConfigError::ReservedVariable { .. })
        ));
    }

    #[cfg(feature = "toml-config")]
    #[tokio::test]
    async fn test_builder_with_file_and_search_paths() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        let config_file = dir.path().join("scion.toml");
        std::fs::write(
            &config_file,
            format!(
                "[loader]\nsearch_paths = [{:?}]\nautoload = [\"disk\"]\n",
                plugins.display().to_string()
            ),
        )
        .unwrap();

        let runtime = ScionRuntime::builder()
            .config_file(&config_file)
            .without_env()
            .build()
            .unwrap();
        assert_eq!(runtime.catalog().roots(), [plugins.clone()]);

        let spec = runtime.catalog().insert("disk", |_| Ok(()));
        std::fs::write(spec.path(), "// disk").unwrap();
        assert_ok!(runtime.start().await);
        assert!(runtime.loader().is_loaded("disk"));
        assert_ok!(runtime.stop().await);
    }
}
