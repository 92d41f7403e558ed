//! Configuration schema definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use scion_loader::{Hook, PluginConfig, Variable, Variables};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScionConfig {
    /// Tracing subscriber settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Loader-wide settings.
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Per-plugin settings, keyed by plugin name.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSettings>,
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Every accepted spelling.
    pub const NAMES: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature; falls back to `full` without it.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// When the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base level, overridden by `RUST_LOG`.
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file, required when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Rotated files kept on disk. `0` keeps all of them.
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file names and line numbers.
    #[serde(default)]
    pub file_location: bool,

    /// Per-target levels, e.g. `scion_loader = "debug"`.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            rotation: LogRotation::default(),
            max_files: default_max_files(),
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            filters: BTreeMap::new(),
        }
    }
}

fn default_max_files() -> usize {
    5
}

// =============================================================================
// Loader
// =============================================================================

/// Loader-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directories plugin sources live in. Empty means an in-memory catalog.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Module attribute run after a body. `None` disables the default.
    #[serde(default = "default_entry_point")]
    pub default_entry_point: Option<String>,

    /// Module attribute run before teardown. `None` disables the default.
    #[serde(default = "default_exit_point")]
    pub default_exit_point: Option<String>,

    /// Selectors loaded on start, `pkg.*` wildcards included.
    #[serde(default)]
    pub autoload: Vec<String>,

    /// Variables injected into every plugin that extends defaults.
    #[serde(default)]
    pub default_variables: BTreeMap<String, Value>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            default_entry_point: default_entry_point(),
            default_exit_point: default_exit_point(),
            autoload: Vec::new(),
            default_variables: BTreeMap::new(),
        }
    }
}

impl LoaderConfig {
    /// Default variables as loader values. Plugins read them as [`Value`].
    pub fn variables(&self) -> Variables {
        to_variables(&self.default_variables)
    }
}

fn default_entry_point() -> Option<String> {
    Some(scion_loader::DEFAULT_ENTRY_POINT.to_string())
}

fn default_exit_point() -> Option<String> {
    Some(scion_loader::DEFAULT_EXIT_POINT.to_string())
}

// =============================================================================
// Plugins
// =============================================================================

/// Settings for one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Excluded from `*_all` operations and from removal.
    #[serde(default)]
    pub locked: bool,

    #[serde(default = "default_true")]
    pub extend_default_variables: bool,

    #[serde(default = "default_true")]
    pub take_snapshot_difference: bool,

    /// Module attribute used instead of the loader default.
    #[serde(default)]
    pub entry_point: Option<String>,

    #[serde(default)]
    pub exit_point: Option<String>,

    /// Declared dependencies.
    #[serde(default)]
    pub requires: Vec<String>,

    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            locked: false,
            extend_default_variables: true,
            take_snapshot_difference: true,
            entry_point: None,
            exit_point: None,
            requires: Vec::new(),
            variables: BTreeMap::new(),
        }
    }
}

impl PluginSettings {
    /// Converts to the loader's registration config.
    pub fn to_plugin_config(&self) -> PluginConfig {
        let mut config = PluginConfig::new()
            .locked(self.locked)
            .extend_default_variables(self.extend_default_variables)
            .take_snapshot_difference(self.take_snapshot_difference)
            .variables(to_variables(&self.variables));
        if let Some(name) = &self.entry_point {
            config = config.entry_point(Hook::named(name.as_str()));
        }
        if let Some(name) = &self.exit_point {
            config = config.exit_point(Hook::named(name.as_str()));
        }
        for dependency in &self.requires {
            config = config.requires(dependency.as_str());
        }
        config
    }
}

fn default_true() -> bool {
    true
}

fn to_variables(values: &BTreeMap<String, Value>) -> Variables {
    values
        .iter()
        .map(|(name, value)| (name.clone(), Variable::new(value.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScionConfig::default();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.loader.default_entry_point.as_deref(), Some("setup"));
        assert_eq!(config.loader.default_exit_point.as_deref(), Some("teardown"));
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_plugin_settings_from_json() {
        let settings: PluginSettings = serde_json::from_value(serde_json::json!({
            "locked": true,
            "entry_point": "start",
            "requires": ["base"],
            "variables": { "token": "abc" }
        }))
        .unwrap();
        assert!(settings.extend_default_variables);

        let config = settings.to_plugin_config();
        assert!(config.locked);
        assert_eq!(config.requires, vec!["base".to_string()]);
        assert!(matches!(config.entry_point, Some(Hook::Named(ref name)) if name == "start"));
        let token = config.variables["token"].downcast_ref::<Value>().unwrap();
        assert_eq!(token, "abc");
    }

    #[test]
    fn test_disabled_default_hook() {
        let loader: LoaderConfig =
            serde_json::from_value(serde_json::json!({ "default_exit_point": null })).unwrap();
        assert_eq!(loader.default_entry_point.as_deref(), Some("setup"));
        assert_eq!(loader.default_exit_point, None);
    }
}
