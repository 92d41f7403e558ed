//! Per-plugin load options.

use std::fmt;

use crate::error::{PluginError, PluginResult};
use crate::module::{Hook, Variable, Variables, is_reserved};

/// Options the loader applies when loading one plugin.
///
/// ```rust,ignore
/// let config = PluginConfig::new()
///     .variable("token", Variable::new("abc".to_string()))
///     .entry_point(Hook::named("start"))
///     .requires("storage")
///     .locked(true);
/// ```
#[derive(Clone)]
pub struct PluginConfig {
    /// Hook run after the body. `None` falls back to the loader default.
    pub entry_point: Option<Hook>,
    /// Hook run before teardown. `None` falls back to the loader default.
    pub exit_point: Option<Hook>,
    /// Excluded from `load_all`/`unload_all`/`reload_all`.
    pub locked: bool,
    /// Inject the loader's default variables before these ones.
    pub extend_default_variables: bool,
    /// Record and revert this plugin's client side effects.
    pub take_snapshot_difference: bool,
    /// Variables injected into the module before the body runs.
    pub variables: Variables,
    /// Dependencies declared up front. Unlike imports these survive unloads.
    pub requires: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            entry_point: None,
            exit_point: None,
            locked: false,
            extend_default_variables: true,
            take_snapshot_difference: true,
            variables: Variables::new(),
            requires: Vec::new(),
        }
    }
}

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_point(mut self, hook: Hook) -> Self {
        self.entry_point = Some(hook);
        self
    }

    pub fn exit_point(mut self, hook: Hook) -> Self {
        self.exit_point = Some(hook);
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    pub fn extend_default_variables(mut self, extend: bool) -> Self {
        self.extend_default_variables = extend;
        self
    }

    pub fn take_snapshot_difference(mut self, take: bool) -> Self {
        self.take_snapshot_difference = take;
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: Variable) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn requires(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.requires.contains(&name) {
            self.requires.push(name);
        }
        self
    }

    /// Rejects variables that shadow reserved module attributes.
    pub fn validate(&self, plugin: &str) -> PluginResult<()> {
        match self.variables.keys().find(|name| is_reserved(name)) {
            Some(variable) => Err(PluginError::ReservedVariable {
                name: plugin.to_string(),
                variable: variable.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Applies a later registration on top of this one.
    ///
    /// Scalar options and hooks are replaced, variables are extended, and
    /// declared requirements are unioned.
    pub(crate) fn merge(&mut self, other: PluginConfig) {
        if other.entry_point.is_some() {
            self.entry_point = other.entry_point;
        }
        if other.exit_point.is_some() {
            self.exit_point = other.exit_point;
        }
        self.locked = other.locked;
        self.extend_default_variables = other.extend_default_variables;
        self.take_snapshot_difference = other.take_snapshot_difference;
        self.variables.extend(other.variables);
        for name in other.requires {
            if !self.requires.contains(&name) {
                self.requires.push(name);
            }
        }
    }
}

impl fmt::Debug for PluginConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginConfig")
            .field("entry_point", &self.entry_point)
            .field("exit_point", &self.exit_point)
            .field("locked", &self.locked)
            .field("extend_default_variables", &self.extend_default_variables)
            .field("take_snapshot_difference", &self.take_snapshot_difference)
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("requires", &self.requires)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ATTR_LOADER;

    #[test]
    fn test_defaults() {
        let config = PluginConfig::default();
        assert!(config.extend_default_variables);
        assert!(config.take_snapshot_difference);
        assert!(!config.locked);
    }

    #[test]
    fn test_merge() {
        let mut base = PluginConfig::new()
            .variable("a", Variable::new(1u8))
            .requires("x");
        base.merge(
            PluginConfig::new()
                .locked(true)
                .variable("b", Variable::new(2u8))
                .requires("x")
                .requires("y"),
        );
        assert!(base.locked);
        assert_eq!(base.variables.len(), 2);
        assert_eq!(base.requires, vec!["x", "y"]);
    }

    #[test]
    fn test_validate_reserved() {
        let config = PluginConfig::new().variable(ATTR_LOADER, Variable::new(0u8));
        assert!(matches!(
            config.validate("p"),
            Err(PluginError::ReservedVariable { variable, .. }) if variable == ATTR_LOADER
        ));
    }
}
