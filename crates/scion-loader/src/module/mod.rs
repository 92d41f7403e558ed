//! The module a plugin's code executes in.
//!
//! A [`Module`] is a namespace of named, type-erased attributes. The loader
//! creates one per plugin on its first load and re-uses it on every reload
//! (the namespace is cleared and re-populated, the object itself survives),
//! so other code holding an `Arc<Module>` always sees the live version.
//!
//! - [`ModuleBody`] / [`BodyResult`] / [`LoadOutcome`]: what runs and how it ends
//! - [`Hook`]: entry and exit points
//! - [`ModuleScope`]: the body's view of the loader while it runs

mod body;
mod hook;
mod scope;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PluginError, PluginResult};
use crate::source::ModuleSpec;

pub use body::{BodyError, BodyResult, LoadOutcome, ModuleBody};
pub use hook::{Hook, HookResult};
pub use scope::ModuleScope;

// ─── Reserved attributes ─────────────────────────────────────────────────────

/// Module name (`String`).
pub const ATTR_NAME: &str = "__name__";
/// Source path (`PathBuf`).
pub const ATTR_FILE: &str = "__file__";
/// Package directory, packages only (`PathBuf`).
pub const ATTR_PATH: &str = "__path__";
/// The [`ModuleSpec`] the module was created from.
pub const ATTR_SPEC: &str = "__spec__";
/// `Weak<Plugin>` of the owning plugin.
pub const ATTR_PLUGIN: &str = "__plugin__";
/// [`WeakPluginLoader`](crate::WeakPluginLoader) of the owning loader.
pub const ATTR_LOADER: &str = "__loader__";

/// Attribute names the loader owns. Injected variables may not use them.
pub const RESERVED_ATTRIBUTES: &[&str] = &[
    ATTR_NAME,
    ATTR_FILE,
    ATTR_PATH,
    ATTR_SPEC,
    ATTR_PLUGIN,
    ATTR_LOADER,
];

/// `true` when `name` is a reserved module attribute.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_ATTRIBUTES.contains(&name)
}

// ─── Variable ────────────────────────────────────────────────────────────────

/// A type-erased module attribute value.
#[derive(Clone)]
pub struct Variable(Arc<dyn Any + Send + Sync>);

impl Variable {
    /// Wraps a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrows the value as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Shares the value as `Arc<T>`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }

    /// `true` when the value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl From<serde_json::Value> for Variable {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.downcast_ref::<serde_json::Value>() {
            write!(f, "Variable({value})")
        } else if let Some(value) = self.downcast_ref::<String>() {
            write!(f, "Variable({value:?})")
        } else {
            f.write_str("Variable(..)")
        }
    }
}

/// Name -> variable map injected into modules.
pub type Variables = BTreeMap<String, Variable>;

// ─── Module ──────────────────────────────────────────────────────────────────

/// A plugin's namespace.
pub struct Module {
    spec: ModuleSpec,
    attributes: RwLock<BTreeMap<String, Variable>>,
}

impl Module {
    pub(crate) fn new(spec: &ModuleSpec) -> Self {
        let module = Self {
            spec: spec.clone(),
            attributes: RwLock::new(BTreeMap::new()),
        };
        module.reset();
        module
    }

    /// Module (and plugin) name.
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        self.spec.path()
    }

    /// `true` for package modules.
    pub fn is_package(&self) -> bool {
        self.spec.is_package()
    }

    /// Looks up an attribute.
    pub fn get(&self, name: &str) -> Option<Variable> {
        self.attributes.read().get(name).cloned()
    }

    /// Looks up an attribute as `Arc<T>`.
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(|v| v.downcast::<T>())
    }

    /// `true` when the attribute exists.
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.read().contains_key(name)
    }

    /// Sets a non-reserved attribute.
    pub fn set(&self, name: impl Into<String>, value: Variable) -> PluginResult<()> {
        let name = name.into();
        if is_reserved(&name) {
            return Err(PluginError::ReservedVariable {
                name: self.name().to_string(),
                variable: name,
            });
        }
        self.attributes.write().insert(name, value);
        Ok(())
    }

    /// Removes a non-reserved attribute.
    pub fn remove(&self, name: &str) -> Option<Variable> {
        if is_reserved(name) {
            return None;
        }
        self.attributes.write().remove(name)
    }

    /// Attribute names, sorted.
    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.read().keys().cloned().collect()
    }

    pub(crate) fn set_reserved(&self, name: &'static str, value: Variable) {
        debug_assert!(is_reserved(name));
        self.attributes.write().insert(name.to_string(), value);
    }

    /// Clears the namespace back to the loader-owned attributes.
    pub(crate) fn reset(&self) {
        let mut attributes = self.attributes.write();
        attributes.clear();
        attributes.insert(
            ATTR_NAME.to_string(),
            Variable::new(self.spec.name().to_string()),
        );
        attributes.insert(
            ATTR_FILE.to_string(),
            Variable::new(self.spec.path().to_path_buf()),
        );
        attributes.insert(ATTR_SPEC.to_string(), Variable::new(self.spec.clone()));
        if self.spec.is_package() {
            let dir = self
                .spec
                .path()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(PathBuf::new);
            attributes.insert(ATTR_PATH.to_string(), Variable::new(dir));
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("path", &self.path())
            .field("attributes", &self.attribute_names())
            .finish()
    }
}
