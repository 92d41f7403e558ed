use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::BoxError;

use super::Module;

/// Result of an entry or exit point.
pub type HookResult = Result<(), BoxError>;

type SyncHookFn = dyn Fn(&Module) -> HookResult + Send + Sync;
type AsyncHookFn = dyn Fn(Arc<Module>) -> BoxFuture<'static, HookResult> + Send + Sync;

/// An entry point (run after the body) or exit point (run before teardown).
///
/// Whether a hook is synchronous or asynchronous is decided when it is
/// built, so the loader never has to guess at call time:
///
/// ```rust,ignore
/// let setup = Hook::sync(|module| { println!("{} up", module.name()); Ok(()) });
/// let teardown = Hook::future(|module| async move { flush(&module).await; Ok(()) });
/// let by_name = Hook::named("setup"); // resolved from the module's attributes
/// ```
#[derive(Clone)]
pub enum Hook {
    /// Runs on a blocking executor thread.
    Sync(Arc<SyncHookFn>),
    /// Awaited.
    Async(Arc<AsyncHookFn>),
    /// A module attribute holding a [`Hook`], looked up when the hook runs.
    Named(String),
}

impl Hook {
    /// Builds a synchronous hook.
    pub fn sync<F>(hook: F) -> Self
    where
        F: Fn(&Module) -> HookResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(hook))
    }

    /// Builds an asynchronous hook.
    pub fn future<F, Fut>(hook: F) -> Self
    where
        F: Fn(Arc<Module>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |module| hook(module).boxed()))
    }

    /// Refers to a hook stored in the module under `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// `true` for asynchronous hooks.
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }

    /// Resolves a [`Hook::Named`] against `module`.
    ///
    /// Returns `None` when the attribute is missing or is not a callable
    /// hook. Named hooks never chain to other named hooks.
    pub fn resolve(&self, module: &Module) -> Option<Hook> {
        match self {
            Self::Named(name) => match module.get_as::<Hook>(name) {
                Some(hook) if !matches!(*hook, Hook::Named(_)) => Some((*hook).clone()),
                _ => None,
            },
            other => Some(other.clone()),
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Hook::Sync(..)"),
            Self::Async(_) => f.write_str("Hook::Async(..)"),
            Self::Named(name) => f.debug_tuple("Hook::Named").field(name).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Variable;
    use crate::source::ModuleSpec;

    #[test]
    fn test_named_resolution() {
        let module = Module::new(&ModuleSpec::new("a", "a.rs", false));
        assert!(Hook::named("setup").resolve(&module).is_none());

        module
            .set("setup", Variable::new(Hook::sync(|_| Ok(()))))
            .unwrap();
        let resolved = Hook::named("setup").resolve(&module).unwrap();
        assert!(!resolved.is_async());

        module
            .set("loop", Variable::new(Hook::named("setup")))
            .unwrap();
        assert!(Hook::named("loop").resolve(&module).is_none());

        module.set("setup", Variable::new(42u8)).unwrap();
        assert!(Hook::named("setup").resolve(&module).is_none());
    }

    #[test]
    fn test_future_hook_is_async() {
        let hook = Hook::future(|_module| async { Ok(()) });
        assert!(hook.is_async());
    }
}
