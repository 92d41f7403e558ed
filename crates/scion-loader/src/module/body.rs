use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::error::BoxError;

use super::ModuleScope;

/// Early exit from a module body.
///
/// `?` converts any error into [`BodyError::Failed`]; use
/// [`BodyError::skip`] (or [`ModuleScope::require`]) to opt out of loading
/// without reporting a failure.
pub enum BodyError {
    /// Do not load this plugin. It ends up `Unsatisfied`.
    Skip(String),
    /// The body failed.
    Failed(BoxError),
}

impl BodyError {
    /// Opt out of loading.
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    /// Fail with any error or message.
    pub fn fail(error: impl Into<BoxError>) -> Self {
        Self::Failed(error.into())
    }
}

impl<E> From<E> for BodyError
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::Failed(Box::new(error))
    }
}

impl fmt::Debug for BodyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip(reason) => f.debug_tuple("Skip").field(reason).finish(),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// What a module body returns.
pub type BodyResult = Result<(), BodyError>;

/// How executing a module ended.
#[derive(Debug)]
pub enum LoadOutcome {
    /// The body (and entry point) completed.
    Loaded,
    /// The body asked not to be loaded.
    Skipped(String),
    /// The body failed.
    Failed(BoxError),
}

impl LoadOutcome {
    /// `true` for [`LoadOutcome::Loaded`].
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }
}

impl From<BodyResult> for LoadOutcome {
    fn from(result: BodyResult) -> Self {
        match result {
            Ok(()) => Self::Loaded,
            Err(BodyError::Skip(reason)) => Self::Skipped(reason),
            Err(BodyError::Failed(error)) => Self::Failed(error),
        }
    }
}

type BodyFn = dyn Fn(&mut ModuleScope<'_>) -> BodyResult + Send + Sync;

/// The executable code of a plugin.
#[derive(Clone)]
pub struct ModuleBody(Arc<BodyFn>);

impl ModuleBody {
    /// Wraps a closure.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&mut ModuleScope<'_>) -> BodyResult + Send + Sync + 'static,
    {
        Self(Arc::new(body))
    }

    /// Wraps a plain function pointer.
    pub fn from_fn(body: fn(&mut ModuleScope<'_>) -> BodyResult) -> Self {
        Self(Arc::new(body))
    }

    /// Runs the body. Panics are caught and reported as failures.
    pub(crate) fn execute(&self, scope: &mut ModuleScope<'_>) -> LoadOutcome {
        let body = Arc::clone(&self.0);
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(scope))) {
            Ok(result) => result.into(),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "module body panicked".to_string());
                LoadOutcome::Failed(message.into())
            }
        }
    }
}

impl fmt::Debug for ModuleBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ModuleBody(..)")
    }
}
