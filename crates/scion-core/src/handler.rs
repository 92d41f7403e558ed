//! Event handler registry.
//!
//! Handlers are stored per event name in registration order. Every
//! registration gets a fresh [`HandlerId`], so two registrations of the same
//! closure are still two distinct entries. Entries removed with
//! [`EventHandlerRegistry::unregister`] can be put back verbatim with
//! [`EventHandlerRegistry::restore`]; the plugin loader relies on this to
//! revert what a plugin changed.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{RegistryError, RegistryResult};
use crate::event::Event;

// =============================================================================
// Handler trait
// =============================================================================

/// An async event handler.
///
/// Implemented for every `Fn(Event) -> impl Future<Output = ()>` closure, so
/// most callers never name this trait.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles one event.
    async fn call(&self, event: Event);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn call(&self, event: Event) {
        (self)(event).await
    }
}

/// Type-erased handler.
pub type BoxedHandler = Arc<dyn Handler>;

// =============================================================================
// HandlerEntry
// =============================================================================

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler#{}", self.0)
    }
}

/// One registered handler. Equality and hashing use the id only.
#[derive(Clone)]
pub struct HandlerEntry {
    id: HandlerId,
    event: String,
    name: String,
    handler: BoxedHandler,
}

impl HandlerEntry {
    /// Returns the registration id.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Returns the event name this handler listens to.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Returns the display name given at registration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the handler itself.
    pub fn handler(&self) -> &BoxedHandler {
        &self.handler
    }
}

impl PartialEq for HandlerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HandlerEntry {}

impl Hash for HandlerEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// EventHandlerRegistry
// =============================================================================

/// Event name -> ordered handler list.
#[derive(Default)]
pub struct EventHandlerRegistry {
    handlers: RwLock<BTreeMap<String, Vec<HandlerEntry>>>,
}

impl EventHandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event` and returns the new registration id.
    pub fn register<H>(
        &self,
        event: impl Into<String>,
        name: impl Into<String>,
        handler: H,
    ) -> RegistryResult<HandlerId>
    where
        H: Handler,
    {
        let event = event.into();
        if event.is_empty() {
            return Err(RegistryError::EmptyEventName);
        }
        let entry = HandlerEntry {
            id: HandlerId::next(),
            event: event.clone(),
            name: name.into(),
            handler: Arc::new(handler),
        };
        let id = entry.id;
        trace!(event = %event, handler = %entry.name, id = %id, "Event handler registered");
        self.handlers.write().entry(event).or_default().push(entry);
        Ok(id)
    }

    /// Removes the registration with `id`, returning it.
    pub fn unregister(&self, id: HandlerId) -> Option<HandlerEntry> {
        let mut handlers = self.handlers.write();
        let mut removed = None;
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|e| e.id == id) {
                removed = Some(list.remove(pos));
                break;
            }
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Puts a previously removed entry back where it was registered.
    ///
    /// Ids grow with every registration, so each list stays sorted by id and
    /// the entry's original position is recovered from its id.
    ///
    /// Returns `false` when an entry with the same id is already present.
    pub fn restore(&self, entry: HandlerEntry) -> bool {
        let mut handlers = self.handlers.write();
        let list = handlers.entry(entry.event.clone()).or_default();
        let pos = list.partition_point(|e| e.id < entry.id);
        if list.get(pos).is_some_and(|e| e.id == entry.id) {
            return false;
        }
        list.insert(pos, entry);
        true
    }

    /// Returns the handlers for `event` in registration order.
    pub fn handlers(&self, event: &str) -> Vec<HandlerEntry> {
        self.handlers.read().get(event).cloned().unwrap_or_default()
    }

    /// Returns every entry, grouped by event name (sorted) and then in
    /// registration order.
    pub fn entries(&self) -> Vec<HandlerEntry> {
        self.handlers.read().values().flatten().cloned().collect()
    }

    /// Returns `true` when the registration `id` is present.
    pub fn contains(&self, id: HandlerId) -> bool {
        self.handlers
            .read()
            .values()
            .any(|list| list.iter().any(|e| e.id == id))
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every handler registered for the event, sequentially.
    ///
    /// The handler list is copied first, so handlers may register or
    /// unregister handlers without deadlocking. Returns how many ran.
    pub async fn dispatch(&self, event: &Event) -> usize {
        let handlers = self.handlers(event.name());
        debug!(event = %event.name(), handlers = handlers.len(), "Dispatching event");
        for entry in &handlers {
            entry.handler.call(event.clone()).await;
        }
        handlers.len()
    }
}

impl fmt::Debug for EventHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlerRegistry")
            .field("len", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>, by: usize) -> impl Handler {
        let counter = Arc::clone(counter);
        move |_event: Event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(by, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_handlers_in_order() {
        let registry = EventHandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        registry.register("ready", "a", counting(&counter, 1)).unwrap();
        registry.register("ready", "b", counting(&counter, 10)).unwrap();
        registry.register("other", "c", counting(&counter, 100)).unwrap();

        let ran = registry.dispatch(&Event::new("ready")).await;
        assert_eq!(ran, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_unregister_and_restore() {
        let registry = EventHandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = registry.register("ready", "a", counting(&counter, 1)).unwrap();
        assert_eq!(registry.len(), 1);

        let entry = registry.unregister(id).unwrap();
        assert!(registry.is_empty());
        assert!(registry.unregister(id).is_none());

        assert!(registry.restore(entry.clone()));
        assert!(!registry.restore(entry));
        assert!(registry.contains(id));
    }

    #[test]
    fn test_restore_keeps_dispatch_order() {
        let registry = EventHandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let first = registry.register("ready", "first", counting(&counter, 1)).unwrap();
        let middle = registry.register("ready", "middle", counting(&counter, 1)).unwrap();
        let last = registry.register("ready", "last", counting(&counter, 1)).unwrap();

        let entry = registry.unregister(middle).unwrap();
        let later = registry.register("ready", "later", counting(&counter, 1)).unwrap();
        assert!(registry.restore(entry));

        let ids: Vec<HandlerId> = registry.handlers("ready").iter().map(HandlerEntry::id).collect();
        assert_eq!(ids, vec![first, middle, last, later]);
    }

    #[test]
    fn test_same_closure_twice_gives_distinct_entries() {
        let registry = EventHandlerRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let a = registry.register("ready", "x", counting(&counter, 1)).unwrap();
        let b = registry.register("ready", "x", counting(&counter, 1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.handlers("ready").len(), 2);
    }

    #[test]
    fn test_empty_event_name_rejected() {
        let registry = EventHandlerRegistry::new();
        let err = registry
            .register("", "x", |_e: Event| async {})
            .unwrap_err();
        assert_eq!(err, RegistryError::EmptyEventName);
    }
}
