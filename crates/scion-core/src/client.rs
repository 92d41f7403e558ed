//! The shared runtime context plugins mutate.

use std::fmt;
use std::sync::Arc;

use crate::command::CommandRegistry;
use crate::handler::EventHandlerRegistry;

/// Shared client context.
///
/// Everything a plugin can register that must be undone when the plugin is
/// unloaded lives here. A client is always handled through `Arc<Client>`;
/// snapshots keep only a `Weak` reference to it.
pub struct Client {
    id: String,
    events: EventHandlerRegistry,
    commands: CommandRegistry,
}

impl Client {
    /// Creates a new client with empty registries.
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            events: EventHandlerRegistry::new(),
            commands: CommandRegistry::new(),
        })
    }

    /// Returns the client identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the event handler registry.
    pub fn events(&self) -> &EventHandlerRegistry {
        &self.events
    }

    /// Returns the command registry.
    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("events", &self.events)
            .field("commands", &self.commands)
            .finish()
    }
}
