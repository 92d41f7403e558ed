use scion_core::{Client, HandlerEntry};

use super::SnapshotType;

/// Event handler registrations.
pub struct EventHandlers;

impl SnapshotType for EventHandlers {
    type Entry = HandlerEntry;

    const KIND: &'static str = "event_handlers";

    fn capture(client: &Client) -> Vec<HandlerEntry> {
        client.events().entries()
    }

    fn revert_added(client: &Client, entry: &HandlerEntry) {
        client.events().unregister(entry.id());
    }

    fn revert_removed(client: &Client, entry: &HandlerEntry) {
        client.events().restore(entry.clone());
    }
}
