use scion_core::{Client, Command};
use tracing::warn;

use super::{SnapshotType, get_set_difference};

/// Application command registrations.
///
/// Names are unique, so the difference is a plain set difference.
pub struct Commands;

impl SnapshotType for Commands {
    type Entry = Command;

    const KIND: &'static str = "commands";

    fn capture(client: &Client) -> Vec<Command> {
        client.commands().entries()
    }

    fn revert_added(client: &Client, entry: &Command) {
        client.commands().unregister(entry.id());
    }

    fn revert_removed(client: &Client, entry: &Command) {
        if !client.commands().restore(entry.clone()) {
            warn!(command = %entry.name(), "Cannot restore command, name is taken");
        }
    }

    fn difference(before: &[Command], after: &[Command]) -> (Vec<Command>, Vec<Command>) {
        get_set_difference(before, after)
    }
}
