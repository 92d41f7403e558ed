//! Application command registry.
//!
//! Commands are keyed by name, so unlike event handlers a name can only be
//! registered once at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{RegistryError, RegistryResult};

/// An async command callback. Receives the command arguments and returns the
/// reply text.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Runs the command.
    async fn invoke(&self, args: Vec<String>) -> String;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = String> + Send + 'static,
{
    async fn invoke(&self, args: Vec<String>) -> String {
        (self)(args).await
    }
}

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one command registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CommandId(u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command#{}", self.0)
    }
}

/// A registered command. Equality and hashing use the id only.
#[derive(Clone)]
pub struct Command {
    id: CommandId,
    name: String,
    description: String,
    handler: Arc<dyn CommandHandler>,
}

impl Command {
    /// Returns the registration id.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Returns the command name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializable summary of this command.
    pub fn info(&self) -> CommandInfo {
        CommandInfo {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Command {}

impl Hash for Command {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandInfo {
    pub id: CommandId,
    pub name: String,
    pub description: String,
}

/// Name -> command.
#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<BTreeMap<String, Command>>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command. Fails when the name is taken.
    pub fn register<H>(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        handler: H,
    ) -> RegistryResult<CommandId>
    where
        H: CommandHandler,
    {
        let name = name.into();
        let mut commands = self.commands.write();
        if commands.contains_key(&name) {
            return Err(RegistryError::duplicate_command(name));
        }
        let id = CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed));
        trace!(command = %name, id = %id, "Command registered");
        commands.insert(
            name.clone(),
            Command {
                id,
                name,
                description: description.into(),
                handler: Arc::new(handler),
            },
        );
        Ok(id)
    }

    /// Removes the command with `id`, returning it.
    pub fn unregister(&self, id: CommandId) -> Option<Command> {
        let mut commands = self.commands.write();
        let name = commands
            .iter()
            .find(|(_, c)| c.id == id)
            .map(|(name, _)| name.clone())?;
        commands.remove(&name)
    }

    /// Puts a previously removed command back. Returns `false` when its name
    /// is occupied.
    pub fn restore(&self, command: Command) -> bool {
        let mut commands = self.commands.write();
        if commands.contains_key(&command.name) {
            return false;
        }
        commands.insert(command.name.clone(), command);
        true
    }

    /// Looks up a command by name.
    pub fn get(&self, name: &str) -> Option<Command> {
        self.commands.read().get(name).cloned()
    }

    /// Every command, sorted by name.
    pub fn entries(&self) -> Vec<Command> {
        self.commands.read().values().cloned().collect()
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    /// Returns `true` when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.commands.read().is_empty()
    }

    /// Invokes the command called `name`.
    pub async fn invoke(&self, name: &str, args: Vec<String>) -> RegistryResult<String> {
        let command = self
            .get(name)
            .ok_or_else(|| RegistryError::command_not_found(name))?;
        debug!(command = %name, args = args.len(), "Invoking command");
        Ok(command.handler.invoke(args).await)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("names", &self.commands.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
