//! # Scion Core
//!
//! Shared context for the Scion plugin loader.
//!
//! A [`Client`] owns the registries that plugin code mutates while it loads:
//!
//! - [`EventHandlerRegistry`]: event name -> ordered async handlers
//! - [`CommandRegistry`]: command name -> async command
//!
//! Both registries hand out ids for every registration and support putting a
//! removed entry back unchanged, which is what the loader's snapshot
//! machinery needs to revert a plugin.
//!
//! ```rust,ignore
//! use scion_core::{Client, Event};
//!
//! let client = Client::new("main");
//! client.events().register("ready", "greet", |event: Event| async move {
//!     println!("got {}", event.name());
//! })?;
//! client.events().dispatch(&Event::new("ready")).await;
//! ```

pub mod client;
pub mod command;
pub mod error;
pub mod event;
pub mod handler;

pub use client::Client;
pub use command::{Command, CommandHandler, CommandId, CommandInfo, CommandRegistry};
pub use error::{RegistryError, RegistryResult};
pub use event::Event;
pub use handler::{BoxedHandler, EventHandlerRegistry, Handler, HandlerEntry, HandlerId};

/// Re-exported so handler closures can name boxed futures.
pub use futures::future::BoxFuture;
