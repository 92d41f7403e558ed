//! Events delivered to registered handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named event with an arbitrary JSON payload.
///
/// The client does not interpret payloads; handlers pick out what they need.
///
/// ```rust,ignore
/// let event = Event::new("message_create").with_payload(json!({ "content": "hi" }));
/// client.events().dispatch(&event).await;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    name: String,
    #[serde(default)]
    payload: Value,
}

impl Event {
    /// Creates an event with a `null` payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
        }
    }

    /// Attaches a payload (builder pattern).
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Returns the event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Looks up a string field of an object payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
