//! Commands and events as immutable messages.
//!
//! Both message kinds share one shape: a UUID, a symbolic name, a JSON
//! payload, a metadata map, and a creation timestamp. They differ in role:
//!
//! - [`Command`] = intent, dispatched to exactly one handler
//! - [`Event`] = fact, appended to a stream
//!
//! Messages are never mutated in place. Adding metadata returns a new value,
//! which is what lets the enricher stamp events without touching the
//! caller's copy.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message metadata. Ordered so that serialized events are deterministic.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Shared read surface of commands and events.
pub trait Message {
    /// Unique identifier of this message.
    fn uuid(&self) -> Uuid;

    /// Symbolic name, e.g. `"RegisterUser"`.
    fn message_name(&self) -> &str;

    /// Metadata attached to this message.
    fn metadata(&self) -> &Metadata;

    /// When the message was created.
    fn created_at(&self) -> DateTime<Utc>;
}

// =============================================================================
// Command
// =============================================================================

/// A request to change state, dispatched to exactly one handler.
///
/// # Example
///
/// ```ignore
/// use causation::Command;
/// use serde_json::json;
///
/// let cmd = Command::new("RegisterUser", json!({ "email": "a@example.com" }));
/// bus.dispatch(cmd).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    uuid: Uuid,
    message_name: String,
    payload: serde_json::Value,
    metadata: Metadata,
    created_at: DateTime<Utc>,
}

impl Command {
    /// Create a command with a fresh random UUID.
    pub fn new(message_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::with_uuid(Uuid::new_v4(), message_name, payload)
    }

    /// Create a command with a caller-chosen UUID.
    pub fn with_uuid(
        uuid: Uuid,
        message_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            uuid,
            message_name: message_name.into(),
            payload,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Return a copy with `key` set to `value` in the metadata.
    pub fn with_added_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The command payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Whether this command can serve as a cause.
    ///
    /// A cause needs a non-nil id and a non-empty name, otherwise the
    /// stamped metadata would point at nothing.
    pub fn is_identifiable(&self) -> bool {
        !self.uuid.is_nil() && !self.message_name.is_empty()
    }
}

impl Message for Command {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn message_name(&self) -> &str {
        &self.message_name
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message_name, self.uuid)
    }
}

// =============================================================================
// Event
// =============================================================================

/// A fact, persisted in an append-only stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    uuid: Uuid,
    message_name: String,
    payload: serde_json::Value,
    metadata: Metadata,
    created_at: DateTime<Utc>,
}

impl Event {
    /// Create an event with a fresh random UUID and empty metadata.
    pub fn new(message_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            message_name: message_name.into(),
            payload,
            metadata: Metadata::new(),
            created_at: Utc::now(),
        }
    }

    /// Return a copy with `key` set to `value` in the metadata.
    ///
    /// An existing entry under `key` is overwritten.
    pub fn with_added_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The event payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Look up a metadata entry as a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

impl Message for Event {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn message_name(&self) -> &str {
        &self.message_name
    }

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_new_assigns_unique_ids() {
        let a = Command::new("RegisterUser", json!({}));
        let b = Command::new("RegisterUser", json!({}));

        assert_ne!(a.uuid(), b.uuid());
        assert_eq!(a.message_name(), "RegisterUser");
        assert!(a.metadata().is_empty());
    }

    #[test]
    fn test_with_added_metadata_leaves_source_untouched() {
        let event = Event::new("UserRegistered", json!({ "id": 1 }));
        let stamped = event.clone().with_added_metadata("region", "eu");

        assert!(event.metadata().is_empty());
        assert_eq!(stamped.metadata_str("region"), Some("eu"));
        assert_eq!(stamped.uuid(), event.uuid());
        assert_eq!(stamped.payload(), event.payload());
    }

    #[test]
    fn test_with_added_metadata_overwrites_existing_key() {
        let event = Event::new("UserRegistered", json!({}))
            .with_added_metadata("k", "old")
            .with_added_metadata("k", "new");

        assert_eq!(event.metadata_str("k"), Some("new"));
        assert_eq!(event.metadata().len(), 1);
    }

    #[test]
    fn test_identifiable_command() {
        assert!(Command::new("RegisterUser", json!({})).is_identifiable());
        assert!(!Command::with_uuid(Uuid::nil(), "RegisterUser", json!({})).is_identifiable());
        assert!(!Command::new("", json!({})).is_identifiable());
    }

    #[test]
    fn test_command_display() {
        let uuid = Uuid::new_v4();
        let cmd = Command::with_uuid(uuid, "RegisterUser", json!({}));
        assert_eq!(cmd.to_string(), format!("RegisterUser ({})", uuid));
    }

    #[test]
    fn test_event_serializes_metadata() {
        let event = Event::new("UserRegistered", json!({})).with_added_metadata("a", 1);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["metadata"]["a"], json!(1));
        assert_eq!(value["message_name"], json!("UserRegistered"));
    }
}
