//! Event store with interception hooks.
//!
//! [`EventStore`] is the write/read surface. [`InMemoryEventStore`] keeps
//! streams in a map. [`ActionEventEmitterEventStore`] decorates any store
//! and runs listener chains around the two write paths:
//!
//! | Event name   | Payload                                          |
//! |--------------|--------------------------------------------------|
//! | `"create"`   | [`StoreAction::Create`]: the new stream          |
//! | `"appendTo"` | [`StoreAction::AppendTo`]: stream name + events  |
//!
//! Listeners above [`PRIORITY_PERSIST`] run before the write and may replace
//! the payload. Listeners at or below it run after a successful write.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::emitter::{ActionEvent, ActionEventEmitter, Priority};
use crate::error::EventStoreError;
use crate::message::{Event, Metadata};

/// Fired before a new stream is written.
pub const EVENT_CREATE: &str = "create";

/// Fired before events are appended to an existing stream.
pub const EVENT_APPEND_TO: &str = "appendTo";

/// Checks that reject or rewrite writes.
pub const PRIORITY_VALIDATE: Priority = Priority(10_000);

/// General metadata enrichers.
pub const PRIORITY_ENRICH: Priority = Priority(1_000);

/// Causation stamping: after every other enricher, before the write.
pub const PRIORITY_CAUSATION: Priority = Priority(100);

/// The write itself. Listeners at or below run after it.
pub const PRIORITY_PERSIST: Priority = Priority(0);

// =============================================================================
// Stream
// =============================================================================

/// Name of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName(String);

impl StreamName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A named, ordered collection of events plus stream metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    name: StreamName,
    events: Vec<Event>,
    metadata: Metadata,
}

impl Stream {
    pub fn new(name: impl Into<StreamName>, events: Vec<Event>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            events,
            metadata,
        }
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Split into name, events and metadata.
    pub fn into_parts(self) -> (StreamName, Vec<Event>, Metadata) {
        (self.name, self.events, self.metadata)
    }
}

// =============================================================================
// Event Store
// =============================================================================

/// Append-only stream storage.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Create a new stream with its initial events.
    async fn create(&self, stream: Stream) -> Result<(), EventStoreError>;

    /// Append events to an existing stream.
    async fn append_to(
        &self,
        stream_name: &StreamName,
        events: Vec<Event>,
    ) -> Result<(), EventStoreError>;

    /// Read events starting at position `from` (0-based), at most `count`.
    async fn load(
        &self,
        stream_name: &StreamName,
        from: usize,
        count: Option<usize>,
    ) -> Result<Vec<Event>, EventStoreError>;

    async fn has_stream(&self, stream_name: &StreamName) -> bool;

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Metadata, EventStoreError>;
}

/// Streams kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<StreamName, Stream>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn create(&self, stream: Stream) -> Result<(), EventStoreError> {
        let mut streams = self.streams.write().await;
        if streams.contains_key(stream.name()) {
            return Err(EventStoreError::StreamExistsAlready(stream.name().clone()));
        }
        streams.insert(stream.name().clone(), stream);
        Ok(())
    }

    async fn append_to(
        &self,
        stream_name: &StreamName,
        events: Vec<Event>,
    ) -> Result<(), EventStoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .get_mut(stream_name)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_name.clone()))?;
        stream.events.extend(events);
        Ok(())
    }

    async fn load(
        &self,
        stream_name: &StreamName,
        from: usize,
        count: Option<usize>,
    ) -> Result<Vec<Event>, EventStoreError> {
        let streams = self.streams.read().await;
        let stream = streams
            .get(stream_name)
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_name.clone()))?;
        let events = stream.events.iter().skip(from);
        Ok(match count {
            Some(n) => events.take(n).cloned().collect(),
            None => events.cloned().collect(),
        })
    }

    async fn has_stream(&self, stream_name: &StreamName) -> bool {
        self.streams.read().await.contains_key(stream_name)
    }

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Metadata, EventStoreError> {
        self.streams
            .read()
            .await
            .get(stream_name)
            .map(|s| s.metadata.clone())
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_name.clone()))
    }
}

// =============================================================================
// Action Event Emitter Event Store
// =============================================================================

/// Payload of the store's action events.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    Create { stream: Stream },
    AppendTo { stream_name: StreamName, events: Vec<Event> },
}

impl StoreAction {
    pub fn stream_name(&self) -> &StreamName {
        match self {
            StoreAction::Create { stream } => stream.name(),
            StoreAction::AppendTo { stream_name, .. } => stream_name,
        }
    }
}

/// An [`EventStore`] decorator that lets listeners see and rewrite writes.
///
/// # Example
///
/// ```ignore
/// let store = ActionEventEmitterEventStore::new(InMemoryEventStore::new());
///
/// store.action_event_emitter().attach_listener(
///     EVENT_APPEND_TO,
///     "audit",
///     PRIORITY_ENRICH,
///     |event| { /* inspect event.params() */ },
/// );
///
/// store.append_to(&"orders-1".into(), events).await?;
/// ```
pub struct ActionEventEmitterEventStore<S = InMemoryEventStore> {
    inner: S,
    emitter: ActionEventEmitter<StoreAction>,
}

impl<S: EventStore> ActionEventEmitterEventStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            emitter: ActionEventEmitter::new(),
        }
    }

    pub fn action_event_emitter(&self) -> &ActionEventEmitter<StoreAction> {
        &self.emitter
    }

    /// The decorated store. Writes made through it bypass all listeners.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S> fmt::Debug for ActionEventEmitterEventStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionEventEmitterEventStore")
            .field("emitter", &self.emitter)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: EventStore> EventStore for ActionEventEmitterEventStore<S> {
    async fn create(&self, stream: Stream) -> Result<(), EventStoreError> {
        let mut action = ActionEvent::new(EVENT_CREATE, StoreAction::Create { stream });
        self.emitter.emit_above(&mut action, PRIORITY_PERSIST);

        // Listeners may only swap the stream, never the kind of write.
        let StoreAction::Create { stream } = action.params().clone() else {
            let stream = action.params().stream_name().clone();
            warn!(%stream, "create listener replaced the payload kind, nothing written");
            return Err(EventStoreError::PayloadReplaced {
                action: EVENT_CREATE,
                stream,
            });
        };

        debug!(stream = %stream.name(), events = stream.events().len(), "creating stream");
        self.inner.create(stream).await?;

        // Reset any stop from the pre-persist chain.
        action.set_name(EVENT_CREATE);
        self.emitter.emit_at_or_below(&mut action, PRIORITY_PERSIST);
        Ok(())
    }

    async fn append_to(
        &self,
        stream_name: &StreamName,
        events: Vec<Event>,
    ) -> Result<(), EventStoreError> {
        let mut action = ActionEvent::new(
            EVENT_APPEND_TO,
            StoreAction::AppendTo {
                stream_name: stream_name.clone(),
                events,
            },
        );
        self.emitter.emit_above(&mut action, PRIORITY_PERSIST);

        let StoreAction::AppendTo { events, .. } = action.params().clone() else {
            warn!(
                stream = %stream_name,
                "appendTo listener replaced the payload kind, nothing written"
            );
            return Err(EventStoreError::PayloadReplaced {
                action: EVENT_APPEND_TO,
                stream: stream_name.clone(),
            });
        };

        debug!(stream = %stream_name, events = events.len(), "appending events");
        self.inner.append_to(stream_name, events).await?;

        action.set_name(EVENT_APPEND_TO);
        self.emitter.emit_at_or_below(&mut action, PRIORITY_PERSIST);
        Ok(())
    }

    async fn load(
        &self,
        stream_name: &StreamName,
        from: usize,
        count: Option<usize>,
    ) -> Result<Vec<Event>, EventStoreError> {
        self.inner.load(stream_name, from, count).await
    }

    async fn has_stream(&self, stream_name: &StreamName) -> bool {
        self.inner.has_stream(stream_name).await
    }

    async fn fetch_stream_metadata(
        &self,
        stream_name: &StreamName,
    ) -> Result<Metadata, EventStoreError> {
        self.inner.fetch_stream_metadata(stream_name).await
    }
}
