//! Testing utilities for causation tracking.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! causation = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use causation::testing::{assert_caused_by, CausationHarness};
//!
//! let harness = CausationHarness::new();
//! harness.route_recording("RegisterUser", "users", |cmd| {
//!     vec![Event::new("UserRegistered", cmd.payload().clone())]
//! });
//!
//! let cmd = Command::new("RegisterUser", json!({ "email": "a@b.c" }));
//! harness.bus().dispatch(cmd.clone()).await?;
//!
//! for event in harness.events("users").await {
//!     assert_caused_by(&event, &cmd);
//! }
//! ```

use std::sync::Arc;

use crate::dispatch::{handler_fn, CommandBus};
use crate::enricher::{CAUSATION_ID_KEY, CAUSATION_NAME_KEY};
use crate::error::EventStoreError;
use crate::message::{Command, Event, Message, Metadata};
use crate::store::{
    ActionEventEmitterEventStore, EventStore, InMemoryEventStore, Stream, StreamName,
};
use crate::tracking::CausationTracking;

/// Panics unless `event` carries `command` as its cause.
pub fn assert_caused_by(event: &Event, command: &Command) {
    let expected_id = command.uuid().to_string();
    assert_eq!(
        event.metadata_str(CAUSATION_ID_KEY),
        Some(expected_id.as_str()),
        "event {} has the wrong causation id\n  metadata: {:?}",
        event.message_name(),
        event.metadata()
    );
    assert_eq!(
        event.metadata_str(CAUSATION_NAME_KEY),
        Some(command.message_name()),
        "event {} has the wrong causation name\n  metadata: {:?}",
        event.message_name(),
        event.metadata()
    );
}

/// Panics if `event` carries any causation metadata.
pub fn assert_uncaused(event: &Event) {
    assert!(
        !event.metadata().contains_key(CAUSATION_ID_KEY)
            && !event.metadata().contains_key(CAUSATION_NAME_KEY),
        "event {} unexpectedly carries causation metadata: {:?}",
        event.message_name(),
        event.metadata()
    );
}

/// A command bus and an in-memory store with causation tracking attached.
pub struct CausationHarness {
    bus: CommandBus,
    store: Arc<ActionEventEmitterEventStore<InMemoryEventStore>>,
    tracking: CausationTracking,
}

impl Default for CausationHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl CausationHarness {
    pub fn new() -> Self {
        let bus = CommandBus::new();
        let store = Arc::new(ActionEventEmitterEventStore::new(InMemoryEventStore::new()));
        let tracking = CausationTracking::attach(&bus, &*store);
        Self { bus, store, tracking }
    }

    pub fn bus(&self) -> &CommandBus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<ActionEventEmitterEventStore<InMemoryEventStore>> {
        &self.store
    }

    pub fn tracking(&self) -> &CausationTracking {
        &self.tracking
    }

    /// Hand the tracking out, e.g. to detach it mid-test.
    pub fn into_parts(
        self,
    ) -> (
        CommandBus,
        Arc<ActionEventEmitterEventStore<InMemoryEventStore>>,
        CausationTracking,
    ) {
        (self.bus, self.store, self.tracking)
    }

    /// Route `command_name` to a handler that records `make_events(cmd)`
    /// on `stream`, creating the stream on first use.
    pub fn route_recording<F>(&self, command_name: &str, stream: &str, make_events: F)
    where
        F: Fn(&Command) -> Vec<Event> + Send + Sync + 'static,
    {
        let store = self.store.clone();
        let stream = StreamName::new(stream);
        let make_events = Arc::new(make_events);
        self.bus.route_replace(
            command_name,
            handler_fn(move |cmd: Command| {
                let store = store.clone();
                let stream = stream.clone();
                let make_events = make_events.clone();
                async move {
                    record(&*store, &stream, make_events(&cmd))
                        .await
                        .map_err(anyhow::Error::from)
                }
            }),
        );
    }

    /// Every event stored on `stream`; empty if the stream does not exist.
    pub async fn events(&self, stream: &str) -> Vec<Event> {
        self.store
            .load(&StreamName::new(stream), 0, None)
            .await
            .unwrap_or_default()
    }
}

/// Append `events` to `stream`, creating it if it does not exist yet.
pub async fn record<S: EventStore>(
    store: &S,
    stream: &StreamName,
    events: Vec<Event>,
) -> Result<(), EventStoreError> {
    if store.has_stream(stream).await {
        return store.append_to(stream, events).await;
    }

    // Another writer may create the stream between the check and the create.
    match store.create(Stream::new(stream.clone(), events.clone(), Metadata::new())).await {
        Err(EventStoreError::StreamExistsAlready(_)) => store.append_to(stream, events).await,
        result => result,
    }
}
