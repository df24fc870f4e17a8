//! # Causation
//!
//! Stamps every event recorded while a command is being handled with the
//! identity of that command.
//!
//! ## Core Concepts
//!
//! Causation tracking links **facts** back to the **intent** that produced them:
//! - [`Command`] = Intent (what was asked for)
//! - [`Event`] = Facts (what happened because of it)
//!
//! Every event recorded during a command's dispatch cycle carries two
//! metadata entries:
//!
//! | Key               | Value                        |
//! |-------------------|------------------------------|
//! | `_causation_id`   | the command's UUID           |
//! | `_causation_name` | the command's message name   |
//!
//! ## Architecture
//!
//! ```text
//! CommandBus.dispatch(cmd)
//!     │
//!     ▼ "dispatch" @ Priority::FIRST
//! DispatchObserver ──► CausationContext.set(dispatch_id, cmd)
//!     │                        │
//!     ▼                        │ current()
//! CommandHandler.handle(cmd)   │
//!     │                        │
//!     ▼ append_to() / create() │
//! ActionEventEmitterEventStore │
//!     │                        │
//!     ├─► "appendTo"/"create" @ PRIORITY_CAUSATION
//!     │        CausationMetadataEnricher ◄──┘
//!     │            (stamps each event)
//!     ▼
//! inner EventStore (write)
//!     │
//!     ▼ "finalize" @ Priority::LAST
//! DispatchObserver ──► CausationContext.clear(dispatch_id)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **No leakage** - Once a dispatch cycle finalizes (or is dropped), nothing
//!    recorded afterwards carries its command
//! 2. **Own cause only** - Concurrent cycles never stamp each other's command
//! 3. **Pass-through** - Events recorded outside any cycle are written unchanged
//! 4. **Order and identity** - Enrichment keeps event order, stream name and stream metadata
//! 5. **Best-effort** - Stamping never fails a write
//!
//! ## Dispatch Cycles
//!
//! Each [`CommandBus::dispatch`] runs inside a task-local [`DispatchId`]
//! scope. Work spawned onto another task leaves that scope; wrap it with
//! [`propagate`] to keep recording against the same cause:
//!
//! ```ignore
//! tokio::spawn(causation::propagate(async move {
//!     store.append_to(&stream, events).await
//! }));
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use causation::{
//!     handler_fn, ActionEventEmitterEventStore, CausationConfig, CausationTracking, Command,
//!     CommandBus, CommandBusRegistry, Event, EventStore, InMemoryEventStore, Stream,
//! };
//! use std::sync::Arc;
//!
//! let bus = CommandBus::new();
//! let store = Arc::new(ActionEventEmitterEventStore::new(InMemoryEventStore::new()));
//!
//! let mut buses = CommandBusRegistry::new();
//! buses.register("command_bus", bus.clone());
//!
//! let tracking = CausationTracking::builder()
//!     .config(CausationConfig::from_env()?)
//!     .build(&buses, &*store)?;
//!
//! let s = store.clone();
//! bus.route("RegisterUser", handler_fn(move |cmd: Command| {
//!     let store = s.clone();
//!     async move {
//!         let event = Event::new("UserRegistered", cmd.payload().clone());
//!         store.create(Stream::new("user-1", vec![event], Default::default())).await?;
//!         Ok(())
//!     }
//! }))?;
//!
//! bus.dispatch(Command::new("RegisterUser", serde_json::json!({ "email": "a@b.c" }))).await?;
//! // The stored UserRegistered event now carries _causation_id / _causation_name.
//! ```

mod config;
mod context;
mod cycle;
mod dispatch;
mod emitter;
mod enricher;
mod error;
mod message;
mod observer;
mod store;
mod tracking;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export message types
pub use message::{Command, Event, Message, Metadata};

// Re-export dispatch cycle scoping
pub use cycle::{propagate, DispatchId};

// Re-export action event emitter types
pub use emitter::{ActionEvent, ActionEventEmitter, Attachment, ListenerHandle, Priority};

// Re-export command bus types
pub use dispatch::{
    handler_fn, CommandBus, CommandBusRegistry, CommandHandler, DispatchOutcome, DispatchParams,
    HandlerFn, EVENT_DISPATCH, EVENT_FINALIZE, PRIORITY_INVOKE_HANDLER,
};

// Re-export event store types
pub use store::{
    ActionEventEmitterEventStore, EventStore, InMemoryEventStore, StoreAction, Stream, StreamName,
    EVENT_APPEND_TO, EVENT_CREATE, PRIORITY_CAUSATION, PRIORITY_ENRICH, PRIORITY_PERSIST,
    PRIORITY_VALIDATE,
};

// Re-export causation tracking types
pub use context::CausationContext;
pub use enricher::{
    CausationMetadataEnricher, CAUSATION_ID_KEY, CAUSATION_NAME_KEY, STAGE_CAUSATION_METADATA,
};
pub use observer::{DispatchObserver, STAGE_CLEAR_CAUSATION, STAGE_SET_CAUSATION};
pub use tracking::{CausationTracking, CausationTrackingBuilder};

// Re-export configuration
pub use config::{CausationConfig, DEFAULT_DISPATCHER_SERVICE_KEY, DISPATCHER_SERVICE_KEY_VAR};

// Re-export error types
pub use error::{CommandBusError, EventStoreError, WiringError};

// Re-export commonly used external types
pub use async_trait::async_trait;
