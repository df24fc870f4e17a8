//! Causation metadata enricher.
//!
//! Hooks both write paths of an [`ActionEventEmitterEventStore`] and stamps
//! every event passing through with the command that caused it:
//!
//! | Key               | Value                                  |
//! |-------------------|----------------------------------------|
//! | `_causation_id`   | the command's UUID, hyphenated         |
//! | `_causation_name` | the command's message name             |
//!
//! Both listeners run at [`PRIORITY_CAUSATION`]: after validation and the
//! general enrichers, before the write. Events recorded with no command in
//! flight pass through untouched, in the same order.
//!
//! Stamping is best-effort. Nothing here can fail a write.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::context::CausationContext;
use crate::emitter::{ActionEvent, Attachment};
use crate::message::{Command, Event, Message};
use crate::store::{
    ActionEventEmitterEventStore, EventStore, Stream, StoreAction, EVENT_APPEND_TO, EVENT_CREATE,
    PRIORITY_CAUSATION,
};

/// Metadata key holding the causing command's UUID.
pub const CAUSATION_ID_KEY: &str = "_causation_id";

/// Metadata key holding the causing command's name.
pub const CAUSATION_NAME_KEY: &str = "_causation_name";

/// Stage label of both store listeners.
pub const STAGE_CAUSATION_METADATA: &str = "causation-metadata";

/// Stamps recorded events with the command currently being dispatched.
#[derive(Debug, Clone)]
pub struct CausationMetadataEnricher {
    context: Arc<CausationContext>,
}

impl CausationMetadataEnricher {
    pub fn new(context: Arc<CausationContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<CausationContext> {
        &self.context
    }

    /// Attach to the "appendTo" and "create" hooks of `store`.
    ///
    /// Dropping the returned [`Attachment`] keeps both listeners in place.
    pub fn set_up<S: EventStore>(
        &self,
        store: &ActionEventEmitterEventStore<S>,
    ) -> Attachment<StoreAction> {
        let emitter = store.action_event_emitter();
        let mut attachment = Attachment::new(emitter.clone());

        let context = self.context.clone();
        attachment.track(emitter.attach_listener(
            EVENT_APPEND_TO,
            STAGE_CAUSATION_METADATA,
            PRIORITY_CAUSATION,
            move |action| on_append_to(&context, action),
        ));

        let context = self.context.clone();
        attachment.track(emitter.attach_listener(
            EVENT_CREATE,
            STAGE_CAUSATION_METADATA,
            PRIORITY_CAUSATION,
            move |action| on_create(&context, action),
        ));

        attachment
    }

    /// Stamp `event` with `command` as its cause.
    ///
    /// Existing `_causation_*` entries are overwritten; every other entry is
    /// kept as is.
    pub fn enrich(&self, event: Event, command: &Command) -> Event {
        stamp(event, command)
    }

    /// Stamp `events` with the current cause, if there is one.
    pub fn enrich_all(&self, events: Vec<Event>) -> Vec<Event> {
        enrich_events(&self.context, events)
    }
}

fn stamp(event: Event, command: &Command) -> Event {
    event
        .with_added_metadata(CAUSATION_ID_KEY, command.uuid().to_string())
        .with_added_metadata(CAUSATION_NAME_KEY, command.message_name())
}

/// The current cause, or `None` if there is none worth stamping.
fn current_cause(context: &CausationContext) -> Option<Arc<Command>> {
    let command = context.current()?;
    if !command.is_identifiable() {
        debug!(
            command = %command,
            "in-flight command has no usable identity, skipping causation metadata"
        );
        return None;
    }
    Some(command)
}

fn enrich_events(context: &CausationContext, events: Vec<Event>) -> Vec<Event> {
    events
        .into_iter()
        .map(|event| match current_cause(context) {
            Some(command) => stamp(event, &command),
            None => event,
        })
        .collect()
}

fn on_append_to(context: &CausationContext, action: &mut ActionEvent<StoreAction>) {
    if let StoreAction::AppendTo { stream_name, events } = action.params_mut() {
        trace!(stream = %stream_name, events = events.len(), "enriching appended events");
        *events = enrich_events(context, std::mem::take(events));
    }
}

fn on_create(context: &CausationContext, action: &mut ActionEvent<StoreAction>) {
    if let StoreAction::Create { stream } = action.params_mut() {
        let placeholder = Stream::new("", Vec::new(), Default::default());
        let (name, events, metadata) = std::mem::replace(stream, placeholder).into_parts();
        trace!(stream = %name, events = events.len(), "enriching new stream");
        *stream = Stream::new(name, enrich_events(context, events), metadata);
    }
}
