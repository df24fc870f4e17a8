//! Dispatch observer: keeps the causation context in step with the bus.
//!
//! ```text
//! "dispatch" @ Priority::FIRST  → context.set(dispatch_id, command)
//! "finalize" @ Priority::LAST   → context.clear(dispatch_id)
//! ```
//!
//! Setting runs before every other dispatch listener and therefore before
//! the handler. Clearing runs after every other finalize listener, so
//! finalize listeners that record events still see the cause.
//!
//! Each attachment remembers the cycles it armed. Detaching it mid-cycle
//! clears those slots, since their finalize will no longer reach the
//! clearing listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, trace};

use crate::context::CausationContext;
use crate::cycle::DispatchId;
use crate::dispatch::{CommandBus, DispatchParams, EVENT_DISPATCH, EVENT_FINALIZE};
use crate::emitter::{ActionEventEmitter, Attachment, Priority};
use crate::message::{Command, Message};

/// Stage label of the listener that arms the context.
pub const STAGE_SET_CAUSATION: &str = "causation-context-set";

/// Stage label of the listener that disarms the context.
pub const STAGE_CLEAR_CAUSATION: &str = "causation-context-clear";

/// Bridges bus lifecycle notifications into [`CausationContext`] updates.
#[derive(Debug, Clone)]
pub struct DispatchObserver {
    context: Arc<CausationContext>,
}

impl DispatchObserver {
    pub fn new(context: Arc<CausationContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<CausationContext> {
        &self.context
    }

    /// Attach to `bus`. Detach with [`Attachment::detach_all`].
    pub fn attach(&self, bus: &CommandBus) -> Attachment<DispatchParams> {
        self.attach_to_emitter(bus.action_event_emitter())
    }

    /// Attach to a bus's emitter directly.
    pub fn attach_to_emitter(
        &self,
        emitter: &ActionEventEmitter<DispatchParams>,
    ) -> Attachment<DispatchParams> {
        let mut attachment = Attachment::new(emitter.clone());
        let armed = Arc::new(ArmedCycles::default());

        let (context, cycles) = (self.context.clone(), armed.clone());
        attachment.track(emitter.attach_listener(
            EVENT_DISPATCH,
            STAGE_SET_CAUSATION,
            Priority::FIRST,
            move |action| {
                let params = action.params();
                trace!(
                    dispatch_id = %params.dispatch_id(),
                    command = params.command().message_name(),
                    "causation context set"
                );
                cycles.arm(&context, params.dispatch_id(), params.command().clone());
            },
        ));

        let (context, cycles) = (self.context.clone(), armed.clone());
        attachment.track(emitter.attach_listener(
            EVENT_FINALIZE,
            STAGE_CLEAR_CAUSATION,
            Priority::LAST,
            move |action| {
                let dispatch_id = action.params().dispatch_id();
                trace!(%dispatch_id, "causation context cleared");
                cycles.disarm(&context, dispatch_id);
            },
        ));

        let context = self.context.clone();
        attachment.on_detach(move || armed.release(&context));

        attachment
    }
}

/// Cycles one attachment has set in the context and not yet cleared.
#[derive(Debug, Default)]
struct ArmedCycles {
    ids: DashSet<DispatchId>,
    detached: AtomicBool,
}

impl ArmedCycles {
    fn arm(&self, context: &CausationContext, dispatch_id: DispatchId, command: Arc<Command>) {
        self.ids.insert(dispatch_id);
        context.set(dispatch_id, command);

        // A set listener snapshotted before detach may still run after it.
        if self.detached.load(Ordering::SeqCst) {
            self.disarm(context, dispatch_id);
        }
    }

    fn disarm(&self, context: &CausationContext, dispatch_id: DispatchId) {
        context.clear(dispatch_id);
        self.ids.remove(&dispatch_id);
    }

    fn release(&self, context: &CausationContext) {
        self.detached.store(true, Ordering::SeqCst);
        let ids: Vec<DispatchId> = self.ids.iter().map(|id| *id).collect();
        if !ids.is_empty() {
            debug!(cycles = ids.len(), "observer detached mid-cycle, clearing causation context");
        }
        for dispatch_id in ids {
            self.disarm(context, dispatch_id);
        }
    }
}
