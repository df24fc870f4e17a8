//! Causation context: which command each in-flight dispatch cycle is handling.
//!
//! One slot per dispatch cycle, keyed by [`DispatchId`]. The dispatch
//! observer is the only writer; the enricher is the only reader. Concurrent
//! cycles each see their own command, and a cycle's slot is gone once its
//! finalize listeners have run.

use std::sync::Arc;

use dashmap::DashMap;

use crate::cycle::DispatchId;
use crate::message::Command;

/// Commands of the dispatch cycles currently in flight.
#[derive(Debug, Default)]
pub struct CausationContext {
    slots: DashMap<DispatchId, Arc<Command>>,
}

impl CausationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `command` as the cause for everything `dispatch_id` records.
    ///
    /// Replaces any earlier command for the same cycle.
    pub fn set(&self, dispatch_id: DispatchId, command: Arc<Command>) {
        self.slots.insert(dispatch_id, command);
    }

    /// Forget the cycle's command. A no-op if nothing is set.
    pub fn clear(&self, dispatch_id: DispatchId) {
        self.slots.remove(&dispatch_id);
    }

    /// The command of the cycle the caller runs in, if any.
    pub fn current(&self) -> Option<Arc<Command>> {
        DispatchId::current().and_then(|id| self.get(id))
    }

    /// The command recorded for `dispatch_id`, if any.
    pub fn get(&self, dispatch_id: DispatchId) -> Option<Arc<Command>> {
        self.slots.get(&dispatch_id).map(|slot| slot.value().clone())
    }

    /// Number of cycles with a command set.
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    /// True when no cycle has a command set.
    pub fn is_idle(&self) -> bool {
        self.slots.is_empty()
    }
}
