//! Wiring: one context shared by one observer and one enricher.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::CausationConfig;
use crate::context::CausationContext;
use crate::dispatch::{CommandBus, CommandBusRegistry, DispatchParams};
use crate::emitter::Attachment;
use crate::enricher::CausationMetadataEnricher;
use crate::error::WiringError;
use crate::observer::DispatchObserver;
use crate::store::{ActionEventEmitterEventStore, EventStore, StoreAction};

/// Causation tracking attached to a command bus and an event store.
///
/// Dropping the handle leaves both attached; call [`detach`](Self::detach)
/// to remove every listener.
pub struct CausationTracking {
    context: Arc<CausationContext>,
    observer: Attachment<DispatchParams>,
    enricher: Attachment<StoreAction>,
}

impl CausationTracking {
    pub fn builder() -> CausationTrackingBuilder {
        CausationTrackingBuilder::new()
    }

    /// Attach to `bus` and `store` directly, with a fresh context.
    pub fn attach<S: EventStore>(
        bus: &CommandBus,
        store: &ActionEventEmitterEventStore<S>,
    ) -> Self {
        Self::wire(Arc::new(CausationContext::new()), bus, store)
    }

    fn wire<S: EventStore>(
        context: Arc<CausationContext>,
        bus: &CommandBus,
        store: &ActionEventEmitterEventStore<S>,
    ) -> Self {
        let observer = DispatchObserver::new(context.clone()).attach(bus);
        let enricher = CausationMetadataEnricher::new(context.clone()).set_up(store);
        Self {
            context,
            observer,
            enricher,
        }
    }

    /// The context shared by the observer and the enricher.
    pub fn context(&self) -> &Arc<CausationContext> {
        &self.context
    }

    /// Remove the observer and enricher listeners.
    pub fn detach(self) {
        debug!(
            observer_listeners = self.observer.len(),
            enricher_listeners = self.enricher.len(),
            "detaching causation tracking"
        );
        self.observer.detach_all();
        self.enricher.detach_all();
    }
}

impl fmt::Debug for CausationTracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CausationTracking")
            .field("in_flight", &self.context.in_flight())
            .field("observer", &self.observer)
            .field("enricher", &self.enricher)
            .finish()
    }
}

/// Builder for [`CausationTracking`].
///
/// # Example
///
/// ```ignore
/// let tracking = CausationTracking::builder()
///     .config(CausationConfig::from_env()?)
///     .build(&buses, &store)?;
/// ```
#[derive(Debug, Default)]
pub struct CausationTrackingBuilder {
    config: CausationConfig,
    context: Option<Arc<CausationContext>>,
}

impl CausationTrackingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CausationConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing context instead of creating a new one.
    pub fn with_context(mut self, context: Arc<CausationContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Resolve the configured bus from `buses` and attach to it and `store`.
    ///
    /// # Errors
    ///
    /// [`WiringError::UnknownCommandBus`] if no bus is registered under the
    /// configured key. Nothing is attached in that case.
    pub fn build<S: EventStore>(
        self,
        buses: &CommandBusRegistry,
        store: &ActionEventEmitterEventStore<S>,
    ) -> Result<CausationTracking, WiringError> {
        let key = self.config.dispatcher_service_key;
        let bus = buses
            .get(&key)
            .ok_or_else(|| WiringError::UnknownCommandBus { key: key.clone() })?;

        let context = self.context.unwrap_or_default();
        info!(command_bus = %key, "causation tracking attached");
        Ok(CausationTracking::wire(context, bus, store))
    }
}
