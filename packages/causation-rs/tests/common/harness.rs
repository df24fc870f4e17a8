//! Test harness wiring a command bus, a decorated in-memory store and
//! causation tracking through the registry and configuration, the way an
//! application would.

use std::sync::Arc;

use causation::testing::record;
use causation::{
    handler_fn, ActionEventEmitterEventStore, CausationConfig, CausationTracking, Command,
    CommandBus, CommandBusRegistry, Event, EventStore, InMemoryEventStore, StreamName,
};

pub type TestStore = ActionEventEmitterEventStore<InMemoryEventStore>;

/// Initialize tracing once, respecting RUST_LOG.
/// Run tests with: RUST_LOG=causation=trace cargo test -- --nocapture
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestHarness {
    pub bus: CommandBus,
    pub store: Arc<TestStore>,
    pub tracking: CausationTracking,
}

impl TestHarness {
    pub fn new() -> Self {
        init_tracing();

        let bus = CommandBus::new();
        let store = Arc::new(ActionEventEmitterEventStore::new(InMemoryEventStore::new()));

        let mut buses = CommandBusRegistry::new();
        buses.register("test_bus", bus.clone());

        let tracking = CausationTracking::builder()
            .config(CausationConfig::new("test_bus"))
            .build(&buses, &*store)
            .expect("test_bus is registered");

        Self { bus, store, tracking }
    }

    /// Route `command_name` to a handler recording `make_events(cmd)` on `stream`.
    pub fn route_appending<F>(&self, command_name: &str, stream: &str, make_events: F)
    where
        F: Fn(&Command) -> Vec<Event> + Send + Sync + 'static,
    {
        let store = self.store.clone();
        let stream = StreamName::new(stream);
        let make_events = Arc::new(make_events);
        self.bus
            .route(
                command_name,
                handler_fn(move |cmd: Command| {
                    let (store, stream) = (store.clone(), stream.clone());
                    let make_events = make_events.clone();
                    async move {
                        record(&*store, &stream, make_events(&cmd))
                            .await
                            .map_err(anyhow::Error::from)
                    }
                }),
            )
            .expect("route is free");
    }

    pub async fn events(&self, stream: &str) -> Vec<Event> {
        self.store
            .load(&StreamName::new(stream), 0, None)
            .await
            .unwrap_or_default()
    }
}
