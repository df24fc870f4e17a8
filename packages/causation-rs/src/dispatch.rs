//! Command bus: routes each command to one handler inside a dispatch cycle.
//!
//! # Lifecycle
//!
//! ```text
//! dispatch(cmd)
//!  → new DispatchId, enter its scope
//!  → "dispatch" listeners above PRIORITY_INVOKE_HANDLER
//!  → handler.handle(cmd)          (skipped if a listener stopped propagation)
//!  → "dispatch" listeners at or below PRIORITY_INVOKE_HANDLER
//!  → "finalize" listeners          (always, exactly once)
//! ```
//!
//! Handler errors and panics are captured into the [`DispatchOutcome`] so
//! that finalize runs before the error is returned to the caller. A cycle
//! dropped before it completes (a timeout, a losing `select!` branch, a
//! panicking listener) is finalized on drop with
//! [`DispatchOutcome::Cancelled`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::cycle::DispatchId;
use crate::emitter::{ActionEvent, ActionEventEmitter, Priority};
use crate::error::CommandBusError;
use crate::message::{Command, Message};

/// Fired when a command enters the bus.
pub const EVENT_DISPATCH: &str = "dispatch";

/// Fired once the cycle is over, whatever the outcome.
pub const EVENT_FINALIZE: &str = "finalize";

/// Where the handler runs in the "dispatch" chain.
pub const PRIORITY_INVOKE_HANDLER: Priority = Priority(0);

// =============================================================================
// Command Handler
// =============================================================================

/// Handles one kind of command.
///
/// Async closures can be routed through [`handler_fn`]:
///
/// ```ignore
/// bus.route("RegisterUser", handler_fn(move |cmd| {
///     let store = store.clone();
///     async move {
///         store.append_to(&"users".into(), vec![user_registered(&cmd)]).await?;
///         Ok(())
///     }
/// }))?;
/// ```
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, command: Command) -> anyhow::Result<()>;
}

/// A [`CommandHandler`] backed by an async closure.
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a [`CommandHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> CommandHandler for HandlerFn<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> anyhow::Result<()> {
        (self.0)(command).await
    }
}

// =============================================================================
// Dispatch Params
// =============================================================================

/// How a dispatch cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    NoHandler,
    Rejected,
    Failed { message: String },
    Panicked { message: String },
    /// The cycle was dropped before it completed.
    Cancelled,
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, DispatchOutcome::Handled)
    }
}

/// Payload of the bus's action events.
#[derive(Debug, Clone)]
pub struct DispatchParams {
    dispatch_id: DispatchId,
    command: Arc<Command>,
    outcome: Option<DispatchOutcome>,
}

impl DispatchParams {
    pub fn dispatch_id(&self) -> DispatchId {
        self.dispatch_id
    }

    pub fn command(&self) -> &Arc<Command> {
        &self.command
    }

    /// Set once the handler has run or was skipped; `None` during "dispatch".
    pub fn outcome(&self) -> Option<&DispatchOutcome> {
        self.outcome.as_ref()
    }
}

// =============================================================================
// Command Bus
// =============================================================================

type HandlerMap = HashMap<String, Arc<dyn CommandHandler>>;

struct Inner {
    handlers: RwLock<HandlerMap>,
    emitter: ActionEventEmitter<DispatchParams>,
}

/// Routes commands by name to their handler.
///
/// Cloning is cheap and clones share routes and listeners.
#[derive(Clone)]
pub struct CommandBus {
    inner: Arc<Inner>,
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: RwLock::new(HashMap::new()),
                emitter: ActionEventEmitter::new(),
            }),
        }
    }

    fn handlers(&self) -> RwLockReadGuard<'_, HandlerMap> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handlers_mut(&self) -> RwLockWriteGuard<'_, HandlerMap> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Route commands named `name` to `handler`.
    ///
    /// Fails if a handler is already routed for `name`; use
    /// [`route_replace`](Self::route_replace) to swap one out.
    pub fn route<H: CommandHandler>(
        &self,
        name: impl Into<String>,
        handler: H,
    ) -> Result<(), CommandBusError> {
        let name = name.into();
        let mut handlers = self.handlers_mut();
        if handlers.contains_key(&name) {
            return Err(CommandBusError::HandlerAlreadyRegistered { name });
        }
        handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Route commands named `name` to `handler`, replacing any existing route.
    pub fn route_replace<H: CommandHandler>(&self, name: impl Into<String>, handler: H) {
        self.handlers_mut().insert(name.into(), Arc::new(handler));
    }

    pub fn has_route(&self, name: &str) -> bool {
        self.handlers().contains_key(name)
    }

    /// Listener chains for "dispatch" and "finalize".
    pub fn action_event_emitter(&self) -> &ActionEventEmitter<DispatchParams> {
        &self.inner.emitter
    }

    /// Run one dispatch cycle for `command`.
    ///
    /// # Errors
    ///
    /// - [`CommandBusError::Rejected`] if a dispatch listener stopped propagation
    /// - [`CommandBusError::NoHandler`] if nothing is routed for the name
    /// - [`CommandBusError::HandlerFailed`] / [`CommandBusError::HandlerPanicked`]
    ///
    /// In every case the finalize listeners have run before this returns.
    pub async fn dispatch(&self, command: Command) -> Result<(), CommandBusError> {
        let dispatch_id = DispatchId::new();
        dispatch_id.scope(self.run_cycle(dispatch_id, command)).await
    }

    async fn run_cycle(
        &self,
        dispatch_id: DispatchId,
        command: Command,
    ) -> Result<(), CommandBusError> {
        let name = command.message_name().to_string();
        debug!(%dispatch_id, command = %name, uuid = %command.uuid(), "dispatching command");

        let emitter = &self.inner.emitter;
        let mut cycle = FinalizeGuard::new(
            emitter,
            ActionEvent::new(
                EVENT_DISPATCH,
                DispatchParams {
                    dispatch_id,
                    command: Arc::new(command),
                    outcome: None,
                },
            ),
        );

        emitter.emit_above(&mut cycle.action, PRIORITY_INVOKE_HANDLER);

        let result = if cycle.action.propagation_stopped() {
            debug!(%dispatch_id, command = %name, "dispatch rejected by listener");
            Err(CommandBusError::Rejected { name: name.clone() })
        } else {
            let command = cycle.action.params().command.as_ref().clone();
            let result = self.invoke_handler(&name, command).await;
            emitter.emit_at_or_below(&mut cycle.action, PRIORITY_INVOKE_HANDLER);
            result
        };

        cycle.finalize(outcome_of(&result));

        if let Err(e) = &result {
            error!(%dispatch_id, command = %name, error = %e, "dispatch failed");
        }
        result
    }

    async fn invoke_handler(&self, name: &str, command: Command) -> Result<(), CommandBusError> {
        let handler = self.handlers().get(name).cloned();
        let Some(handler) = handler else {
            return Err(CommandBusError::NoHandler { name: name.to_string() });
        };

        // AssertUnwindSafe is required because handler futures are not UnwindSafe
        match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(CommandBusError::HandlerFailed {
                name: name.to_string(),
                source,
            }),
            Err(panic_info) => Err(CommandBusError::HandlerPanicked {
                name: name.to_string(),
                message: extract_panic_message(&panic_info),
            }),
        }
    }
}

// =============================================================================
// Finalize Guard
// =============================================================================

/// Owns a cycle's action event and emits "finalize" for it exactly once.
///
/// Dropping the guard before [`finalize`](Self::finalize) emits it with
/// [`DispatchOutcome::Cancelled`], so a cancelled dispatch future still
/// reaches its finalize listeners.
struct FinalizeGuard<'a> {
    emitter: &'a ActionEventEmitter<DispatchParams>,
    action: ActionEvent<DispatchParams>,
    finalized: bool,
}

impl<'a> FinalizeGuard<'a> {
    fn new(
        emitter: &'a ActionEventEmitter<DispatchParams>,
        action: ActionEvent<DispatchParams>,
    ) -> Self {
        Self {
            emitter,
            action,
            finalized: false,
        }
    }

    fn finalize(&mut self, outcome: DispatchOutcome) {
        // Marked first: a panicking finalize listener must not re-enter from drop.
        if std::mem::replace(&mut self.finalized, true) {
            return;
        }
        self.action.params_mut().outcome = Some(outcome);
        self.action.set_name(EVENT_FINALIZE);
        self.emitter.emit(&mut self.action);
    }
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                dispatch_id = %self.action.params().dispatch_id,
                command = self.action.params().command.message_name(),
                "dispatch cycle dropped before completing, finalizing as cancelled"
            );
            self.finalize(DispatchOutcome::Cancelled);
        }
    }
}

fn outcome_of(result: &Result<(), CommandBusError>) -> DispatchOutcome {
    match result {
        Ok(()) => DispatchOutcome::Handled,
        Err(CommandBusError::NoHandler { .. }) => DispatchOutcome::NoHandler,
        Err(CommandBusError::Rejected { .. }) => DispatchOutcome::Rejected,
        Err(CommandBusError::HandlerPanicked { message, .. }) => DispatchOutcome::Panicked {
            message: message.clone(),
        },
        Err(e) => DispatchOutcome::Failed { message: e.to_string() },
    }
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBus")
            .field("route_count", &self.handlers().len())
            .field("emitter", &self.inner.emitter)
            .finish()
    }
}

// =============================================================================
// Command Bus Registry
// =============================================================================

/// Command buses by configuration key.
#[derive(Debug, Default, Clone)]
pub struct CommandBusRegistry {
    buses: HashMap<String, CommandBus>,
}

impl CommandBusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `bus` under `key`, returning any bus it replaced.
    pub fn register(&mut self, key: impl Into<String>, bus: CommandBus) -> Option<CommandBus> {
        self.buses.insert(key.into(), bus)
    }

    pub fn get(&self, key: &str) -> Option<&CommandBus> {
        self.buses.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn logging_bus() -> (CommandBus, Arc<Mutex<Vec<String>>>) {
        let bus = CommandBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        bus.action_event_emitter()
            .attach_listener(EVENT_DISPATCH, "before", Priority(1_000), move |_| {
                l.lock().unwrap().push("before".to_string())
            });
        let l = log.clone();
        bus.action_event_emitter()
            .attach_listener(EVENT_DISPATCH, "after", Priority(-1_000), move |_| {
                l.lock().unwrap().push("after".to_string())
            });
        let l = log.clone();
        bus.action_event_emitter()
            .attach_listener(EVENT_FINALIZE, "finalize", Priority(0), move |action| {
                let outcome = action.params().outcome().cloned();
                l.lock().unwrap().push(format!("finalize:{:?}", outcome));
            });

        (bus, log)
    }

    #[tokio::test]
    async fn test_listeners_wrap_the_handler() {
        let (bus, log) = logging_bus();
        let l = log.clone();
        bus.route("Ping", handler_fn(move |_cmd| {
            let l = l.clone();
            async move {
                l.lock().unwrap().push("handler".to_string());
                Ok(())
            }
        }))
        .unwrap();

        bus.dispatch(Command::new("Ping", json!({}))).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["before", "handler", "after", "finalize:Some(Handled)"]
        );
    }

    #[tokio::test]
    async fn test_handler_runs_inside_the_cycle_scope() {
        let bus = CommandBus::new();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        bus.route("Ping", handler_fn(move |_cmd| {
            let s = s.clone();
            async move {
                *s.lock().unwrap() = DispatchId::current();
                Ok(())
            }
        }))
        .unwrap();

        let announced = Arc::new(Mutex::new(None));
        let a = announced.clone();
        bus.action_event_emitter()
            .attach_listener(EVENT_DISPATCH, "capture", Priority::FIRST, move |action| {
                *a.lock().unwrap() = Some(action.params().dispatch_id());
            });

        bus.dispatch(Command::new("Ping", json!({}))).await.unwrap();

        assert!(seen.lock().unwrap().is_some());
        assert_eq!(*seen.lock().unwrap(), *announced.lock().unwrap());
        assert!(DispatchId::current().is_none());
    }

    #[tokio::test]
    async fn test_missing_handler_still_finalizes() {
        let (bus, log) = logging_bus();

        let err = bus.dispatch(Command::new("Nobody", json!({}))).await.unwrap_err();

        assert!(matches!(err, CommandBusError::NoHandler { ref name } if name == "Nobody"));
        assert_eq!(
            log.lock().unwrap().last().unwrap(),
            "finalize:Some(NoHandler)"
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_returned_after_finalize() {
        let (bus, log) = logging_bus();
        bus.route("Fail", handler_fn(|_cmd| async { Err(anyhow::anyhow!("boom")) }))
            .unwrap();

        let err = bus.dispatch(Command::new("Fail", json!({}))).await.unwrap_err();

        assert!(matches!(err, CommandBusError::HandlerFailed { .. }));
        assert!(log.lock().unwrap().last().unwrap().starts_with("finalize:Some(Failed"));
    }

    #[tokio::test]
    async fn test_handler_panic_is_caught_and_finalizes() {
        let (bus, log) = logging_bus();
        bus.route(
            "Panic",
            handler_fn(|_cmd| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(())
            }),
        )
        .unwrap();

        let err = bus.dispatch(Command::new("Panic", json!({}))).await.unwrap_err();

        match err {
            CommandBusError::HandlerPanicked { message, .. } => {
                assert_eq!(message, "handler exploded")
            }
            other => panic!("expected HandlerPanicked, got {other:?}"),
        }
        assert!(log.lock().unwrap().last().unwrap().starts_with("finalize:Some(Panicked"));
    }

    #[tokio::test]
    async fn test_dropped_dispatch_still_finalizes() {
        let (bus, log) = logging_bus();
        bus.route(
            "Slow",
            handler_fn(|_cmd| async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .unwrap();

        for _ in 0..3 {
            let timed_out = tokio::time::timeout(
                std::time::Duration::from_millis(10),
                bus.dispatch(Command::new("Slow", json!({}))),
            )
            .await;
            assert!(timed_out.is_err());
        }

        let log = log.lock().unwrap();
        let finalized: Vec<_> = log.iter().filter(|l| l.starts_with("finalize")).collect();
        assert_eq!(finalized, vec!["finalize:Some(Cancelled)"; 3]);
        assert!(!log.contains(&"after".to_string()));
    }

    #[tokio::test]
    async fn test_stop_propagation_rejects_dispatch() {
        let (bus, log) = logging_bus();
        bus.action_event_emitter()
            .attach_listener(EVENT_DISPATCH, "guard", Priority(500), |action| {
                action.stop_propagation()
            });
        bus.route("Ping", handler_fn(|_cmd| async { Ok(()) })).unwrap();

        let err = bus.dispatch(Command::new("Ping", json!({}))).await.unwrap_err();

        assert!(matches!(err, CommandBusError::Rejected { .. }));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before", "finalize:Some(Rejected)"]
        );
    }

    #[test]
    fn test_duplicate_route_is_an_error() {
        let bus = CommandBus::new();
        bus.route("Ping", handler_fn(|_cmd| async { Ok(()) })).unwrap();

        let err = bus.route("Ping", handler_fn(|_cmd| async { Ok(()) })).unwrap_err();
        assert!(matches!(err, CommandBusError::HandlerAlreadyRegistered { .. }));

        bus.route_replace("Ping", handler_fn(|_cmd| async { Ok(()) }));
        assert!(bus.has_route("Ping"));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = CommandBusRegistry::new();
        assert!(registry.register("command_bus", CommandBus::new()).is_none());
        assert!(registry.get("command_bus").is_some());
        assert!(registry.get("other").is_none());
    }
}
