//! Action events: named extension points with ordered listener chains.
//!
//! Both collaborators expose their lifecycle through an
//! [`ActionEventEmitter`]. A listener is registered for an event name with a
//! [`Priority`] and a stage label:
//!
//! ```text
//! "appendTo"
//!  → validate           (10_000)
//!  → enrich-metadata    ( 1_000)
//!  → causation-metadata (   100)
//!  → -- persist --      (     0)   ← owned by the store, not a listener
//!  → post-commit        (  <= 0)
//! ```
//!
//! Higher priority runs earlier. Equal priorities run in registration order.
//! The owner of the emitter decides where its own work sits in the chain by
//! splitting emission with [`ActionEventEmitter::emit_above`] and
//! [`ActionEventEmitter::emit_at_or_below`].
//!
//! Listeners are synchronous and receive the payload mutably, so they can
//! replace what the owner acts on next.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use smallvec::SmallVec;
use tracing::trace;

// =============================================================================
// Priority
// =============================================================================

/// Position of a listener in an event's chain. Higher runs earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Priority(pub i32);

impl Priority {
    /// Runs before every other listener.
    pub const FIRST: Priority = Priority(i32::MAX);

    /// Runs after every other listener.
    pub const LAST: Priority = Priority(i32::MIN);

    /// Offset this priority, saturating at the bounds.
    pub const fn offset(self, by: i32) -> Priority {
        Priority(self.0.saturating_add(by))
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Action Event
// =============================================================================

/// The payload handed down a listener chain.
#[derive(Debug)]
pub struct ActionEvent<P> {
    name: &'static str,
    params: P,
    propagation_stopped: bool,
}

impl<P> ActionEvent<P> {
    /// Create an action event.
    pub fn new(name: &'static str, params: P) -> Self {
        Self {
            name,
            params,
            propagation_stopped: false,
        }
    }

    /// The event name listeners are registered under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Rename the event, e.g. moving from "dispatch" to "finalize".
    ///
    /// Clears any earlier stop so the next chain runs in full.
    pub fn set_name(&mut self, name: &'static str) {
        self.name = name;
        self.propagation_stopped = false;
    }

    pub fn params(&self) -> &P {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut P {
        &mut self.params
    }

    pub fn into_params(self) -> P {
        self.params
    }

    /// Skip the remaining listeners of the current chain.
    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }
}

// =============================================================================
// Listener Registry
// =============================================================================

type Listener<P> = Arc<dyn Fn(&mut ActionEvent<P>) + Send + Sync>;

/// Returned by [`ActionEventEmitter::attach_listener`], used to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    id: u64,
    event_name: &'static str,
}

struct Registered<P> {
    id: u64,
    event_name: &'static str,
    stage: &'static str,
    priority: Priority,
    listener: Listener<P>,
}

impl<P> Clone for Registered<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            event_name: self.event_name,
            stage: self.stage,
            priority: self.priority,
            listener: self.listener.clone(),
        }
    }
}

struct Inner<P> {
    next_id: AtomicU64,
    // Kept sorted: priority descending, then registration order.
    listeners: RwLock<Vec<Registered<P>>>,
}

/// Shared listener chains keyed by event name.
///
/// Cloning is cheap and clones share the same listeners.
pub struct ActionEventEmitter<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for ActionEventEmitter<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P> Default for ActionEventEmitter<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ActionEventEmitter<P> {
    /// Create an emitter with no listeners.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    // Writers never leave the list half-updated, so a poisoned lock is safe to reuse.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Registered<P>>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Registered<P>>> {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `listener` for `event_name`.
    ///
    /// `stage` names what the listener does in the chain; it shows up in
    /// [`stages`](Self::stages) and in trace logs.
    pub fn attach_listener<F>(
        &self,
        event_name: &'static str,
        stage: &'static str,
        priority: Priority,
        listener: F,
    ) -> ListenerHandle
    where
        F: Fn(&mut ActionEvent<P>) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.write();

        // Insert after every listener with priority >= ours, keeping
        // registration order among equals.
        let at = listeners
            .iter()
            .position(|l| l.priority < priority)
            .unwrap_or(listeners.len());
        listeners.insert(
            at,
            Registered {
                id,
                event_name,
                stage,
                priority,
                listener: Arc::new(listener),
            },
        );

        trace!(action = event_name, stage, %priority, "listener attached");
        ListenerHandle { id, event_name }
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn detach_listener(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != handle.id);
        let removed = listeners.len() != before;
        if removed {
            trace!(action = handle.event_name, "listener detached");
        }
        removed
    }

    /// Run the whole chain for the event's current name.
    pub fn emit(&self, event: &mut ActionEvent<P>) {
        self.emit_filtered(event, |_| true);
    }

    /// Run only listeners with priority strictly above `threshold`.
    pub fn emit_above(&self, event: &mut ActionEvent<P>, threshold: Priority) {
        self.emit_filtered(event, |p| p > threshold);
    }

    /// Run only listeners with priority at or below `threshold`.
    pub fn emit_at_or_below(&self, event: &mut ActionEvent<P>, threshold: Priority) {
        self.emit_filtered(event, |p| p <= threshold);
    }

    fn emit_filtered(&self, event: &mut ActionEvent<P>, include: impl Fn(Priority) -> bool) {
        // Snapshot so listeners may attach/detach while the chain runs.
        let chain: Vec<Registered<P>> = self
            .read()
            .iter()
            .filter(|l| l.event_name == event.name() && include(l.priority))
            .cloned()
            .collect();

        for registered in chain {
            if event.propagation_stopped() {
                trace!(action = event.name(), stage = registered.stage, "propagation stopped");
                break;
            }
            (registered.listener)(event);
        }
    }

    /// Number of listeners registered for `event_name`.
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.read()
            .iter()
            .filter(|l| l.event_name == event_name)
            .count()
    }

    /// Stage labels for `event_name`, in invocation order.
    pub fn stages(&self, event_name: &str) -> Vec<(&'static str, Priority)> {
        self.read()
            .iter()
            .filter(|l| l.event_name == event_name)
            .map(|l| (l.stage, l.priority))
            .collect()
    }
}

impl<P> fmt::Debug for ActionEventEmitter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionEventEmitter")
            .field("listener_count", &self.read().len())
            .finish()
    }
}

// =============================================================================
// Attachment
// =============================================================================

/// A group of listeners attached together and detached together.
///
/// Dropping an `Attachment` leaves its listeners registered; call
/// [`detach_all`](Self::detach_all) to remove them.
pub struct Attachment<P> {
    emitter: ActionEventEmitter<P>,
    handles: SmallVec<[ListenerHandle; 2]>,
    on_detach: Vec<Box<dyn FnOnce() + Send + Sync>>,
}

impl<P> Attachment<P> {
    pub(crate) fn new(emitter: ActionEventEmitter<P>) -> Self {
        Self {
            emitter,
            handles: SmallVec::new(),
            on_detach: Vec::new(),
        }
    }

    pub(crate) fn track(&mut self, handle: ListenerHandle) {
        self.handles.push(handle);
    }

    /// Run `cleanup` once the listeners are gone, for state they would
    /// otherwise have released themselves.
    pub(crate) fn on_detach(&mut self, cleanup: impl FnOnce() + Send + Sync + 'static) {
        self.on_detach.push(Box::new(cleanup));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Detach every tracked listener, then run the detach hooks.
    pub fn detach_all(self) {
        for handle in self.handles {
            self.emitter.detach_listener(handle);
        }
        for cleanup in self.on_detach {
            cleanup();
        }
    }
}

impl<P> fmt::Debug for Attachment<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("handles", &self.handles)
            .field("on_detach", &self.on_detach.len())
            .finish()
    }
}
