//! Dispatch cycle identity.
//!
//! A dispatch cycle runs from the moment a command is handed to the bus until
//! its finalize listeners have run. Each cycle gets a [`DispatchId`], and the
//! bus drives the whole cycle inside a task-local scope carrying that id.
//! Code running inside the cycle (handlers, event store hooks) can ask
//! [`DispatchId::current`] which cycle it belongs to, so concurrent cycles
//! never read each other's state.
//!
//! Task-locals do not follow `tokio::spawn`. Wrap spawned work in
//! [`propagate`] to keep it attributed to the spawning cycle.

use std::fmt;
use std::future::Future;

use uuid::Uuid;

tokio::task_local! {
    static CURRENT_DISPATCH: DispatchId;
}

/// Identifier of one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchId(Uuid);

impl DispatchId {
    /// Create a new random dispatch id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The cycle the caller is running in, if any.
    pub fn current() -> Option<Self> {
        CURRENT_DISPATCH.try_with(|id| *id).ok()
    }

    /// Run `fut` as part of this cycle.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_DISPATCH.scope(self, fut).await
    }

    /// Run `f` synchronously as part of this cycle.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT_DISPATCH.sync_scope(self, f)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DispatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for DispatchId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for DispatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute `fut` to the caller's dispatch cycle, wherever it is polled.
///
/// The cycle is captured when `propagate` is called, not on first poll, so
/// the returned future can be handed to `tokio::spawn`.
///
/// ```ignore
/// tokio::spawn(causation::propagate(async move {
///     store.append_to(&stream, events).await
/// }));
/// ```
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let current = DispatchId::current();
    async move {
        match current {
            Some(id) => id.scope(fut).await,
            None => fut.await,
        }
    }
}
