//! Structured error types for the command bus, event store and wiring.
//!
//! Causation tracking itself never fails: stamping is best-effort and a
//! missing cause simply means no metadata. The errors here belong to the
//! collaborators the tracker plugs into.
//!
//! # Example
//!
//! ```ignore
//! use causation::CommandBusError;
//!
//! match bus.dispatch(cmd).await {
//!     Ok(()) => {}
//!     Err(CommandBusError::NoHandler { name }) => eprintln!("nobody handles {name}"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use thiserror::Error;

use crate::store::StreamName;

// =============================================================================
// Command Bus Error
// =============================================================================

/// Failure of a dispatch cycle.
///
/// Every variant is returned only after the finalize listeners have run.
#[derive(Debug, Error)]
pub enum CommandBusError {
    /// No handler is routed for the command name.
    #[error("no handler routed for command {name}")]
    NoHandler { name: String },

    /// A handler is already routed for the command name.
    #[error("handler already registered for command {name}")]
    HandlerAlreadyRegistered { name: String },

    /// A dispatch listener stopped propagation before the handler ran.
    #[error("dispatch of command {name} was rejected before reaching its handler")]
    Rejected { name: String },

    /// The handler returned an error.
    #[error("handler for command {name} failed: {source}")]
    HandlerFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The handler panicked.
    #[error("handler for command {name} panicked: {message}")]
    HandlerPanicked { name: String, message: String },
}

impl CommandBusError {
    /// The command name this error concerns.
    pub fn command_name(&self) -> &str {
        match self {
            CommandBusError::NoHandler { name }
            | CommandBusError::HandlerAlreadyRegistered { name }
            | CommandBusError::Rejected { name }
            | CommandBusError::HandlerFailed { name, .. }
            | CommandBusError::HandlerPanicked { name, .. } => name,
        }
    }
}

// =============================================================================
// Event Store Error
// =============================================================================

/// Failure of an event store write or read.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("stream {0} already exists")]
    StreamExistsAlready(StreamName),

    #[error("stream {0} not found")]
    StreamNotFound(StreamName),

    /// A pre-persist listener turned the write into a different kind of
    /// write. Nothing was stored.
    #[error("a {action} listener replaced the payload kind for stream {stream}")]
    PayloadReplaced {
        action: &'static str,
        stream: StreamName,
    },
}

// =============================================================================
// Wiring Error
// =============================================================================

/// Failure to assemble causation tracking from configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WiringError {
    /// The configured command bus key is not registered.
    #[error("no command bus registered under key {key}")]
    UnknownCommandBus { key: String },
}
