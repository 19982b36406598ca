//! Typed error taxonomy for the coordination substrate.

use thiserror::Error;

/// Errors surfaced by protocol operations.
///
/// Handlers recover locally and log; these variants are what caller-facing
/// APIs (`route_task`, `propose`, `execute_distributed`, `send`) return.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// `send` could not reach the target through any known path.
    #[error("no route to node '{target}'")]
    NoRoute { target: String },

    /// Consensus attempted below the minimum cluster size.
    #[error("insufficient nodes for consensus: {available} < {required}")]
    InsufficientNodes { available: usize, required: usize },

    /// A caller-facing wait passed its deadline.
    #[error("task timed out: {context}")]
    TaskTimeout { context: String },

    /// A task completed with an explicit failure.
    #[error("task failed: {reason}")]
    TaskFailed { reason: String },

    /// `start` called on a protocol that is already running.
    #[error("protocol is already running")]
    AlreadyRunning,

    /// Operation requires a running protocol.
    #[error("protocol is not running")]
    NotRunning,

    /// Registry lookup for a name that was never registered.
    #[error("unknown protocol '{name}'")]
    UnknownProtocol { name: String },

    /// The protocol stopped while the caller was waiting; distinguishable
    /// from a task-level failure.
    #[error("protocol shutting down")]
    ShuttingDown,

    /// Transport or bookkeeping failure that fits no other category.
    #[error("protocol error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn no_route(target: impl Into<String>) -> Self {
        Self::NoRoute {
            target: target.into(),
        }
    }

    pub fn timeout(context: impl Into<String>) -> Self {
        Self::TaskTimeout {
            context: context.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::TaskFailed {
            reason: reason.into(),
        }
    }
}
