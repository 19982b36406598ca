//! # Swarmlink Protocol Substrate
//!
//! Shared foundation for the coordination protocols: the message envelope
//! and node model, the `Protocol` contract every coordination strategy
//! implements, the in-process transport, and the typed error taxonomy.
//!
//! ## Architecture Overview
//!
//! Every coordination strategy (task router, consensus, mesh) is a
//! `Protocol`: a node with an id, a directory of peers, a handler table
//! keyed by message type, and a single-threaded dispatch loop draining the
//! node's inbound queue. Three default handlers are always present:
//!
//! - **heartbeat** — refreshes the peer's record (monotonic timestamps) or
//!   creates it when the peer is unknown;
//! - **discovery** — answers with self capabilities and status, targeted
//!   back at the asker;
//! - **status** — updates the sender's recorded status.
//!
//! Handler failures are contained: an error or panic inside a handler is
//! logged and never reaches the dispatch loop.
//!
//! ## Lifecycle
//!
//! constructed → running (`start`) → stopped (`stop`). `start` on a running
//! protocol fails with `AlreadyRunning`; `stop` is idempotent, releases all
//! pending waiters with a shutdown error, and broadcasts an offline status
//! best-effort. A stopped protocol can be started again and behaves like a
//! fresh one.

pub mod core;
pub mod error;
pub mod executor;
pub mod message;
pub mod node;
pub mod transport;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

pub use crate::core::{HandlerFn, HandlerFuture, ProtocolCore, DEFAULT_BROADCAST_TTL};
pub use crate::error::ProtocolError;
pub use crate::executor::{EchoExecutor, TaskExecutor};
pub use crate::message::{MessageType, ProtocolMessage, META_ROUTE, META_SEEN, META_TTL};
pub use crate::node::{NetworkStatus, NodeRecord, NodeStatus};
pub use crate::transport::MessageBus;

/// Contract every coordination protocol implements.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Unique id of this protocol's self node.
    fn node_id(&self) -> &str;

    /// Registry-facing protocol name (e.g. `task_router`).
    fn protocol_name(&self) -> &'static str;

    /// Start background tasks and mark self active.
    ///
    /// Fails with `AlreadyRunning` when called twice without an intervening
    /// `stop`.
    async fn start(&self) -> Result<(), ProtocolError>;

    /// Cancel background tasks, release pending waiters with a shutdown
    /// error, and broadcast an offline status best-effort. Idempotent.
    async fn stop(&self) -> Result<(), ProtocolError>;

    /// Route a message to a specific target. Fails with `NoRoute` when the
    /// target cannot be reached.
    async fn send(&self, message: ProtocolMessage) -> Result<(), ProtocolError>;

    /// Distribute a message to all known peers, stamping ttl and seen-list.
    async fn broadcast(&self, message: ProtocolMessage) -> Result<(), ProtocolError>;

    /// Replace the handler for a message type.
    fn register_handler(&self, kind: MessageType, handler: HandlerFn);

    /// Idempotent capability edits on the self node.
    fn register_capability(&self, capability: &str);
    fn unregister_capability(&self, capability: &str);

    /// Mutate self status.
    fn update_status(&self, status: NodeStatus);

    /// Active peers, excluding self.
    fn active_nodes(&self) -> Vec<String>;

    /// Active nodes (self included) carrying a capability.
    fn nodes_with_capability(&self, capability: &str) -> Vec<String>;

    /// Point-in-time network summary.
    fn network_status(&self) -> NetworkStatus;

    /// Downcast hook so callers holding `Arc<dyn Protocol>` can reach
    /// protocol-specific operations.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl std::fmt::Debug for dyn Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("protocol_name", &self.protocol_name())
            .field("node_id", &self.node_id())
            .finish()
    }
}
