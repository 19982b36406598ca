//! Shared engine embedded by every concrete protocol.
//!
//! `ProtocolCore` owns the node directory, the handler table, and the
//! dispatch machinery. Concrete protocols layer their own state, handlers,
//! and background loops on top of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ProtocolError;
use crate::message::{MessageType, ProtocolMessage};
use crate::node::{NetworkStatus, NodeRecord, NodeStatus};
use crate::transport::MessageBus;

/// Future returned by a message handler. The return value is logged, never
/// propagated into the dispatch loop.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A registered message handler.
pub type HandlerFn = Arc<dyn Fn(ProtocolMessage) -> HandlerFuture + Send + Sync>;

/// Default hop budget stamped on broadcasts.
pub const DEFAULT_BROADCAST_TTL: i64 = 3;

/// Node directory, handler table, and dispatch machinery shared by the
/// concrete protocols.
pub struct ProtocolCore {
    node_id: String,
    protocol_name: &'static str,
    bus: Arc<MessageBus>,
    nodes: DashMap<String, NodeRecord>,
    handlers: RwLock<HashMap<MessageType, HandlerFn>>,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl ProtocolCore {
    /// Create a core with the self node registered active and the default
    /// heartbeat/discovery/status handlers in place.
    pub fn new(
        node_id: impl Into<String>,
        protocol_name: &'static str,
        bus: Arc<MessageBus>,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let core = Arc::new(Self {
            node_id: node_id.clone(),
            protocol_name,
            bus,
            nodes: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
        });
        core.nodes
            .insert(node_id.clone(), NodeRecord::new(node_id, NodeStatus::Active));
        Self::register_default_handlers(&core);
        core
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol_name
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// The node directory. Handler dispatch is single-threaded per
    /// instance, so handlers may mutate entries without extra locking.
    pub fn nodes(&self) -> &DashMap<String, NodeRecord> {
        &self.nodes
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Transition constructed/stopped → running.
    ///
    /// Attaches the instance to the transport and hands back the inbound
    /// queue plus a fresh cancellation token for the background tasks.
    pub fn begin_start(
        &self,
    ) -> Result<(mpsc::UnboundedReceiver<ProtocolMessage>, CancellationToken), ProtocolError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyRunning);
        }
        let receiver = self.bus.attach(&self.node_id);
        self.set_status(&self.node_id, NodeStatus::Active);
        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());
        Ok((receiver, token))
    }

    /// Transition running → stopped. Idempotent; returns `false` when the
    /// protocol was not running. Broadcasts an offline status best-effort
    /// before detaching from the transport.
    pub fn begin_stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        let mut offline = ProtocolMessage::new(MessageType::Status, &self.node_id)
            .with_field("status", json!(NodeStatus::Offline.as_str()));
        offline.mark_seen(&self.node_id);
        self.bus.fanout(&offline);

        self.bus.detach(&self.node_id);
        self.set_status(&self.node_id, NodeStatus::Offline);
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        true
    }

    /// Replace the handler for a message type.
    pub fn register_handler(&self, kind: MessageType, handler: HandlerFn) {
        self.handlers.write().insert(kind, handler);
    }

    /// Run the handler registered for a message, containing errors and
    /// panics so the dispatch loop survives misbehaving handlers.
    pub async fn dispatch(&self, message: ProtocolMessage) {
        let kind = message.kind;
        let sender = message.sender.clone();
        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            warn!(
                event = "unhandled_message",
                protocol = self.protocol_name,
                node = %self.node_id,
                message_type = %kind,
                "no handler for message type"
            );
            return;
        };

        let outcome = std::panic::AssertUnwindSafe(handler(message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    event = "handler_error",
                    protocol = self.protocol_name,
                    node = %self.node_id,
                    peer = %sender,
                    message_type = %kind,
                    error = %err,
                    "message handler failed"
                );
            }
            Err(_) => {
                error!(
                    event = "handler_panic",
                    protocol = self.protocol_name,
                    node = %self.node_id,
                    peer = %sender,
                    message_type = %kind,
                    "message handler panicked"
                );
            }
        }
    }

    /// Spawn the standard dispatch loop: one message at a time until the
    /// token cancels.
    pub fn spawn_dispatch_loop(
        core: Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<ProtocolMessage>,
        token: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = receiver.recv() => {
                        match message {
                            Some(message) => core.dispatch(message).await,
                            None => break,
                        }
                    }
                }
            }
            debug!(
                event = "dispatch_stopped",
                protocol = core.protocol_name,
                node = %core.node_id,
                "dispatch loop exited"
            );
        });
    }

    /// Deliver a targeted message straight over the transport.
    pub fn send_direct(
        &self,
        target: &str,
        message: ProtocolMessage,
    ) -> Result<(), ProtocolError> {
        self.bus.deliver(target, message)
    }

    /// Stamp broadcast metadata (ttl, self on the seen-list) and fan the
    /// message out to every transport endpoint.
    pub fn broadcast_all(&self, mut message: ProtocolMessage) -> usize {
        if message.ttl().is_none() {
            message.set_ttl(DEFAULT_BROADCAST_TTL);
        }
        message.mark_seen(&self.node_id);
        self.bus.fanout(&message)
    }

    /// Heartbeat message advertising self status and capabilities.
    pub fn heartbeat_message(&self) -> ProtocolMessage {
        let me = self.self_record();
        ProtocolMessage::new(MessageType::Heartbeat, &self.node_id)
            .with_field("status", json!(me.status.as_str()))
            .with_field("capabilities", json!(me.capabilities))
    }

    /// Discovery request advertising self capabilities.
    pub fn discovery_request(&self) -> ProtocolMessage {
        let me = self.self_record();
        ProtocolMessage::new(MessageType::Discovery, &self.node_id)
            .with_field("capabilities", json!(me.capabilities))
            .with_field("status", json!(me.status.as_str()))
    }

    fn self_record(&self) -> NodeRecord {
        self.nodes
            .get(&self.node_id)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| NodeRecord::new(&self.node_id, NodeStatus::Active))
    }

    /// Idempotent capability insert on the self node.
    pub fn register_capability(&self, capability: &str) {
        if let Some(mut me) = self.nodes.get_mut(&self.node_id) {
            me.add_capability(capability);
        }
    }

    pub fn unregister_capability(&self, capability: &str) {
        if let Some(mut me) = self.nodes.get_mut(&self.node_id) {
            me.remove_capability(capability);
        }
    }

    pub fn update_status(&self, status: NodeStatus) {
        self.set_status(&self.node_id, status);
    }

    pub fn set_status(&self, node_id: &str, status: NodeStatus) {
        if let Some(mut record) = self.nodes.get_mut(node_id) {
            record.status = status;
        }
    }

    pub fn node(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.get(node_id).map(|entry| entry.clone())
    }

    /// Active peers, excluding self.
    pub fn active_nodes(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().is_active() && entry.key() != &self.node_id)
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    /// Active nodes (self included) carrying a capability.
    pub fn nodes_with_capability(&self, capability: &str) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .nodes
            .iter()
            .filter(|entry| entry.value().is_active() && entry.value().has_capability(capability))
            .map(|entry| entry.key().clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn network_status(&self) -> NetworkStatus {
        let mut capabilities: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|entry| entry.value().capabilities.clone())
            .collect();
        capabilities.sort();
        capabilities.dedup();

        NetworkStatus {
            node_id: self.node_id.clone(),
            total_nodes: self.nodes.len(),
            active_nodes: self.active_nodes().len() + 1,
            capabilities,
            status: self.self_record().status,
        }
    }

    fn register_default_handlers(core: &Arc<Self>) {
        let weak = Arc::downgrade(core);
        core.register_handler(MessageType::Heartbeat, heartbeat_handler(weak.clone()));
        core.register_handler(MessageType::Discovery, discovery_handler(weak.clone()));
        core.register_handler(MessageType::Status, status_handler(weak));
    }

    /// Default heartbeat behavior, shared with protocol overrides: refresh
    /// or create the peer record, ignoring stale timestamps.
    pub fn apply_heartbeat(&self, message: &ProtocolMessage) {
        let peer = &message.sender;
        if peer == &self.node_id {
            return;
        }
        let status = message
            .content_str("status")
            .map(NodeStatus::parse_or_active)
            .unwrap_or(NodeStatus::Active);
        let capabilities: Vec<String> = message
            .content
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        match self.nodes.get_mut(peer) {
            Some(mut record) => {
                // Heartbeat timestamps are monotonic per peer.
                if message.timestamp <= record.last_heartbeat {
                    return;
                }
                record.last_heartbeat = message.timestamp;
                record.status = status;
                for cap in &capabilities {
                    record.add_capability(cap);
                }
            }
            None => {
                let mut record = NodeRecord::new(peer.clone(), status);
                record.last_heartbeat = message.timestamp;
                record.capabilities = capabilities;
                self.nodes.insert(peer.clone(), record);
                debug!(
                    event = "peer_discovered",
                    protocol = self.protocol_name,
                    node = %self.node_id,
                    peer = %peer,
                    "peer learned from heartbeat"
                );
            }
        }
    }

    /// Default discovery behavior: learn the asker, then answer with self
    /// capabilities and status, targeted back.
    pub fn apply_discovery(&self, message: &ProtocolMessage) {
        if message.sender == self.node_id {
            return;
        }
        self.apply_heartbeat(message);

        let me = self.self_record();
        let reply = ProtocolMessage::new(MessageType::Discovery, &self.node_id)
            .with_target(&message.sender)
            .with_field("capabilities", json!(me.capabilities))
            .with_field("status", json!(me.status.as_str()))
            .with_field("reply", json!(true));
        if let Err(err) = self.send_direct(&message.sender, reply) {
            debug!(
                event = "discovery_reply_failed",
                protocol = self.protocol_name,
                node = %self.node_id,
                peer = %message.sender,
                error = %err,
                "discovery reply undeliverable"
            );
        }
    }

    /// Default status behavior: update the sender's recorded status.
    pub fn apply_status(&self, message: &ProtocolMessage) {
        if let Some(status) = message.content_str("status") {
            self.set_status(&message.sender, NodeStatus::parse_or_active(status));
        }
    }
}

fn heartbeat_handler(core: Weak<ProtocolCore>) -> HandlerFn {
    Arc::new(move |message| {
        let core = core.clone();
        async move {
            if let Some(core) = core.upgrade() {
                core.apply_heartbeat(&message);
            }
            Ok(())
        }
        .boxed()
    })
}

fn discovery_handler(core: Weak<ProtocolCore>) -> HandlerFn {
    Arc::new(move |message| {
        let core = core.clone();
        async move {
            if let Some(core) = core.upgrade() {
                // Replies are targeted; only answer requests.
                if message.content.get("reply").is_none() {
                    core.apply_discovery(&message);
                } else {
                    core.apply_heartbeat(&message);
                }
            }
            Ok(())
        }
        .boxed()
    })
}

fn status_handler(core: Weak<ProtocolCore>) -> HandlerFn {
    Arc::new(move |message| {
        let core = core.clone();
        async move {
            if let Some(core) = core.upgrade() {
                core.apply_status(&message);
            }
            Ok(())
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn core() -> Arc<ProtocolCore> {
        ProtocolCore::new("n1", "test", MessageBus::new())
    }

    #[test]
    fn self_node_is_active_on_construction() {
        let core = core();
        let me = core.node("n1").unwrap();
        assert!(me.is_active());
        assert_eq!(core.network_status().active_nodes, 1);
    }

    #[test]
    fn start_twice_fails_then_restart_succeeds() {
        let core = core();
        let _handles = core.begin_start().unwrap();
        assert!(matches!(
            core.begin_start().unwrap_err(),
            ProtocolError::AlreadyRunning
        ));
        assert!(core.begin_stop());
        assert!(!core.begin_stop());
        assert!(core.begin_start().is_ok());
        assert_eq!(core.node("n1").unwrap().status, NodeStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_creates_and_refreshes_peer() {
        let core = core();
        let mut beat = ProtocolMessage::new(MessageType::Heartbeat, "n2")
            .with_field("status", json!("busy"))
            .with_field("capabilities", json!(["analysis"]));
        core.dispatch(beat.clone()).await;

        let peer = core.node("n2").unwrap();
        assert_eq!(peer.status, NodeStatus::Busy);
        assert!(peer.has_capability("analysis"));

        // A stale heartbeat must be ignored.
        beat.timestamp = beat.timestamp - Duration::seconds(30);
        beat.content
            .insert("status".into(), json!("idle"));
        core.dispatch(beat).await;
        assert_eq!(core.node("n2").unwrap().status, NodeStatus::Busy);
    }

    #[tokio::test]
    async fn discovery_request_gets_targeted_reply() {
        let bus = MessageBus::new();
        let core = ProtocolCore::new("n1", "test", bus.clone());
        core.register_capability("compute");
        let mut asker_rx = bus.attach("n2");

        let request = ProtocolMessage::new(MessageType::Discovery, "n2");
        core.dispatch(request).await;

        let reply = asker_rx.recv().await.unwrap();
        assert_eq!(reply.kind, MessageType::Discovery);
        assert_eq!(reply.target.as_deref(), Some("n2"));
        assert_eq!(reply.content["capabilities"], json!(["compute"]));
    }

    fn failing_handler(_msg: ProtocolMessage) -> HandlerFuture {
        async { Err(anyhow::anyhow!("boom")) }.boxed()
    }

    fn panicking_handler(_msg: ProtocolMessage) -> HandlerFuture {
        async { panic!("handler exploded") }.boxed()
    }

    #[tokio::test]
    async fn dispatch_survives_erroring_and_panicking_handlers() {
        let core = core();
        core.register_handler(MessageType::Task, Arc::new(failing_handler));
        core.register_handler(MessageType::Result, Arc::new(panicking_handler));

        core.dispatch(ProtocolMessage::new(MessageType::Task, "n2")).await;
        core.dispatch(ProtocolMessage::new(MessageType::Result, "n2")).await;

        // Still able to handle a well-behaved message afterwards.
        core.dispatch(
            ProtocolMessage::new(MessageType::Heartbeat, "n3").with_field("status", json!("active")),
        )
        .await;
        assert!(core.node("n3").is_some());
    }

    #[test]
    fn capability_round_trip_is_idempotent() {
        let core = core();
        core.register_capability("search");
        core.register_capability("search");
        assert_eq!(core.node("n1").unwrap().capabilities, vec!["search"]);
        core.unregister_capability("search");
        core.unregister_capability("search");
        assert!(core.node("n1").unwrap().capabilities.is_empty());
    }

    #[test]
    fn stop_broadcasts_offline_status() {
        let bus = MessageBus::new();
        let core = ProtocolCore::new("n1", "test", bus.clone());
        let mut peer_rx = bus.attach("n2");
        let _handles = core.begin_start().unwrap();

        assert!(core.begin_stop());
        let notice = peer_rx.try_recv().unwrap();
        assert_eq!(notice.kind, MessageType::Status);
        assert_eq!(notice.content_str("status"), Some("offline"));
        assert!(!bus.is_attached("n1"));
    }
}
