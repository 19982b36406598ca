//! In-process bridge between coordination protocols.
//!
//! Agents on the task router, the consensus cluster, and the mesh can talk
//! to each other without sharing a protocol: adapters capture traffic from
//! each protocol, and a routing loop fans captured messages to the
//! adapters selected by per-message-type rules, applying pairwise
//! transforms on the way. Messages are never routed back to their source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use swarmlink_mesh::MeshNetwork;
use swarmlink_protocol::{MessageType, Protocol, ProtocolError, ProtocolMessage};

/// One protocol's feet on the bridge.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Push a bridged message into the protocol.
    async fn send(&self, message: ProtocolMessage) -> Result<(), ProtocolError>;

    /// Pull the next captured message, if any is waiting.
    async fn receive(&self) -> Option<ProtocolMessage>;

    fn protocol_name(&self) -> &str;
}

/// Rewrites a message when it crosses from one protocol to another.
pub type TransformFn = Arc<dyn Fn(ProtocolMessage) -> ProtocolMessage + Send + Sync>;

#[derive(Default)]
struct BridgeCounters {
    messages_routed: AtomicU64,
    messages_transformed: AtomicU64,
    routing_errors: AtomicU64,
}

/// Bridge status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub protocols: Vec<String>,
    pub routing_rules: Vec<(String, Vec<String>)>,
    pub transform_rules: Vec<String>,
    pub messages_routed: u64,
    pub messages_transformed: u64,
    pub routing_errors: u64,
}

#[derive(Default)]
struct BridgeInner {
    adapters: RwLock<HashMap<String, Arc<dyn ProtocolAdapter>>>,
    routing_rules: RwLock<HashMap<MessageType, Vec<String>>>,
    transforms: RwLock<HashMap<(String, String), TransformFn>>,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
    counters: BridgeCounters,
}

/// Routes captured messages between registered protocol adapters.
#[derive(Default)]
pub struct ProtocolBridge {
    inner: Arc<BridgeInner>,
}

impl ProtocolBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_adapter(
        &self,
        name: &str,
        adapter: Arc<dyn ProtocolAdapter>,
    ) -> Result<(), ProtocolError> {
        let mut adapters = self.inner.adapters.write();
        if adapters.contains_key(name) {
            return Err(ProtocolError::Internal(format!(
                "adapter '{name}' already registered"
            )));
        }
        adapters.insert(name.to_string(), adapter);
        info!(event = "adapter_registered", protocol = name, "bridge adapter registered");
        Ok(())
    }

    /// Remove an adapter and scrub it from every routing rule.
    pub fn unregister_adapter(&self, name: &str) {
        self.inner.adapters.write().remove(name);
        let mut rules = self.inner.routing_rules.write();
        for targets in rules.values_mut() {
            targets.retain(|target| target != name);
        }
    }

    /// Route a message type to a fixed set of adapters.
    pub fn add_routing_rule(
        &self,
        kind: MessageType,
        targets: &[String],
    ) -> Result<(), ProtocolError> {
        {
            let adapters = self.inner.adapters.read();
            for target in targets {
                if !adapters.contains_key(target) {
                    return Err(ProtocolError::UnknownProtocol {
                        name: target.clone(),
                    });
                }
            }
        }
        self.inner.routing_rules.write().insert(kind, targets.to_vec());
        Ok(())
    }

    /// Install a transform applied to messages crossing `from` → `to`.
    pub fn add_transform_rule(&self, from: &str, to: &str, transform: TransformFn) {
        self.inner
            .transforms
            .write()
            .insert((from.to_string(), to.to_string()), transform);
    }

    /// Start the routing loop. Fails with `AlreadyRunning` when live.
    pub fn start(&self) -> Result<(), ProtocolError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyRunning);
        }
        let token = CancellationToken::new();
        *self.inner.shutdown.lock() = Some(token.clone());

        let weak: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.drain_adapters().await;
                    }
                }
            }
        });

        info!(event = "bridge_started", "protocol bridge started");
        Ok(())
    }

    /// Stop the routing loop. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.inner.shutdown.lock().take() {
            token.cancel();
        }
        info!(event = "bridge_stopped", "protocol bridge stopped");
    }

    /// Fan a captured message out to rule-selected adapters. Returns the
    /// delivery count.
    pub async fn route_message(&self, message: ProtocolMessage, source: &str) -> usize {
        self.inner.route_message(message, source).await
    }

    pub fn status(&self) -> BridgeStatus {
        let inner = &self.inner;
        let mut protocols: Vec<String> = inner.adapters.read().keys().cloned().collect();
        protocols.sort();
        let mut routing_rules: Vec<(String, Vec<String>)> = inner
            .routing_rules
            .read()
            .iter()
            .map(|(kind, targets)| (kind.to_string(), targets.clone()))
            .collect();
        routing_rules.sort();
        let mut transform_rules: Vec<String> = inner
            .transforms
            .read()
            .keys()
            .map(|(from, to)| format!("{from} -> {to}"))
            .collect();
        transform_rules.sort();

        BridgeStatus {
            protocols,
            routing_rules,
            transform_rules,
            messages_routed: inner.counters.messages_routed.load(Ordering::Relaxed),
            messages_transformed: inner.counters.messages_transformed.load(Ordering::Relaxed),
            routing_errors: inner.counters.routing_errors.load(Ordering::Relaxed),
        }
    }
}

impl BridgeInner {
    async fn drain_adapters(&self) {
        let adapters: Vec<(String, Arc<dyn ProtocolAdapter>)> = self
            .adapters
            .read()
            .iter()
            .map(|(name, adapter)| (name.clone(), Arc::clone(adapter)))
            .collect();
        for (name, adapter) in adapters {
            while let Some(message) = adapter.receive().await {
                self.route_message(message, &name).await;
            }
        }
    }

    async fn route_message(&self, message: ProtocolMessage, source: &str) -> usize {
        self.counters.messages_routed.fetch_add(1, Ordering::Relaxed);
        let targets = self.determine_targets(&message, source);

        let mut delivered = 0;
        for target in targets {
            if target == source {
                continue;
            }
            let adapter = self.adapters.read().get(&target).cloned();
            let Some(adapter) = adapter else { continue };

            let transformed = self.apply_transform(message.clone(), source, &target);
            match adapter.send(transformed).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    self.counters.routing_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        event = "bridge_route_failed",
                        protocol = %target,
                        error = %err,
                        "bridged delivery failed"
                    );
                }
            }
        }
        delivered
    }

    fn determine_targets(&self, message: &ProtocolMessage, source: &str) -> Vec<String> {
        if let Some(targets) = self.routing_rules.read().get(&message.kind) {
            return targets.clone();
        }
        if let Some(hinted) = message
            .metadata
            .get("target_protocols")
            .and_then(Value::as_array)
        {
            let adapters = self.adapters.read();
            return hinted
                .iter()
                .filter_map(Value::as_str)
                .filter(|name| adapters.contains_key(*name))
                .map(str::to_string)
                .collect();
        }
        // Default: everything except the source.
        self.adapters
            .read()
            .keys()
            .filter(|name| name.as_str() != source)
            .cloned()
            .collect()
    }

    fn apply_transform(&self, message: ProtocolMessage, from: &str, to: &str) -> ProtocolMessage {
        let transform = self
            .transforms
            .read()
            .get(&(from.to_string(), to.to_string()))
            .cloned();
        match transform {
            Some(transform) => {
                self.counters
                    .messages_transformed
                    .fetch_add(1, Ordering::Relaxed);
                transform(message)
            }
            None => message,
        }
    }
}

/// Bridge adapter for a mesh node: captures task, result, and
/// coordination traffic through registered handlers.
pub struct MeshAdapter {
    mesh: Arc<MeshNetwork>,
    captured: Mutex<mpsc::UnboundedReceiver<ProtocolMessage>>,
}

impl MeshAdapter {
    pub fn new(mesh: Arc<MeshNetwork>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in [
            MessageType::Task,
            MessageType::Result,
            MessageType::Coordination,
        ] {
            let tx = tx.clone();
            mesh.register_handler(
                kind,
                Arc::new(move |message: ProtocolMessage| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                        Ok(())
                    }
                    .boxed()
                }),
            );
        }
        Arc::new(Self {
            mesh,
            captured: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl ProtocolAdapter for MeshAdapter {
    async fn send(&self, message: ProtocolMessage) -> Result<(), ProtocolError> {
        if message.target.is_some() {
            self.mesh.send(message).await
        } else {
            self.mesh.broadcast(message).await
        }
    }

    async fn receive(&self) -> Option<ProtocolMessage> {
        self.captured.lock().try_recv().ok()
    }

    fn protocol_name(&self) -> &str {
        "mesh_network"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Test adapter backed by plain queues.
    struct QueueAdapter {
        name: String,
        inbound: Mutex<VecDeque<ProtocolMessage>>,
        outbound: Mutex<Vec<ProtocolMessage>>,
    }

    impl QueueAdapter {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                inbound: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(Vec::new()),
            })
        }

        fn capture(&self, message: ProtocolMessage) {
            self.inbound.lock().push_back(message);
        }

        fn delivered(&self) -> Vec<ProtocolMessage> {
            self.outbound.lock().clone()
        }
    }

    #[async_trait]
    impl ProtocolAdapter for QueueAdapter {
        async fn send(&self, message: ProtocolMessage) -> Result<(), ProtocolError> {
            self.outbound.lock().push(message);
            Ok(())
        }

        async fn receive(&self) -> Option<ProtocolMessage> {
            self.inbound.lock().pop_front()
        }

        fn protocol_name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn rule_routed_messages_reach_targets_but_never_source() {
        let bridge = ProtocolBridge::new();
        let router_side = QueueAdapter::new("task_router");
        let mesh_side = QueueAdapter::new("mesh_network");
        bridge
            .register_adapter("task_router", router_side.clone())
            .unwrap();
        bridge
            .register_adapter("mesh_network", mesh_side.clone())
            .unwrap();
        bridge
            .add_routing_rule(MessageType::Task, &["mesh_network".to_string()])
            .unwrap();

        let message = ProtocolMessage::new(MessageType::Task, "agent-1")
            .with_field("task", json!("bridge me"));
        let delivered = bridge.route_message(message.clone(), "task_router").await;
        assert_eq!(delivered, 1);
        assert_eq!(mesh_side.delivered().len(), 1);
        assert!(router_side.delivered().is_empty());

        // Same rule with the mesh as source: the only target is the
        // source, so nothing is delivered.
        let delivered = bridge.route_message(message, "mesh_network").await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn transforms_apply_on_protocol_crossings() {
        let bridge = ProtocolBridge::new();
        let a = QueueAdapter::new("a");
        let b = QueueAdapter::new("b");
        bridge.register_adapter("a", a.clone()).unwrap();
        bridge.register_adapter("b", b.clone()).unwrap();
        bridge.add_transform_rule(
            "a",
            "b",
            Arc::new(|message| message.with_field("bridged", json!(true))),
        );

        bridge
            .route_message(ProtocolMessage::new(MessageType::Result, "agent"), "a")
            .await;
        let received = b.delivered();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].content["bridged"], json!(true));
        assert_eq!(bridge.status().messages_transformed, 1);
    }

    #[tokio::test]
    async fn routing_loop_drains_captured_traffic() {
        let bridge = ProtocolBridge::new();
        let a = QueueAdapter::new("a");
        let b = QueueAdapter::new("b");
        bridge.register_adapter("a", a.clone()).unwrap();
        bridge.register_adapter("b", b.clone()).unwrap();
        bridge.start().unwrap();
        assert!(bridge.start().is_err(), "double start rejected");

        a.capture(ProtocolMessage::new(MessageType::Coordination, "agent"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(b.delivered().len(), 1);

        bridge.stop();
        bridge.stop();
    }

    #[tokio::test]
    async fn rules_reject_unknown_targets() {
        let bridge = ProtocolBridge::new();
        let err = bridge
            .add_routing_rule(MessageType::Task, &["ghost".to_string()])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownProtocol { .. }));
    }
}
