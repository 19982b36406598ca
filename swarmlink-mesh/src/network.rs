//! Self-organizing mesh overlay.
//!
//! Every node keeps a capped set of direct connections and a
//! distance-vector routing table. Broadcasts carry a ttl and a seen-list
//! and are relayed across direct connections; targeted sends resolve
//! direct → next-hop → on-demand route discovery. Route discovery floods a
//! trail-accumulating request and walks a hop-by-hop reply back along the
//! reversed trail, installing true hop distances at every node on the path.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use swarmlink_protocol::{
    EchoExecutor, HandlerFn, MessageBus, MessageType, NetworkStatus, NodeStatus, Protocol,
    ProtocolCore, ProtocolError, ProtocolMessage, TaskExecutor,
};

use crate::routing::MeshRoute;

pub const PROTOCOL_NAME: &str = "mesh_network";

/// How a target node is picked for distributed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    RoundRobin,
    Random,
    /// Ranks peers with status `idle` above others.
    LeastBusy,
}

impl FromStr for ExecutionStrategy {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "least_busy" => Ok(Self::LeastBusy),
            other => Err(ProtocolError::Internal(format!(
                "unknown execution strategy '{other}'"
            ))),
        }
    }
}

/// Mesh tuning knobs.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Cap on the direct-connection set.
    pub max_connections: usize,
    /// Heartbeat broadcast cadence.
    pub heartbeat_interval: Duration,
    /// Peers silent for longer than this are marked offline.
    pub stale_threshold: Duration,
    /// Peer-discovery broadcast cadence.
    pub discovery_interval: Duration,
    /// Routing-table refresh cadence.
    pub routing_interval: Duration,
    /// Hop budget stamped on broadcasts.
    pub broadcast_ttl: i64,
    /// Grace period after an on-demand route discovery before the retry.
    pub route_discovery_delay: Duration,
    /// Default deadline for distributed execution.
    pub task_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            heartbeat_interval: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(30),
            routing_interval: Duration::from_secs(30),
            broadcast_ttl: 3,
            route_discovery_delay: Duration::from_secs(1),
            task_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot returned by `MeshNetwork::metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MeshMetrics {
    pub node_id: String,
    pub connections: usize,
    pub routing_entries: usize,
    pub total_nodes: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub tasks_executed: u64,
    pub routing_updates: u64,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    tasks_executed: AtomicU64,
    routing_updates: AtomicU64,
}

/// Bounded remembered-message-id set for duplicate suppression.
struct SeenCache {
    ids: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns false when the id was already present.
    fn remember(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

struct MeshInner {
    core: Arc<ProtocolCore>,
    config: MeshConfig,
    connections: RwLock<BTreeSet<String>>,
    routes: DashMap<String, MeshRoute>,
    waiters: DashMap<String, oneshot::Sender<Result<Value, ProtocolError>>>,
    seen: Mutex<SeenCache>,
    rr_counter: AtomicUsize,
    executor: RwLock<Arc<dyn TaskExecutor>>,
    counters: Counters,
}

/// Self-organizing mesh protocol node.
pub struct MeshNetwork {
    inner: Arc<MeshInner>,
}

impl MeshNetwork {
    pub fn new(node_id: impl Into<String>, bus: Arc<MessageBus>) -> Arc<Self> {
        Self::with_config(node_id, bus, MeshConfig::default())
    }

    pub fn with_config(
        node_id: impl Into<String>,
        bus: Arc<MessageBus>,
        config: MeshConfig,
    ) -> Arc<Self> {
        let core = ProtocolCore::new(node_id, PROTOCOL_NAME, bus);
        let executor: Arc<dyn TaskExecutor> = Arc::new(EchoExecutor::new(core.node_id()));
        let inner = Arc::new(MeshInner {
            core,
            config,
            connections: RwLock::new(BTreeSet::new()),
            routes: DashMap::new(),
            waiters: DashMap::new(),
            seen: Mutex::new(SeenCache::new(4096)),
            rr_counter: AtomicUsize::new(0),
            executor: RwLock::new(executor),
            counters: Counters::default(),
        });
        MeshInner::register_handlers(&inner);
        Arc::new(Self { inner })
    }

    /// Replace the local task executor.
    pub fn set_task_executor(&self, executor: Arc<dyn TaskExecutor>) {
        *self.inner.executor.write() = executor;
    }

    /// Adopt a direct connection, honoring the connection cap.
    pub fn connect_to(&self, peer: &str) -> bool {
        if peer == self.inner.core.node_id() {
            return false;
        }
        let mut connections = self.inner.connections.write();
        if connections.contains(peer) {
            return true;
        }
        if connections.len() >= self.inner.config.max_connections {
            return false;
        }
        connections.insert(peer.to_string());
        info!(
            event = "connection_added",
            protocol = PROTOCOL_NAME,
            node = self.inner.core.node_id(),
            peer,
            "direct connection established"
        );
        true
    }

    /// Drop a direct connection and every route through it.
    pub fn disconnect(&self, peer: &str) {
        self.inner.connections.write().remove(peer);
        self.inner.purge_routes_via(peer);
    }

    /// Current direct connections.
    pub fn connections(&self) -> Vec<String> {
        self.inner.connections.read().iter().cloned().collect()
    }

    /// Current route to a target, if known.
    pub fn route_to(&self, target: &str) -> Option<MeshRoute> {
        self.inner.routes.get(target).map(|route| route.clone())
    }

    /// Execute a task on a peer advertising `capability`.
    pub async fn execute_distributed(
        &self,
        task: &str,
        capability: &str,
        strategy: ExecutionStrategy,
        timeout: Option<Duration>,
    ) -> Result<Value, ProtocolError> {
        let inner = &self.inner;
        if !inner.core.is_running() {
            return Err(ProtocolError::NotRunning);
        }

        let peers = inner.capable_peers(capability);
        if peers.is_empty() {
            return Err(ProtocolError::failed(format!(
                "no nodes with capability '{capability}'"
            )));
        }
        let target = inner.pick_peer(&peers, strategy);

        let task_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(task_id.clone(), tx);

        info!(
            event = "task_dispatched",
            protocol = PROTOCOL_NAME,
            node = inner.core.node_id(),
            peer = %target,
            task_id = %task_id,
            capability,
            "distributed task dispatched"
        );
        let message = ProtocolMessage::new(MessageType::Task, inner.core.node_id())
            .with_target(&target)
            .with_field("task", json!(task))
            .with_field("capability", json!(capability))
            .with_field("task_id", json!(task_id))
            .with_field("reply_to", json!(inner.core.node_id()));
        if let Err(err) = self.send(message).await {
            inner.waiters.remove(&task_id);
            return Err(err);
        }

        let deadline = timeout.unwrap_or(inner.config.task_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::ShuttingDown),
            Err(_) => {
                inner.waiters.remove(&task_id);
                Err(ProtocolError::timeout(format!(
                    "task {task_id} timed out after {deadline:?}"
                )))
            }
        }
    }

    /// Network metrics snapshot.
    pub fn metrics(&self) -> MeshMetrics {
        let inner = &self.inner;
        MeshMetrics {
            node_id: inner.core.node_id().to_string(),
            connections: inner.connections.read().len(),
            routing_entries: inner.routes.len(),
            total_nodes: inner.core.nodes().len(),
            messages_sent: inner.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: inner.counters.messages_received.load(Ordering::Relaxed),
            tasks_executed: inner.counters.tasks_executed.load(Ordering::Relaxed),
            routing_updates: inner.counters.routing_updates.load(Ordering::Relaxed),
        }
    }
}

impl MeshInner {
    fn register_handlers(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        inner
            .core
            .register_handler(MessageType::Discovery, discovery_handler(weak.clone()));
        inner
            .core
            .register_handler(MessageType::Status, status_handler(weak.clone()));
        inner
            .core
            .register_handler(MessageType::Task, task_handler(weak.clone()));
        inner
            .core
            .register_handler(MessageType::Result, result_handler(weak.clone()));
        inner
            .core
            .register_handler(MessageType::Error, error_handler(weak));
    }

    /// Ingest one transport message: dedupe, forward transit traffic,
    /// dispatch locally, relay broadcasts.
    async fn ingest(&self, message: ProtocolMessage) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        if !self.seen.lock().remember(message.id) {
            return;
        }

        if let Some(target) = message.target.clone() {
            if target != self.core.node_id() {
                self.forward_transit(message);
                return;
            }
            self.core.dispatch(message).await;
            return;
        }

        self.core.dispatch(message.clone()).await;
        self.relay_broadcast(message);
    }

    /// Pass a message addressed to somebody else along its route.
    fn forward_transit(&self, mut message: ProtocolMessage) {
        let Some(target) = message.target.clone() else {
            return;
        };
        if message.route_trail().iter().any(|hop| hop == self.core.node_id()) {
            debug!(
                event = "transit_loop_dropped",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                "routing loop detected, dropping message"
            );
            return;
        }
        message.push_route_hop(self.core.node_id());

        let next_hop = if self.connections.read().contains(&target) {
            Some(target.clone())
        } else {
            self.routes.get(&target).map(|route| route.next_hop.clone())
        };
        match next_hop {
            Some(next_hop) => {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.core.send_direct(&next_hop, message) {
                    warn!(
                        event = "transit_failed",
                        protocol = PROTOCOL_NAME,
                        node = self.core.node_id(),
                        peer = %next_hop,
                        error = %err,
                        "transit forwarding failed"
                    );
                }
            }
            None => {
                debug!(
                    event = "transit_no_route",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    peer = %target,
                    "no route for transit message"
                );
            }
        }
    }

    /// Re-broadcast to direct connections while hop budget remains.
    fn relay_broadcast(&self, mut message: ProtocolMessage) {
        let remaining = message.ttl().unwrap_or(0) - 1;
        if remaining < 1 {
            return;
        }
        message.set_ttl(remaining);
        message.mark_seen(self.core.node_id());
        message.push_route_hop(self.core.node_id());
        self.fan_to_connections(&message);
    }

    /// Deliver to every direct connection not yet on the seen-list.
    fn fan_to_connections(&self, message: &ProtocolMessage) {
        let connections = self.connections.read().clone();
        for peer in connections {
            if message.seen_by(&peer) {
                continue;
            }
            self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            if self.core.send_direct(&peer, message.clone()).is_err() {
                debug!(
                    event = "broadcast_drop",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    peer = %peer,
                    "direct connection unreachable"
                );
            }
        }
    }

    /// Mesh broadcast: stamp transport metadata and fan out one hop.
    fn broadcast_message(&self, mut message: ProtocolMessage) {
        if message.ttl().is_none() {
            message.set_ttl(self.config.broadcast_ttl);
        }
        message.mark_seen(self.core.node_id());
        if message.route_trail().is_empty() {
            message.push_route_hop(self.core.node_id());
        }
        self.fan_to_connections(&message);
    }

    /// Resolve a targeted message: direct connection, then routing table.
    fn try_deliver(&self, target: &str, message: &ProtocolMessage) -> Result<(), ProtocolError> {
        if self.connections.read().contains(target) {
            self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            return self.core.send_direct(target, message.clone());
        }
        if let Some(route) = self.routes.get(target) {
            let mut routed = message.clone();
            routed.push_route_hop(self.core.node_id());
            self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            return self.core.send_direct(&route.next_hop, routed);
        }
        Err(ProtocolError::no_route(target))
    }

    /// Flood a trail-accumulating route-discovery request.
    fn discover_route(&self, target: &str) {
        debug!(
            event = "route_discovery",
            protocol = PROTOCOL_NAME,
            node = self.core.node_id(),
            peer = target,
            "flooding route discovery"
        );
        let mut message = ProtocolMessage::new(MessageType::Discovery, self.core.node_id())
            .with_field("looking_for", json!(target))
            .with_field("route_discovery", json!(true));
        message.set_ttl(self.config.broadcast_ttl);
        message.mark_seen(self.core.node_id());
        message.push_route_hop(self.core.node_id());
        self.fan_to_connections(&message);
    }

    fn install_route(&self, target: &str, next_hop: &str, distance: u32) {
        let candidate = MeshRoute::new(target, next_hop, distance);
        match self.routes.get_mut(target) {
            Some(mut existing) => {
                if existing.is_improved_by(&candidate) {
                    *existing = candidate;
                }
            }
            None => {
                self.routes.insert(target.to_string(), candidate);
            }
        }
    }

    fn purge_routes_via(&self, peer: &str) {
        self.routes
            .retain(|target, route| target != peer && route.next_hop != peer);
    }

    /// Active-or-idle nodes advertising a capability (self included).
    fn capable_peers(&self, capability: &str) -> Vec<String> {
        let mut peers: Vec<String> = self
            .core
            .nodes()
            .iter()
            .filter(|entry| {
                entry.value().status != NodeStatus::Offline
                    && entry.value().has_capability(capability)
            })
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    fn pick_peer(&self, peers: &[String], strategy: ExecutionStrategy) -> String {
        match strategy {
            ExecutionStrategy::RoundRobin => {
                let index = self.rr_counter.fetch_add(1, Ordering::Relaxed) % peers.len();
                peers[index].clone()
            }
            ExecutionStrategy::Random => peers
                .choose(&mut rand::thread_rng())
                .cloned()
                .unwrap_or_else(|| peers[0].clone()),
            ExecutionStrategy::LeastBusy => {
                let rank = |peer: &String| {
                    let status = self
                        .core
                        .node(peer)
                        .map(|record| record.status)
                        .unwrap_or(NodeStatus::Busy);
                    match status {
                        NodeStatus::Idle => 0u8,
                        NodeStatus::Active => 1,
                        _ => 2,
                    }
                };
                peers
                    .iter()
                    .min_by_key(|peer| (rank(peer), (*peer).clone()))
                    .cloned()
                    .unwrap_or_else(|| peers[0].clone())
            }
        }
    }

    /// Route-discovery arm of the discovery handler.
    fn handle_route_discovery(&self, message: &ProtocolMessage) {
        let Some(looking_for) = message.content_str("looking_for") else {
            return;
        };
        if looking_for != self.core.node_id() {
            // Not for us; the broadcast relay floods it onward.
            return;
        }
        let trail = message.route_trail();
        if trail.is_empty() {
            return;
        }
        let path: Vec<String> = trail.iter().rev().cloned().collect();
        let first = path[0].clone();
        debug!(
            event = "route_reply",
            protocol = PROTOCOL_NAME,
            node = self.core.node_id(),
            peer = %first,
            hops = path.len(),
            "answering route discovery"
        );
        let reply = ProtocolMessage::new(MessageType::Discovery, self.core.node_id())
            .with_target(&first)
            .with_field("route_reply", json!(true))
            .with_field("route_target", json!(self.core.node_id()))
            .with_field("path", json!(path))
            .with_field("index", json!(0))
            .with_field("distance", json!(1));
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        let _ = self.core.send_direct(&first, reply);
    }

    /// One hop of a route reply walking back along the reversed trail.
    fn handle_route_reply(&self, message: &ProtocolMessage) {
        let Some(target) = message.content_str("route_target") else {
            return;
        };
        let path: Vec<String> = message
            .content
            .get("path")
            .and_then(Value::as_array)
            .map(|hops| {
                hops.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let index = message
            .content
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let distance = message
            .content
            .get("distance")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;

        if path.get(index).map(String::as_str) != Some(self.core.node_id()) {
            return;
        }
        self.install_route(target, &message.sender, distance);
        self.counters.routing_updates.fetch_add(1, Ordering::Relaxed);

        if let Some(next) = path.get(index + 1) {
            let forward = ProtocolMessage::new(MessageType::Discovery, self.core.node_id())
                .with_target(next)
                .with_field("route_reply", json!(true))
                .with_field("route_target", json!(target))
                .with_field("path", json!(path))
                .with_field("index", json!(index + 1))
                .with_field("distance", json!(distance + 1));
            self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            let _ = self.core.send_direct(next, forward);
        }
    }

    /// Execute a task locally, or forward it once toward a capable peer.
    async fn handle_task(&self, message: ProtocolMessage) {
        let task = message.content_str("task").unwrap_or_default().to_string();
        let capability = message
            .content_str("capability")
            .unwrap_or_default()
            .to_string();
        let task_id = message.content_str("task_id").unwrap_or_default().to_string();
        let reply_to = message
            .content_str("reply_to")
            .unwrap_or(&message.sender)
            .to_string();
        if task.is_empty() || capability.is_empty() {
            warn!(
                event = "task_malformed",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                peer = %message.sender,
                "task message missing task or capability"
            );
            return;
        }

        let have_capability = self
            .core
            .node(self.core.node_id())
            .map(|record| record.has_capability(&capability))
            .unwrap_or(false);

        if !have_capability {
            let already_forwarded = message
                .metadata
                .get("forwarded")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let candidates: Vec<String> = self
                .capable_peers(&capability)
                .into_iter()
                .filter(|peer| peer != self.core.node_id())
                .collect();

            if already_forwarded || candidates.is_empty() {
                self.reply_error(&reply_to, &task_id, "capability unavailable");
                return;
            }
            // Forward once toward a capable neighbor.
            let mut forwarded = message.clone();
            forwarded.target = Some(candidates[0].clone());
            forwarded
                .metadata
                .insert("forwarded".to_string(), json!(true));
            debug!(
                event = "task_forwarded",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                peer = %candidates[0],
                task_id = %task_id,
                "forwarding task to capable peer"
            );
            if self.try_deliver(&candidates[0], &forwarded).is_err() {
                self.reply_error(&reply_to, &task_id, "capable peer unreachable");
            }
            return;
        }

        self.core.update_status(NodeStatus::Busy);
        self.counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
        let executor = self.executor.read().clone();
        let outcome = executor.execute(&task, &capability, &message.content).await;
        self.core.update_status(NodeStatus::Idle);

        let reply = match outcome {
            Ok(result) => ProtocolMessage::new(MessageType::Result, self.core.node_id())
                .with_target(&reply_to)
                .with_field("task_id", json!(task_id))
                .with_field("result", result)
                .with_field("success", json!(true)),
            Err(err) => ProtocolMessage::new(MessageType::Error, self.core.node_id())
                .with_target(&reply_to)
                .with_field("task_id", json!(task_id))
                .with_field("error", json!(err.to_string()))
                .with_field("success", json!(false)),
        };
        if self.try_deliver(&reply_to, &reply).is_err() {
            // Transport-direct fallback for an unrouted requester.
            let _ = self.core.send_direct(&reply_to, reply);
        }
    }

    fn reply_error(&self, reply_to: &str, task_id: &str, reason: &str) {
        let reply = ProtocolMessage::new(MessageType::Error, self.core.node_id())
            .with_target(reply_to)
            .with_field("task_id", json!(task_id))
            .with_field("error", json!(reason))
            .with_field("success", json!(false));
        if self.try_deliver(reply_to, &reply).is_err() {
            let _ = self.core.send_direct(reply_to, reply);
        }
    }

    fn settle_waiter(&self, task_id: &str, outcome: Result<Value, ProtocolError>) {
        if let Some((_, waiter)) = self.waiters.remove(task_id) {
            let _ = waiter.send(outcome);
        }
    }

    /// One heartbeat pass: advertise self, expire stale peers.
    fn heartbeat_once(&self) {
        self.broadcast_message(self.core.heartbeat_message());

        let stale_cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let stale: Vec<String> = self
            .core
            .nodes()
            .iter()
            .filter(|entry| {
                entry.key() != self.core.node_id()
                    && entry.value().status != NodeStatus::Offline
                    && entry.value().last_heartbeat < stale_cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();
        for peer in stale {
            warn!(
                event = "peer_stale",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                peer = %peer,
                "peer heartbeat stale, marking offline"
            );
            self.core.set_status(&peer, NodeStatus::Offline);
            self.connections.write().remove(&peer);
            self.purge_routes_via(&peer);
        }
    }

    /// One discovery pass: look for peers, adopt connections below the cap.
    fn discovery_once(&self) {
        self.broadcast_message(self.core.discovery_request());

        let candidates = self.core.active_nodes();
        let mut connections = self.connections.write();
        for peer in candidates {
            if connections.len() >= self.config.max_connections {
                break;
            }
            if connections.insert(peer.clone()) {
                info!(
                    event = "connection_added",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    peer = %peer,
                    "adopted discovered peer"
                );
            }
        }
    }

    /// One routing pass: refresh distance-1 entries, purge offline routes.
    fn routing_once(&self) {
        let connections = self.connections.read().clone();
        for peer in &connections {
            self.install_route(peer, peer, 1);
        }

        let offline: Vec<String> = self
            .core
            .nodes()
            .iter()
            .filter(|entry| entry.value().status == NodeStatus::Offline)
            .map(|entry| entry.key().clone())
            .collect();
        for peer in offline {
            self.purge_routes_via(&peer);
        }
        self.counters.routing_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn spawn_pump(
        inner: &Arc<Self>,
        mut receiver: mpsc::UnboundedReceiver<ProtocolMessage>,
        token: CancellationToken,
    ) {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = receiver.recv() => {
                        match message {
                            Some(message) => {
                                let Some(inner) = weak.upgrade() else { break };
                                inner.ingest(message).await;
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    fn spawn_loop<F>(inner: &Arc<Self>, interval: Duration, token: CancellationToken, body: F)
    where
        F: Fn(&MeshInner) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // An interval's first tick completes immediately; wait a full
            // period before the first pass.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            body(&inner);
                        }));
                        if pass.is_err() {
                            warn!(
                                event = "mesh_loop_crash",
                                protocol = PROTOCOL_NAME,
                                "background pass panicked, backing off"
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
    }

    fn release_waiters(&self) {
        let task_ids: Vec<String> = self.waiters.iter().map(|entry| entry.key().clone()).collect();
        for task_id in task_ids {
            if let Some((_, waiter)) = self.waiters.remove(&task_id) {
                let _ = waiter.send(Err(ProtocolError::ShuttingDown));
            }
        }
    }
}

fn discovery_handler(inner: Weak<MeshInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            let Some(inner) = inner.upgrade() else {
                return Ok(());
            };
            if message
                .content
                .get("route_reply")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                inner.handle_route_reply(&message);
            } else if message
                .content
                .get("route_discovery")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                inner.core.apply_heartbeat(&message);
                inner.handle_route_discovery(&message);
            } else if message.content.get("reply").is_some() {
                inner.core.apply_heartbeat(&message);
            } else {
                inner.core.apply_discovery(&message);
            }
            Ok(())
        }
        .boxed()
    })
}

fn status_handler(inner: Weak<MeshInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                inner.core.apply_status(&message);
                if message.content_str("status") == Some("offline") {
                    inner.connections.write().remove(&message.sender);
                    inner.purge_routes_via(&message.sender);
                }
            }
            Ok(())
        }
        .boxed()
    })
}

fn task_handler(inner: Weak<MeshInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                inner.handle_task(message).await;
            }
            Ok(())
        }
        .boxed()
    })
}

fn result_handler(inner: Weak<MeshInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                if let Some(task_id) = message.content_str("task_id") {
                    let result = message.content.get("result").cloned().unwrap_or(Value::Null);
                    inner.settle_waiter(task_id, Ok(result));
                }
            }
            Ok(())
        }
        .boxed()
    })
}

fn error_handler(inner: Weak<MeshInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                if let Some(task_id) = message.content_str("task_id") {
                    let reason = message
                        .content_str("error")
                        .unwrap_or("remote execution failed")
                        .to_string();
                    inner.settle_waiter(task_id, Err(ProtocolError::failed(reason)));
                }
            }
            Ok(())
        }
        .boxed()
    })
}

#[async_trait::async_trait]
impl Protocol for MeshNetwork {
    fn node_id(&self) -> &str {
        self.inner.core.node_id()
    }

    fn protocol_name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        let (receiver, token) = self.inner.core.begin_start()?;
        MeshInner::spawn_pump(&self.inner, receiver, token.clone());
        MeshInner::spawn_loop(
            &self.inner,
            self.inner.config.heartbeat_interval,
            token.clone(),
            |inner| inner.heartbeat_once(),
        );
        MeshInner::spawn_loop(
            &self.inner,
            self.inner.config.discovery_interval,
            token.clone(),
            |inner| inner.discovery_once(),
        );
        MeshInner::spawn_loop(
            &self.inner,
            self.inner.config.routing_interval,
            token,
            |inner| inner.routing_once(),
        );
        // Transport-level hello so close peers learn us before the first
        // discovery cycle.
        self.inner.core.broadcast_all(self.inner.core.discovery_request());
        info!(
            event = "protocol_started",
            protocol = PROTOCOL_NAME,
            node = self.inner.core.node_id(),
            "mesh node started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProtocolError> {
        if !self.inner.core.begin_stop() {
            return Ok(());
        }
        self.inner.release_waiters();
        info!(
            event = "protocol_stopped",
            protocol = PROTOCOL_NAME,
            node = self.inner.core.node_id(),
            "mesh node stopped"
        );
        Ok(())
    }

    async fn send(&self, message: ProtocolMessage) -> Result<(), ProtocolError> {
        let inner = &self.inner;
        let Some(target) = message.target.clone() else {
            return self.broadcast(message).await;
        };
        if !inner.core.is_running() {
            return Err(ProtocolError::NotRunning);
        }
        if target == inner.core.node_id() {
            inner.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
            return inner.core.send_direct(&target, message);
        }

        if inner.try_deliver(&target, &message).is_ok() {
            return Ok(());
        }

        // On-demand discovery, one retry after a short grace period.
        inner.discover_route(&target);
        tokio::time::sleep(inner.config.route_discovery_delay).await;
        inner
            .try_deliver(&target, &message)
            .map_err(|_| ProtocolError::no_route(target))
    }

    async fn broadcast(&self, message: ProtocolMessage) -> Result<(), ProtocolError> {
        self.inner.broadcast_message(message);
        Ok(())
    }

    fn register_handler(&self, kind: MessageType, handler: HandlerFn) {
        self.inner.core.register_handler(kind, handler);
    }

    fn register_capability(&self, capability: &str) {
        self.inner.core.register_capability(capability);
    }

    fn unregister_capability(&self, capability: &str) {
        self.inner.core.unregister_capability(capability);
    }

    fn update_status(&self, status: NodeStatus) {
        self.inner.core.update_status(status);
    }

    fn active_nodes(&self) -> Vec<String> {
        self.inner.core.active_nodes()
    }

    fn nodes_with_capability(&self, capability: &str) -> Vec<String> {
        self.inner.core.nodes_with_capability(capability)
    }

    fn network_status(&self) -> NetworkStatus {
        self.inner.core.network_status()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
