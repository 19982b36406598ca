//! End-to-end coordination test across the three protocols on one shared
//! transport: centralized routing, Byzantine consensus, mesh route
//! discovery, and adaptive selector feedback, followed by clean teardown.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::info;

use swarmlink_consensus::{ConsensusConfig, ConsensusProtocol, ConsensusType};
use swarmlink_mesh::{MeshConfig, MeshNetwork};
use swarmlink_protocol::{
    EchoExecutor, MessageBus, MessageType, Protocol, ProtocolError, ProtocolMessage,
};
use swarmlink_registry::{AdaptiveModeSelector, CoordinationType, ProtocolRegistry};
use swarmlink_router::{RouterConfig, TaskRouter, TaskWorker};

struct ClusterHarness {
    bus: Arc<MessageBus>,
    registry: Arc<ProtocolRegistry>,
    selector: Arc<AdaptiveModeSelector>,
}

impl ClusterHarness {
    fn new() -> Self {
        Self {
            bus: MessageBus::new(),
            registry: Arc::new(ProtocolRegistry::with_builtins()),
            selector: Arc::new(AdaptiveModeSelector::new()),
        }
    }

    fn router_config() -> RouterConfig {
        RouterConfig {
            scheduler_interval: Duration::from_millis(50),
            monitor_interval: Duration::from_millis(100),
            ..RouterConfig::default()
        }
    }

    fn consensus_config() -> ConsensusConfig {
        ConsensusConfig {
            heartbeat_interval: Duration::from_millis(50),
            expiry_interval: Duration::from_millis(25),
            ..ConsensusConfig::default()
        }
    }

    fn mesh_config() -> MeshConfig {
        MeshConfig {
            max_connections: 2,
            heartbeat_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(120),
            discovery_interval: Duration::from_secs(60),
            routing_interval: Duration::from_secs(60),
            route_discovery_delay: Duration::from_millis(250),
            ..MeshConfig::default()
        }
    }

    /// Phase 1: two workers, two concurrent tasks, one assignment each.
    async fn run_centralized_phase(&self) {
        info!("phase 1: centralized routing");
        let router = TaskRouter::with_config("router", self.bus.clone(), Self::router_config());
        router.start().await.unwrap();

        let w1 = TaskWorker::new("w1", self.bus.clone(), Arc::new(EchoExecutor::new("w1")));
        let w2 = TaskWorker::new("w2", self.bus.clone(), Arc::new(EchoExecutor::new("w2")));
        w1.start().unwrap();
        w2.start().unwrap();
        router.register_worker("w1", &["compute".to_string()]);
        router.register_worker("w2", &["compute".to_string(), "analyze".to_string()]);

        let started = Instant::now();
        let (first, second) = tokio::join!(
            router.route_task("job1", "compute", 5, Some(Duration::from_secs(2)), Map::new()),
            router.route_task("job1", "compute", 5, Some(Duration::from_secs(2)), Map::new()),
        );
        first.unwrap();
        second.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        for worker_id in ["w1", "w2"] {
            let stats = router.worker_stats(worker_id).unwrap();
            assert_eq!(stats.tasks_completed, 1, "worker {worker_id}");
            assert_eq!(stats.tasks_failed, 0, "worker {worker_id}");
        }

        router.stop().await.unwrap();
        w1.stop();
        w2.stop();
    }

    /// Phase 2: Byzantine acceptance then rejection on a 5-node cluster.
    async fn run_consensus_phase(&self) {
        info!("phase 2: byzantine consensus");
        let mut cluster = Vec::new();
        for index in 1..=5 {
            let node = ConsensusProtocol::with_config(
                format!("node-{index}"),
                self.bus.clone(),
                ConsensusType::Byzantine,
                Self::consensus_config(),
            );
            node.start().await.unwrap();
            cluster.push(node);
        }
        sleep(Duration::from_millis(150)).await;

        let accepted = cluster[0]
            .propose(
                json!({"action": "deploy", "resource_required": 80, "resource_available": 100}),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert!(accepted);

        let rejected = cluster[0]
            .propose(
                json!({"action": "scale", "resource_required": 150, "resource_available": 100}),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert!(!rejected);

        sleep(Duration::from_millis(150)).await;
        let stats = cluster[0].stats();
        assert_eq!(stats.proposals_accepted, 1);
        assert_eq!(stats.proposals_rejected, 1);
        assert_eq!(stats.proposals_expired, 0);

        for node in &cluster {
            node.stop().await.unwrap();
        }
    }

    /// Phase 3: sparse line topology, targeted send learns a multi-hop
    /// route on demand.
    async fn run_mesh_phase(&self) {
        info!("phase 3: mesh route discovery");
        let names = ["m-a", "m-b", "m-c", "m-d", "m-e"];
        let nodes: Vec<_> = names
            .iter()
            .map(|name| MeshNetwork::with_config(*name, self.bus.clone(), Self::mesh_config()))
            .collect();
        for node in &nodes {
            node.start().await.unwrap();
        }
        for (left, right) in [(1, 2), (2, 3), (3, 4)] {
            assert!(nodes[left].connect_to(names[right]));
            assert!(nodes[right].connect_to(names[left]));
        }

        let delivered = Arc::new(parking_lot::Mutex::new(0u32));
        let sink = delivered.clone();
        nodes[4].register_handler(
            MessageType::Request,
            Arc::new(move |_message: ProtocolMessage| -> swarmlink_protocol::HandlerFuture {
                let sink = sink.clone();
                Box::pin(async move {
                    *sink.lock() += 1;
                    Ok(())
                })
            }),
        );

        let started = Instant::now();
        nodes[1]
            .send(
                ProtocolMessage::new(MessageType::Request, "m-b")
                    .with_target("m-e")
                    .with_field("payload", json!("ping")),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        sleep(Duration::from_millis(100)).await;
        assert_eq!(*delivered.lock(), 1);
        let route = nodes[1].route_to("m-e").expect("route installed");
        assert!(route.distance <= 4);

        for node in &nodes {
            node.stop().await.unwrap();
        }
    }

    /// Phase 4: selector feedback aggregates exactly as reported.
    fn run_selector_phase(&self) {
        info!("phase 4: selector feedback");
        for _ in 0..3 {
            self.selector.update_performance(
                CoordinationType::Centralized,
                true,
                80.0,
                Map::new(),
            );
        }
        for _ in 0..2 {
            self.selector.update_performance(
                CoordinationType::Centralized,
                false,
                200.0,
                Map::new(),
            );
        }

        let stats = self.selector.mode_stats();
        let centralized = &stats[&CoordinationType::Centralized];
        assert!((centralized.success_rate - 0.6).abs() < 1e-9);
        assert!((centralized.avg_latency_ms - 128.0).abs() < 1e-9);
        assert_eq!(centralized.total_tasks, 5);
    }

    /// Phase 5: registry-created instances shut down together and every
    /// waiter resolves.
    async fn run_teardown_phase(&self) {
        info!("phase 5: registry teardown");
        let router = self
            .registry
            .create_instance("task_router", "teardown-router", self.bus.clone())
            .unwrap();
        let mesh = self
            .registry
            .create_instance("mesh_network", "teardown-mesh", self.bus.clone())
            .unwrap();
        router.start().await.unwrap();
        mesh.start().await.unwrap();
        assert_eq!(self.registry.statistics().live_instances, 2);

        // A caller stuck waiting on the router observes the shutdown.
        let concrete: Arc<TaskRouter> = router
            .clone()
            .as_any()
            .downcast::<TaskRouter>()
            .expect("router instance");
        let pending = {
            let concrete = concrete.clone();
            tokio::spawn(async move {
                concrete
                    .route_task("orphan", "compute", 0, Some(Duration::from_secs(10)), Map::new())
                    .await
            })
        };
        sleep(Duration::from_millis(100)).await;

        self.registry.stop_all_instances().await;
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::ShuttingDown));
        assert_eq!(self.registry.statistics().live_instances, 0);
    }
}

#[tokio::test]
async fn coordination_cluster_end_to_end() {
    let harness = ClusterHarness::new();
    harness.run_centralized_phase().await;
    harness.run_consensus_phase().await;
    harness.run_mesh_phase().await;
    harness.run_selector_phase();
    harness.run_teardown_phase().await;
}

#[tokio::test]
async fn raft_cluster_converges_on_one_leader() {
    let bus = MessageBus::new();
    let config = ConsensusConfig {
        heartbeat_interval: Duration::from_millis(50),
        election_timeout: Duration::from_millis(150),
        leader_heartbeat_interval: Duration::from_millis(40),
        ..ConsensusConfig::default()
    };
    let mut cluster = Vec::new();
    for index in 1..=3 {
        let node = ConsensusProtocol::with_config(
            format!("raft-{index}"),
            bus.clone(),
            ConsensusType::Raft,
            config.clone(),
        );
        node.start().await.unwrap();
        cluster.push(node);
    }

    sleep(Duration::from_millis(1200)).await;

    let leaders: HashSet<String> = cluster.iter().filter_map(|node| node.leader()).collect();
    assert_eq!(leaders.len(), 1, "one agreed leader: {leaders:?}");

    // Only the leader believes it is leader.
    let self_leader_count = cluster
        .iter()
        .filter(|node| node.leader().as_deref() == Some(node.node_id()))
        .count();
    assert_eq!(self_leader_count, 1);

    // A proposal through any node succeeds under leader arbitration.
    let follower = cluster
        .iter()
        .find(|node| node.leader().as_deref() != Some(node.node_id()))
        .unwrap();
    let accepted = follower
        .propose(json!({"complexity": 0.1}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(accepted);

    for node in &cluster {
        node.stop().await.unwrap();
    }
}

#[tokio::test]
async fn wire_envelope_round_trips_exactly() {
    let mut message = ProtocolMessage::new(MessageType::Consensus, "node-1")
        .with_target("node-2")
        .with_field("action", json!("vote"))
        .with_field("payload", json!({"nested": [1, 2, 3], "flag": true}));
    message.set_ttl(3);
    message.mark_seen("node-1");

    let wire = serde_json::to_string(&message).unwrap();
    let decoded: ProtocolMessage = serde_json::from_str(&wire).unwrap();
    assert_eq!(message, decoded);

    let value: Value = serde_json::from_str(&wire).unwrap();
    for field in ["id", "type", "sender", "target", "content", "timestamp", "metadata"] {
        assert!(value.get(field).is_some(), "missing field {field}");
    }
}
