//! # Swarmlink Mesh
//!
//! Hybrid coordination: a self-forming overlay with capped direct
//! connections, distance-vector routing, ttl/seen-list broadcasts, and
//! distributed task execution with pluggable dispatch strategies.

pub mod network;
pub mod routing;

pub use network::{ExecutionStrategy, MeshConfig, MeshMetrics, MeshNetwork, PROTOCOL_NAME};
pub use routing::MeshRoute;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use serde_json::{json, Map, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use swarmlink_protocol::{
        HandlerFuture, MessageBus, MessageType, Protocol, ProtocolError, ProtocolMessage,
        TaskExecutor,
    };
    use tokio::time::sleep;

    /// Short cycles for self-forming tests.
    fn fast_config() -> MeshConfig {
        MeshConfig {
            heartbeat_interval: Duration::from_millis(40),
            stale_threshold: Duration::from_secs(10),
            discovery_interval: Duration::from_millis(40),
            routing_interval: Duration::from_millis(40),
            route_discovery_delay: Duration::from_millis(200),
            ..MeshConfig::default()
        }
    }

    /// Loops effectively disabled; topology is shaped by hand.
    fn manual_config(max_connections: usize) -> MeshConfig {
        MeshConfig {
            max_connections,
            heartbeat_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(120),
            discovery_interval: Duration::from_secs(60),
            routing_interval: Duration::from_secs(60),
            route_discovery_delay: Duration::from_millis(250),
            ..MeshConfig::default()
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl TaskExecutor for SlowExecutor {
        async fn execute(
            &self,
            _task: &str,
            _capability: &str,
            _context: &Map<String, Value>,
        ) -> anyhow::Result<Value> {
            sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn self_forming_cluster_executes_distributed_task() {
        let bus = MessageBus::new();
        let a = MeshNetwork::with_config("node-a", bus.clone(), fast_config());
        let b = MeshNetwork::with_config("node-b", bus.clone(), fast_config());
        let c = MeshNetwork::with_config("node-c", bus.clone(), fast_config());

        a.register_capability("analysis");
        for node in [&a, &b, &c] {
            node.start().await.unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        let result = b
            .execute_distributed(
                "inspect logs",
                "analysis",
                ExecutionStrategy::RoundRobin,
                Some(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert!(result.as_str().unwrap().contains("node-a"));
        assert_eq!(a.metrics().tasks_executed, 1);

        for node in [&a, &b, &c] {
            node.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn slow_peer_surfaces_task_timeout_and_route_is_dropped() {
        let bus = MessageBus::new();
        let a = MeshNetwork::with_config("node-a", bus.clone(), fast_config());
        let b = MeshNetwork::with_config("node-b", bus.clone(), fast_config());
        let c = MeshNetwork::with_config("node-c", bus.clone(), fast_config());

        a.register_capability("analysis");
        a.set_task_executor(Arc::new(SlowExecutor));
        for node in [&a, &b, &c] {
            node.start().await.unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        let err = b
            .execute_distributed(
                "x",
                "analysis",
                ExecutionStrategy::RoundRobin,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TaskTimeout { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(900) && elapsed < Duration::from_secs(3));

        // Stopping the peer clears it from routes within a routing cycle.
        a.stop().await.unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(b.route_to("node-a").is_none());
        assert!(!b.connections().contains(&"node-a".to_string()));

        for node in [&b, &c] {
            node.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn sparse_topology_discovers_multi_hop_route() {
        let bus = MessageBus::new();
        let names = ["node-a", "node-b", "node-c", "node-d", "node-e"];
        let nodes: Vec<_> = names
            .iter()
            .map(|name| MeshNetwork::with_config(*name, bus.clone(), manual_config(2)))
            .collect();
        for node in &nodes {
            node.start().await.unwrap();
        }

        // Line topology b - c - d - e; a dangles off b.
        let connect = |left: usize, right: usize| {
            assert!(nodes[left].connect_to(names[right]));
            assert!(nodes[right].connect_to(names[left]));
        };
        connect(1, 2);
        connect(2, 3);
        connect(3, 4);
        assert!(nodes[0].connect_to(names[1]));

        // e records what reaches it.
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        nodes[4].register_handler(
            MessageType::Request,
            Arc::new(move |message: ProtocolMessage| -> HandlerFuture {
                let sink = sink.clone();
                async move {
                    sink.lock().push(message.content_str("payload").unwrap_or("").to_string());
                    Ok(())
                }
                .boxed()
            }),
        );

        let started = std::time::Instant::now();
        nodes[1]
            .send(
                ProtocolMessage::new(MessageType::Request, "node-b")
                    .with_target("node-e")
                    .with_field("payload", json!("hello across the mesh")),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        sleep(Duration::from_millis(100)).await;
        assert_eq!(received.lock().as_slice(), ["hello across the mesh"]);

        let route = nodes[1].route_to("node-e").expect("learned route");
        assert!(route.distance <= 4, "distance {}", route.distance);
        assert_eq!(route.next_hop, "node-c");

        for node in &nodes {
            node.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn unreachable_target_raises_no_route() {
        let bus = MessageBus::new();
        let a = MeshNetwork::with_config("node-a", bus.clone(), manual_config(2));
        a.start().await.unwrap();

        let err = a
            .send(
                ProtocolMessage::new(MessageType::Request, "node-a").with_target("nowhere"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NoRoute { .. }));

        a.stop().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_ttl_bounds_reach_and_dedup_prevents_reprocessing() {
        let bus = MessageBus::new();
        let names = ["node-a", "node-b", "node-c", "node-d", "node-e"];
        let nodes: Vec<_> = names
            .iter()
            .map(|name| MeshNetwork::with_config(*name, bus.clone(), manual_config(2)))
            .collect();
        for node in &nodes {
            node.start().await.unwrap();
        }
        // Line a - b - c - d - e.
        for pair in [(0, 1), (1, 2), (2, 3), (3, 4)] {
            assert!(nodes[pair.0].connect_to(names[pair.1]));
            assert!(nodes[pair.1].connect_to(names[pair.0]));
        }

        let hits: Vec<Arc<Mutex<u32>>> = (0..5).map(|_| Arc::new(Mutex::new(0))).collect();
        for (node, counter) in nodes.iter().zip(&hits) {
            let counter = counter.clone();
            node.register_handler(
                MessageType::Coordination,
                Arc::new(move |_message: ProtocolMessage| -> HandlerFuture {
                    let counter = counter.clone();
                    async move {
                        *counter.lock() += 1;
                        Ok(())
                    }
                    .boxed()
                }),
            );
        }

        // ttl 2 from a: reaches b (1 hop) and c (2 hops), never d or e.
        let mut message = ProtocolMessage::new(MessageType::Coordination, "node-a");
        message.set_ttl(2);
        nodes[0].broadcast(message).await.unwrap();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(*hits[1].lock(), 1, "one hop peer sees it once");
        assert_eq!(*hits[2].lock(), 1, "two hop peer sees it once");
        assert_eq!(*hits[3].lock(), 0, "ttl exhausted before three hops");
        assert_eq!(*hits[4].lock(), 0);

        for node in &nodes {
            node.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn task_without_local_capability_is_forwarded_once() {
        let bus = MessageBus::new();
        let a = MeshNetwork::with_config("node-a", bus.clone(), fast_config());
        let b = MeshNetwork::with_config("node-b", bus.clone(), fast_config());
        let c = MeshNetwork::with_config("node-c", bus.clone(), fast_config());

        // Only c can analyze; a sends the task to b on purpose.
        c.register_capability("analysis");
        for node in [&a, &b, &c] {
            node.start().await.unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        let task_id = uuid::Uuid::new_v4().to_string();
        let message = ProtocolMessage::new(MessageType::Task, "node-a")
            .with_target("node-b")
            .with_field("task", json!("inspect"))
            .with_field("capability", json!("analysis"))
            .with_field("task_id", json!(task_id))
            .with_field("reply_to", json!("node-a"));

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        a.register_handler(
            MessageType::Result,
            Arc::new(move |message: ProtocolMessage| -> HandlerFuture {
                let sink = sink.clone();
                async move {
                    sink.lock().push(message.content.get("result").cloned());
                    Ok(())
                }
                .boxed()
            }),
        );

        a.send(message).await.unwrap();
        sleep(Duration::from_millis(300)).await;

        let results = received.lock();
        assert_eq!(results.len(), 1);
        assert!(results[0]
            .as_ref()
            .unwrap()
            .as_str()
            .unwrap()
            .contains("node-c"));
        assert_eq!(c.metrics().tasks_executed, 1);
        assert_eq!(b.metrics().tasks_executed, 0);

        for node in [&a, &b, &c] {
            node.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn connection_cap_is_honored() {
        let bus = MessageBus::new();
        let hub = MeshNetwork::with_config("hub", bus.clone(), manual_config(2));
        hub.start().await.unwrap();

        assert!(hub.connect_to("p1"));
        assert!(hub.connect_to("p2"));
        assert!(!hub.connect_to("p3"), "cap of two enforced");
        assert!(hub.connect_to("p2"), "existing connection is idempotent");
        assert_eq!(hub.connections().len(), 2);

        hub.disconnect("p1");
        assert!(hub.connect_to("p3"));

        hub.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_releases_pending_executions() {
        let bus = MessageBus::new();
        let a = MeshNetwork::with_config("node-a", bus.clone(), fast_config());
        let b = MeshNetwork::with_config("node-b", bus.clone(), fast_config());
        a.register_capability("analysis");
        a.set_task_executor(Arc::new(SlowExecutor));
        a.start().await.unwrap();
        b.start().await.unwrap();
        sleep(Duration::from_millis(150)).await;

        let b_clone = b.clone();
        let pending = tokio::spawn(async move {
            b_clone
                .execute_distributed(
                    "x",
                    "analysis",
                    ExecutionStrategy::Random,
                    Some(Duration::from_secs(10)),
                )
                .await
        });
        sleep(Duration::from_millis(100)).await;

        b.stop().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::ShuttingDown));

        a.stop().await.unwrap();
    }

    #[test]
    fn strategy_parsing_round_trip() {
        assert_eq!(
            "round_robin".parse::<ExecutionStrategy>().unwrap(),
            ExecutionStrategy::RoundRobin
        );
        assert_eq!(
            "least_busy".parse::<ExecutionStrategy>().unwrap(),
            ExecutionStrategy::LeastBusy
        );
        assert!("fastest".parse::<ExecutionStrategy>().is_err());
    }
}
