// Swarmlink - Multi-Agent Coordination Runtime
//
// Demo entry point wiring the full coordination substrate together:
// - Centralized task routing with worker scoring and failover
// - Decentralized consensus with Byzantine vote aggregation
// - Self-organizing mesh overlay with distributed execution
// - Adaptive mode selection fed by live outcome statistics
//
// The binary builds the transport, registry, and selector explicitly,
// runs one round on each protocol, and shuts everything down cleanly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use swarmlink_consensus::{ConsensusProtocol, ConsensusType};
use swarmlink_mesh::{ExecutionStrategy, MeshNetwork};
use swarmlink_protocol::{MessageBus, Protocol};
use swarmlink_registry::{AdaptiveModeSelector, CoordinationType, ProtocolRegistry};
use swarmlink_workflow::{Agent, CoordinatedWorkflow};

/// Demo agent answering for a fixed capability set.
struct DemoAgent {
    name: String,
    capabilities: Vec<String>,
}

impl DemoAgent {
    fn new(name: &str, capabilities: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            capabilities: capabilities.iter().map(|cap| cap.to_string()).collect(),
        })
    }
}

#[async_trait]
impl Agent for DemoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn execute(&self, task: &str, _context: Option<Value>) -> Result<Value> {
        Ok(json!(format!("{} finished '{task}'", self.name)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Structured JSON logging with environment-based filtering
    // (RUST_LOG=debug,swarmlink=trace).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("swarmlink=info".parse()?),
        )
        .json()
        .init();

    info!("starting swarmlink coordination runtime");

    // Explicit construction at program entry: one transport, one registry,
    // one selector, shared by reference.
    let bus = MessageBus::new();
    let registry = Arc::new(ProtocolRegistry::with_builtins());
    let selector = Arc::new(AdaptiveModeSelector::new());

    // Phase 1: centralized routing through a workflow with two agents.
    let workflow = CoordinatedWorkflow::new(
        "demo",
        CoordinationType::Centralized,
        Some("task_router".to_string()),
        registry.clone(),
        selector.clone(),
        bus.clone(),
    );
    workflow.add_agent(DemoAgent::new("researcher", &["research"]));
    workflow.add_agent(DemoAgent::new("analyst", &["analysis"]));
    workflow.initialize().await?;

    let started = Instant::now();
    match workflow
        .execute_with_coordination(
            "profile the workload",
            &["research".to_string(), "analysis".to_string()],
            "auto",
        )
        .await
    {
        Ok(result) => {
            selector.update_performance(
                CoordinationType::Centralized,
                true,
                started.elapsed().as_secs_f64() * 1000.0,
                Map::new(),
            );
            info!(result = %result, "routed workflow finished");
        }
        Err(err) => {
            selector.update_performance(
                CoordinationType::Centralized,
                false,
                started.elapsed().as_secs_f64() * 1000.0,
                Map::new(),
            );
            error!(error = %err, "routed workflow failed");
        }
    }
    workflow.cleanup().await?;

    // Phase 2: a Byzantine consensus round across five nodes.
    let mut cluster = Vec::new();
    for index in 1..=5 {
        let node = ConsensusProtocol::new(
            format!("consensus-{index}"),
            bus.clone(),
            ConsensusType::Byzantine,
        );
        node.start().await?;
        cluster.push(node);
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    match cluster[0]
        .propose(
            json!({"action": "deploy", "resource_required": 80, "resource_available": 100}),
            Some(Duration::from_secs(5)),
        )
        .await
    {
        Ok(accepted) => info!(accepted, stats = ?cluster[0].stats(), "consensus round finished"),
        Err(err) => error!(error = %err, "consensus round failed"),
    }
    for node in &cluster {
        node.stop().await?;
    }

    // Phase 3: distributed execution across a small mesh.
    let mesh_a = MeshNetwork::new("mesh-a", bus.clone());
    let mesh_b = MeshNetwork::new("mesh-b", bus.clone());
    mesh_a.register_capability("indexing");
    mesh_a.start().await?;
    mesh_b.start().await?;
    mesh_a.connect_to("mesh-b");
    mesh_b.connect_to("mesh-a");
    tokio::time::sleep(Duration::from_millis(200)).await;

    match mesh_b
        .execute_distributed(
            "rebuild the index",
            "indexing",
            ExecutionStrategy::LeastBusy,
            Some(Duration::from_secs(5)),
        )
        .await
    {
        Ok(result) => info!(result = %result, metrics = ?mesh_b.metrics(), "mesh task finished"),
        Err(err) => error!(error = %err, "mesh task failed"),
    }
    mesh_a.stop().await?;
    mesh_b.stop().await?;

    info!(mode_stats = ?selector.mode_stats(), "shutting down");
    registry.stop_all_instances().await;

    Ok(())
}
