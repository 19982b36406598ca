//! Workflow layer: multi-capability tasks over a chosen protocol.
//!
//! A workflow owns a named set of agents, picks a coordination protocol
//! (explicitly or through the registry by coordination mode), and
//! dispatches each required capability through that protocol — mesh nodes
//! execute distributed, the router fans out sub-tasks to hosted workers,
//! and consensus clusters vote before executing locally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use swarmlink_consensus::ConsensusProtocol;
use swarmlink_mesh::{ExecutionStrategy, MeshNetwork};
use swarmlink_protocol::{MessageBus, Protocol, ProtocolError, TaskExecutor};
use swarmlink_registry::{
    AdaptiveModeSelector, CoordinationType, ProtocolRegistry, SelectionContext,
};
use swarmlink_router::{TaskRouter, TaskWorker};

use crate::agent::Agent;

/// Workflow execution knobs.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Priority used for routed sub-tasks.
    pub priority: i64,
    /// Deadline for each coordinated dispatch.
    pub task_timeout: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            task_timeout: Duration::from_secs(30),
        }
    }
}

/// Executor dispatching to one agent (router workers).
struct AgentExecutor {
    agent: Arc<dyn Agent>,
}

#[async_trait]
impl TaskExecutor for AgentExecutor {
    async fn execute(
        &self,
        task: &str,
        _capability: &str,
        context: &Map<String, Value>,
    ) -> anyhow::Result<Value> {
        self.agent
            .execute(task, Some(Value::Object(context.clone())))
            .await
    }
}

/// Executor dispatching to whichever local agent serves the capability
/// (mesh coordinator).
struct AgentPoolExecutor {
    agents: Vec<Arc<dyn Agent>>,
}

#[async_trait]
impl TaskExecutor for AgentPoolExecutor {
    async fn execute(
        &self,
        task: &str,
        capability: &str,
        context: &Map<String, Value>,
    ) -> anyhow::Result<Value> {
        let agent = self
            .agents
            .iter()
            .find(|agent| agent.capabilities().iter().any(|cap| cap == capability))
            .ok_or_else(|| anyhow::anyhow!("no local agent serves capability '{capability}'"))?;
        agent
            .execute(task, Some(Value::Object(context.clone())))
            .await
    }
}

/// A workflow coordinating its agents through a protocol instance.
pub struct CoordinatedWorkflow {
    name: String,
    coordination_mode: CoordinationType,
    preferred_protocol: Option<String>,
    config: WorkflowConfig,
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    registry: Arc<ProtocolRegistry>,
    selector: Arc<AdaptiveModeSelector>,
    bus: Arc<MessageBus>,
    protocol: RwLock<Option<(String, Arc<dyn Protocol>)>>,
    workers: Mutex<Vec<Arc<TaskWorker>>>,
}

impl CoordinatedWorkflow {
    pub fn new(
        name: impl Into<String>,
        coordination_mode: CoordinationType,
        preferred_protocol: Option<String>,
        registry: Arc<ProtocolRegistry>,
        selector: Arc<AdaptiveModeSelector>,
        bus: Arc<MessageBus>,
    ) -> Self {
        Self {
            name: name.into(),
            coordination_mode,
            preferred_protocol,
            config: WorkflowConfig::default(),
            agents: RwLock::new(HashMap::new()),
            registry,
            selector,
            bus,
            protocol: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_agent(&self, agent: Arc<dyn Agent>) {
        self.agents
            .write()
            .insert(agent.name().to_string(), agent);
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// Name of the protocol in use, once initialized.
    pub fn protocol_name(&self) -> Option<String> {
        self.protocol.read().as_ref().map(|(name, _)| name.clone())
    }

    /// Choose, create, and start the coordination protocol, then register
    /// every local agent's capabilities with it.
    pub async fn initialize(&self) -> Result<(), ProtocolError> {
        if self.protocol.read().is_some() {
            return Ok(());
        }

        let protocol_name = self.preferred_protocol.clone().unwrap_or_else(|| {
            self.registry.select_protocol(self.coordination_mode, &[])
        });
        let node_id = format!("{}-coordinator", self.name);
        let protocol =
            self.registry
                .create_instance(&protocol_name, &node_id, self.bus.clone())?;
        protocol.start().await?;

        let agents: Vec<Arc<dyn Agent>> = self.agents.read().values().cloned().collect();
        for agent in &agents {
            for capability in agent.capabilities() {
                protocol.register_capability(&capability);
            }
        }

        if let Ok(mesh) = protocol.clone().as_any().downcast::<MeshNetwork>() {
            mesh.set_task_executor(Arc::new(AgentPoolExecutor {
                agents: agents.clone(),
            }));
        } else if let Ok(router) = protocol.clone().as_any().downcast::<TaskRouter>() {
            // Host one worker endpoint per agent so routed sub-tasks
            // execute against real agents.
            let mut workers = self.workers.lock();
            for agent in &agents {
                let worker = TaskWorker::new(
                    agent.name(),
                    self.bus.clone(),
                    Arc::new(AgentExecutor {
                        agent: agent.clone(),
                    }),
                );
                worker.start()?;
                router.register_worker(agent.name(), &agent.capabilities());
                workers.push(worker);
            }
        }

        info!(
            event = "workflow_initialized",
            workflow = %self.name,
            protocol = %protocol_name,
            agents = agents.len(),
            "workflow coordination ready"
        );
        *self.protocol.write() = Some((protocol_name, protocol));
        Ok(())
    }

    /// Execute a task across the required capabilities.
    ///
    /// `strategy` is a mesh dispatch strategy name or `"auto"`, which
    /// consults the adaptive selector.
    pub async fn execute_with_coordination(
        &self,
        task: &str,
        required_capabilities: &[String],
        strategy: &str,
    ) -> Result<Value, ProtocolError> {
        self.initialize().await?;
        let (protocol_name, protocol) = self
            .protocol
            .read()
            .clone()
            .ok_or(ProtocolError::NotRunning)?;

        let mesh_strategy = if strategy == "auto" {
            self.auto_strategy(task)
        } else {
            strategy
                .parse::<ExecutionStrategy>()
                .unwrap_or(ExecutionStrategy::RoundRobin)
        };

        let results = match protocol_name.as_str() {
            "mesh_network" => {
                let mesh = protocol
                    .clone()
                    .as_any()
                    .downcast::<MeshNetwork>()
                    .map_err(|_| ProtocolError::Internal("not a mesh instance".to_string()))?;
                self.execute_mesh(&mesh, task, required_capabilities, mesh_strategy)
                    .await
            }
            "task_router" => {
                let router = protocol
                    .clone()
                    .as_any()
                    .downcast::<TaskRouter>()
                    .map_err(|_| ProtocolError::Internal("not a router instance".to_string()))?;
                self.execute_centralized(&router, task, required_capabilities)
                    .await
            }
            "consensus" => {
                let consensus = protocol
                    .clone()
                    .as_any()
                    .downcast::<ConsensusProtocol>()
                    .map_err(|_| {
                        ProtocolError::Internal("not a consensus instance".to_string())
                    })?;
                self.execute_consensus(&consensus, task, required_capabilities)
                    .await?
            }
            other => {
                return Err(ProtocolError::Internal(format!(
                    "workflow cannot coordinate over protocol '{other}'"
                )));
            }
        };

        Ok(aggregate_results(results))
    }

    /// Map the selector's mode to a mesh dispatch strategy.
    fn auto_strategy(&self, task: &str) -> ExecutionStrategy {
        let complexity = (task.split_whitespace().count() as f64 / 100.0).min(1.0);
        let mode = self.selector.select_mode(&SelectionContext {
            task_complexity: complexity,
            agent_count: self.agent_count(),
            latency_requirement_ms: 1000.0,
            reliability_requirement: 0.95,
        });
        match mode {
            CoordinationType::Centralized => ExecutionStrategy::LeastBusy,
            CoordinationType::Decentralized => ExecutionStrategy::Random,
            CoordinationType::Hybrid => ExecutionStrategy::RoundRobin,
        }
    }

    async fn execute_mesh(
        &self,
        mesh: &MeshNetwork,
        task: &str,
        capabilities: &[String],
        strategy: ExecutionStrategy,
    ) -> Vec<Value> {
        let mut results = Vec::new();
        for capability in capabilities {
            match mesh
                .execute_distributed(task, capability, strategy, Some(self.config.task_timeout))
                .await
            {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(
                        event = "mesh_dispatch_failed",
                        workflow = %self.name,
                        capability = %capability,
                        error = %err,
                        "mesh execution failed"
                    );
                    results.push(json!({ "error": err.to_string() }));
                }
            }
        }
        results
    }

    async fn execute_centralized(
        &self,
        router: &TaskRouter,
        task: &str,
        capabilities: &[String],
    ) -> Vec<Value> {
        let mut results = Vec::new();
        for (index, capability) in capabilities.iter().enumerate() {
            let sub_task = format!("{task} (part {}: {capability})", index + 1);
            match router
                .route_task(
                    &sub_task,
                    capability,
                    self.config.priority,
                    Some(self.config.task_timeout),
                    Map::new(),
                )
                .await
            {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(
                        event = "routed_dispatch_failed",
                        workflow = %self.name,
                        capability = %capability,
                        error = %err,
                        "routed execution failed"
                    );
                    results.push(json!({ "error": err.to_string() }));
                }
            }
        }
        results
    }

    /// Propose the execution; on acceptance run the task locally.
    async fn execute_consensus(
        &self,
        consensus: &ConsensusProtocol,
        task: &str,
        capabilities: &[String],
    ) -> Result<Vec<Value>, ProtocolError> {
        let accepted = consensus
            .propose(
                json!({
                    "task": task,
                    "capabilities": capabilities,
                    "proposer": self.name,
                }),
                Some(self.config.task_timeout),
            )
            .await?;

        if !accepted {
            return Ok(vec![json!({ "error": "consensus rejected task execution" })]);
        }

        let agents: Vec<Arc<dyn Agent>> = self.agents.read().values().cloned().collect();
        let mut results = Vec::new();
        for capability in capabilities {
            let agent = agents
                .iter()
                .find(|agent| agent.capabilities().iter().any(|cap| cap == capability));
            match agent {
                Some(agent) => match agent.execute(task, None).await {
                    Ok(result) => results.push(result),
                    Err(err) => results.push(json!({ "error": err.to_string() })),
                },
                None => results.push(json!({
                    "error": format!("no local agent serves capability '{capability}'")
                })),
            }
        }
        Ok(results)
    }

    /// Protocol network view, protocol name, and selector statistics.
    pub fn coordination_status(&self) -> Value {
        let protocol = self.protocol.read().clone();
        match protocol {
            Some((name, protocol)) => json!({
                "protocol": name,
                "coordination_mode": self.coordination_mode.as_str(),
                "network_status": serde_json::to_value(protocol.network_status())
                    .unwrap_or(Value::Null),
                "mode_stats": serde_json::to_value(self.selector.mode_stats())
                    .unwrap_or(Value::Null),
            }),
            None => json!({ "status": "not_initialized" }),
        }
    }

    /// Stop the protocol and every hosted worker; pending waits resolve
    /// with a shutdown error.
    pub async fn cleanup(&self) -> Result<(), ProtocolError> {
        let protocol = self.protocol.write().take();
        if let Some((_, protocol)) = protocol {
            protocol.stop().await?;
        }
        for worker in self.workers.lock().drain(..) {
            worker.stop();
        }
        info!(event = "workflow_cleaned", workflow = %self.name, "workflow torn down");
        Ok(())
    }
}

/// Collapse per-capability results: single results pass through raw,
/// multiple results are wrapped with success accounting.
fn aggregate_results(mut results: Vec<Value>) -> Value {
    match results.len() {
        0 => Value::Null,
        1 => results.remove(0),
        _ => {
            let success_count = results
                .iter()
                .filter(|result| result.get("error").is_none())
                .count();
            json!({
                "results": results,
                "success_count": success_count,
                "total_count": results.len() as u64,
            })
        }
    }
}
