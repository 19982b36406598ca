//! Process-wide protocol catalog and instance book-keeping.
//!
//! The registry maps protocol names to constructors plus metadata and
//! tracks live instances by weak reference — callers own their protocols,
//! the registry only looks them up and can stop them all on shutdown.
//! Built in explicitly at program entry and passed around as `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use swarmlink_consensus::{ConsensusProtocol, ConsensusType};
use swarmlink_mesh::MeshNetwork;
use swarmlink_protocol::{MessageBus, Protocol, ProtocolError};
use swarmlink_router::TaskRouter;

/// Coordination style a protocol provides; doubles as the selector's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationType {
    Centralized,
    Decentralized,
    Hybrid,
}

impl CoordinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Centralized => "centralized",
            Self::Decentralized => "decentralized",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for CoordinationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry-visible protocol metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMetadata {
    pub description: String,
    pub coordination_type: CoordinationType,
    pub features: Vec<String>,
}

/// Builds a protocol instance for a node id on a transport.
pub type ProtocolConstructor =
    Arc<dyn Fn(&str, Arc<MessageBus>) -> Arc<dyn Protocol> + Send + Sync>;

struct RegisteredProtocol {
    constructor: ProtocolConstructor,
    metadata: ProtocolMetadata,
}

/// Registry statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_protocols: usize,
    pub live_instances: usize,
    pub instances_by_protocol: BTreeMap<String, usize>,
}

/// Catalog of protocol constructors and live instances.
pub struct ProtocolRegistry {
    protocols: RwLock<HashMap<String, RegisteredProtocol>>,
    instances: DashMap<String, Weak<dyn Protocol>>,
}

impl ProtocolRegistry {
    /// Empty registry with no known protocols.
    pub fn new() -> Self {
        Self {
            protocols: RwLock::new(HashMap::new()),
            instances: DashMap::new(),
        }
    }

    /// Registry preloaded with the built-in protocols.
    pub fn with_builtins() -> Self {
        let registry = Self::new();

        registry
            .register_protocol(
                "task_router",
                Arc::new(|node_id, bus| TaskRouter::new(node_id, bus) as Arc<dyn Protocol>),
                ProtocolMetadata {
                    description: "Centralized task routing with load balancing".to_string(),
                    coordination_type: CoordinationType::Centralized,
                    features: vec![
                        "load_balancing".to_string(),
                        "priority_queue".to_string(),
                        "failover".to_string(),
                    ],
                },
            )
            .expect("builtin registration");

        registry
            .register_protocol(
                "consensus",
                Arc::new(|node_id, bus| {
                    ConsensusProtocol::new(node_id, bus, ConsensusType::SimpleMajority)
                        as Arc<dyn Protocol>
                }),
                ProtocolMetadata {
                    description: "Decentralized consensus protocol".to_string(),
                    coordination_type: CoordinationType::Decentralized,
                    features: vec![
                        "byzantine_tolerance".to_string(),
                        "leader_election".to_string(),
                        "voting".to_string(),
                    ],
                },
            )
            .expect("builtin registration");

        registry
            .register_protocol(
                "mesh_network",
                Arc::new(|node_id, bus| MeshNetwork::new(node_id, bus) as Arc<dyn Protocol>),
                ProtocolMetadata {
                    description: "Self-organizing mesh network".to_string(),
                    coordination_type: CoordinationType::Hybrid,
                    features: vec![
                        "auto_discovery".to_string(),
                        "fault_tolerance".to_string(),
                        "routing".to_string(),
                    ],
                },
            )
            .expect("builtin registration");

        registry
    }

    /// Register a protocol constructor under a unique name.
    pub fn register_protocol(
        &self,
        name: &str,
        constructor: ProtocolConstructor,
        metadata: ProtocolMetadata,
    ) -> Result<(), ProtocolError> {
        let mut protocols = self.protocols.write();
        if protocols.contains_key(name) {
            return Err(ProtocolError::Internal(format!(
                "protocol '{name}' already registered"
            )));
        }
        protocols.insert(
            name.to_string(),
            RegisteredProtocol {
                constructor,
                metadata,
            },
        );
        info!(event = "protocol_registered", protocol = name, "protocol registered");
        Ok(())
    }

    /// Remove a protocol and stop its live instances.
    pub async fn unregister_protocol(&self, name: &str) -> Result<(), ProtocolError> {
        if self.protocols.write().remove(name).is_none() {
            return Err(ProtocolError::UnknownProtocol {
                name: name.to_string(),
            });
        }

        let prefix = format!("{name}:");
        let doomed: Vec<(String, Arc<dyn Protocol>)> = self
            .instances
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .filter_map(|entry| entry.value().upgrade().map(|live| (entry.key().clone(), live)))
            .collect();
        for (key, instance) in doomed {
            if let Err(err) = instance.stop().await {
                warn!(
                    event = "instance_stop_failed",
                    protocol = name,
                    instance = %key,
                    error = %err,
                    "instance refused to stop"
                );
            }
            self.instances.remove(&key);
        }
        self.instances.retain(|key, _| !key.starts_with(&prefix));

        info!(event = "protocol_unregistered", protocol = name, "protocol unregistered");
        Ok(())
    }

    /// Build an instance of a registered protocol.
    ///
    /// The caller owns the returned `Arc`; the registry keeps only a weak
    /// reference for lookup and shutdown.
    pub fn create_instance(
        &self,
        protocol_name: &str,
        node_id: &str,
        bus: Arc<MessageBus>,
    ) -> Result<Arc<dyn Protocol>, ProtocolError> {
        let constructor = {
            let protocols = self.protocols.read();
            let registered =
                protocols
                    .get(protocol_name)
                    .ok_or_else(|| ProtocolError::UnknownProtocol {
                        name: protocol_name.to_string(),
                    })?;
            Arc::clone(&registered.constructor)
        };

        let instance = constructor(node_id, bus);
        let key = format!("{protocol_name}:{node_id}");
        self.instances.insert(key, Arc::downgrade(&instance));
        info!(
            event = "instance_created",
            protocol = protocol_name,
            node = node_id,
            "protocol instance created"
        );
        Ok(instance)
    }

    /// Look up a live instance, pruning the entry if it has died.
    pub fn get_instance(&self, protocol_name: &str, node_id: &str) -> Option<Arc<dyn Protocol>> {
        let key = format!("{protocol_name}:{node_id}");
        let upgraded = self.instances.get(&key).and_then(|weak| weak.upgrade());
        if upgraded.is_none() {
            self.instances.remove(&key);
        }
        upgraded
    }

    /// Names of every registered protocol, sorted.
    pub fn list_protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.protocols.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Metadata for a registered protocol.
    pub fn protocol_info(&self, name: &str) -> Result<ProtocolMetadata, ProtocolError> {
        self.protocols
            .read()
            .get(name)
            .map(|registered| registered.metadata.clone())
            .ok_or_else(|| ProtocolError::UnknownProtocol {
                name: name.to_string(),
            })
    }

    /// All live instances, pruning dead entries.
    pub fn list_instances(&self) -> Vec<(String, Arc<dyn Protocol>)> {
        let mut live = Vec::new();
        let mut dead = Vec::new();
        for entry in self.instances.iter() {
            match entry.value().upgrade() {
                Some(instance) => live.push((entry.key().clone(), instance)),
                None => dead.push(entry.key().clone()),
            }
        }
        for key in dead {
            self.instances.remove(&key);
        }
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    /// Pick a protocol satisfying a coordination type and feature set;
    /// falls back to the mesh.
    pub fn select_protocol(
        &self,
        coordination_type: CoordinationType,
        features: &[String],
    ) -> String {
        let protocols = self.protocols.read();
        let mut candidates: Vec<&String> = protocols
            .iter()
            .filter(|(_, registered)| registered.metadata.coordination_type == coordination_type)
            .filter(|(_, registered)| {
                features
                    .iter()
                    .all(|feature| registered.metadata.features.contains(feature))
            })
            .map(|(name, _)| name)
            .collect();
        candidates.sort();
        candidates
            .first()
            .map(|name| name.to_string())
            .unwrap_or_else(|| "mesh_network".to_string())
    }

    /// Stop every live instance concurrently and clear the table.
    pub async fn stop_all_instances(&self) {
        let live: Vec<Arc<dyn Protocol>> = self
            .instances
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        let outcomes = join_all(live.iter().map(|instance| instance.stop())).await;
        for outcome in outcomes {
            if let Err(err) = outcome {
                warn!(event = "instance_stop_failed", error = %err, "instance refused to stop");
            }
        }
        self.instances.clear();
        info!(event = "registry_drained", "all protocol instances stopped");
    }

    /// Counts of registered protocols and live instances.
    pub fn statistics(&self) -> RegistryStats {
        let mut by_protocol: BTreeMap<String, usize> = BTreeMap::new();
        let mut live_instances = 0;
        for entry in self.instances.iter() {
            if entry.value().upgrade().is_some() {
                live_instances += 1;
                let protocol = entry
                    .key()
                    .split_once(':')
                    .map(|(name, _)| name.to_string())
                    .unwrap_or_else(|| entry.key().clone());
                *by_protocol.entry(protocol).or_default() += 1;
            }
        }
        RegistryStats {
            total_protocols: self.protocols.read().len(),
            live_instances,
            instances_by_protocol: by_protocol,
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
