//! Node records kept in each protocol instance's directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Status of a protocol node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Idle,
    Busy,
    Offline,
    Error,
}

impl NodeStatus {
    /// Parse the wire spelling; unknown strings fall back to `Active`,
    /// matching how heartbeat payloads are interpreted.
    pub fn parse_or_active(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "idle" => Self::Idle,
            "busy" => Self::Busy,
            "offline" => Self::Offline,
            "error" => Self::Error,
            _ => Self::Active,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant in a protocol's network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    /// Ordered capability tags; duplicates are ignored on insert.
    pub capabilities: Vec<String>,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

impl NodeRecord {
    pub fn new(node_id: impl Into<String>, status: NodeStatus) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities: Vec::new(),
            status,
            last_heartbeat: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|cap| cap == capability)
    }

    /// Add a capability tag, ignoring duplicates.
    pub fn add_capability(&mut self, capability: &str) {
        if !self.has_capability(capability) {
            self.capabilities.push(capability.to_string());
        }
    }

    pub fn remove_capability(&mut self, capability: &str) {
        self.capabilities.retain(|cap| cap != capability);
    }
}

/// Point-in-time summary of a protocol's view of the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub node_id: String,
    pub total_nodes: usize,
    /// Count of active peers plus self.
    pub active_nodes: usize,
    /// Union of every known node's capabilities, sorted.
    pub capabilities: Vec<String>,
    pub status: NodeStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_insert_is_idempotent() {
        let mut node = NodeRecord::new("n1", NodeStatus::Active);
        node.add_capability("analysis");
        node.add_capability("analysis");
        node.add_capability("search");
        assert_eq!(node.capabilities, vec!["analysis", "search"]);

        node.remove_capability("analysis");
        assert_eq!(node.capabilities, vec!["search"]);
        node.remove_capability("missing");
        assert_eq!(node.capabilities, vec!["search"]);
    }

    #[test]
    fn status_parsing_defaults_to_active() {
        assert_eq!(NodeStatus::parse_or_active("busy"), NodeStatus::Busy);
        assert_eq!(NodeStatus::parse_or_active("bogus"), NodeStatus::Active);
        assert_eq!(NodeStatus::Offline.to_string(), "offline");
    }
}
