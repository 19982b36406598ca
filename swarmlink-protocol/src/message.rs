//! Message envelope shared by every coordination protocol.
//!
//! A message is immutable once handed to the transport. Transport-level
//! bookkeeping (ttl, seen-list, route trail) lives in the `metadata` map so
//! the envelope itself stays a flat, exactly round-trippable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Metadata key carrying the remaining hop budget of a broadcast.
pub const META_TTL: &str = "ttl";
/// Metadata key carrying the list of node ids that already saw a broadcast.
pub const META_SEEN: &str = "seen";
/// Metadata key carrying the trail of node ids a routed message traversed.
pub const META_ROUTE: &str = "route";

/// Types of protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Heartbeat,
    Discovery,
    Task,
    Result,
    Coordination,
    Consensus,
    Error,
    Status,
    Request,
    Response,
    Broadcast,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Heartbeat => "heartbeat",
            Self::Discovery => "discovery",
            Self::Task => "task",
            Self::Result => "result",
            Self::Coordination => "coordination",
            Self::Consensus => "consensus",
            Self::Error => "error",
            Self::Status => "status",
            Self::Request => "request",
            Self::Response => "response",
            Self::Broadcast => "broadcast",
        };
        f.write_str(name)
    }
}

/// Envelope exchanged between protocol nodes.
///
/// Serialized form is the flat record
/// `{id, type, sender, target, content, timestamp, metadata}`; a
/// serialize/deserialize round trip preserves every field exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Unique identifier, used for duplicate suppression on relays.
    pub id: Uuid,
    /// Message type, dispatched to the matching registered handler.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Node id of the originator.
    pub sender: String,
    /// Destination node id; `None` signals broadcast intent.
    pub target: Option<String>,
    /// Structured payload.
    pub content: Map<String, Value>,
    /// Wall-clock creation time.
    pub timestamp: DateTime<Utc>,
    /// Transport bookkeeping (ttl, seen-list, route trail).
    pub metadata: Map<String, Value>,
}

impl ProtocolMessage {
    /// Create a broadcast-intent message with an empty payload.
    pub fn new(kind: MessageType, sender: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sender: sender.into(),
            target: None,
            content: Map::new(),
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Set the destination node.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Replace the payload with the fields of a JSON object.
    ///
    /// Non-object values are stored under a `"value"` key so the payload
    /// stays a map.
    pub fn with_content(mut self, content: Value) -> Self {
        self.content = match content {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self
    }

    /// Insert a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.content.insert(key.into(), value);
        self
    }

    /// Remaining hop budget, if the transport stamped one.
    pub fn ttl(&self) -> Option<i64> {
        self.metadata.get(META_TTL).and_then(Value::as_i64)
    }

    /// Stamp the hop budget.
    pub fn set_ttl(&mut self, ttl: i64) {
        self.metadata.insert(META_TTL.to_string(), Value::from(ttl));
    }

    /// Node ids that have already seen this broadcast.
    pub fn seen(&self) -> Vec<String> {
        self.metadata
            .get(META_SEEN)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `node_id` is on the seen-list.
    pub fn seen_by(&self, node_id: &str) -> bool {
        self.seen().iter().any(|id| id == node_id)
    }

    /// Append `node_id` to the seen-list (no-op when already present).
    pub fn mark_seen(&mut self, node_id: &str) {
        let entry = self
            .metadata
            .entry(META_SEEN.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(ids) = entry {
            if !ids.iter().any(|id| id.as_str() == Some(node_id)) {
                ids.push(Value::from(node_id));
            }
        }
    }

    /// The trail of node ids this message traversed so far.
    pub fn route_trail(&self) -> Vec<String> {
        self.metadata
            .get(META_ROUTE)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Append a hop to the route trail.
    pub fn push_route_hop(&mut self, node_id: &str) {
        let entry = self
            .metadata
            .entry(META_ROUTE.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(ids) = entry {
            ids.push(Value::from(node_id));
        }
    }

    /// Convenience accessor for a string payload field.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}
