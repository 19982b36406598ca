//! Task-execution contract plugged into protocols.
//!
//! Worker endpoints and mesh nodes execute routed tasks through an
//! executor; replies are sent explicitly by the hosting protocol, so the
//! executor only produces a result value or an error.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

/// Executes a task on behalf of the hosting node.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &str,
        capability: &str,
        context: &Map<String, Value>,
    ) -> anyhow::Result<Value>;
}

/// Default executor: acknowledges the task, identifying the executing node.
pub struct EchoExecutor {
    node_id: String,
}

impl EchoExecutor {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(
        &self,
        task: &str,
        _capability: &str,
        _context: &Map<String, Value>,
    ) -> anyhow::Result<Value> {
        Ok(json!(format!("task '{}' executed by {}", task, self.node_id)))
    }
}
