//! The agent contract the workflow layer coordinates.

use async_trait::async_trait;
use serde_json::Value;

/// An external unit of work: advertises capabilities, executes tasks.
///
/// The workflow layer never inspects an agent beyond this surface.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Vec<String>;

    /// Run a task, optionally with structured context. May suspend.
    async fn execute(&self, task: &str, context: Option<Value>) -> anyhow::Result<Value>;
}
