//! Worker endpoint for the centralized router.
//!
//! A `TaskWorker` attaches to the bus under its own node id, executes
//! incoming `task` messages through a pluggable executor, and answers with
//! `result` messages. Registration with the router (capabilities, stats)
//! happens separately via `TaskRouter::register_worker`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use swarmlink_protocol::{MessageBus, MessageType, ProtocolError, ProtocolMessage, TaskExecutor};

/// Bus endpoint that executes routed tasks.
pub struct TaskWorker {
    node_id: String,
    bus: Arc<MessageBus>,
    executor: Arc<dyn TaskExecutor>,
    running: AtomicBool,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl TaskWorker {
    pub fn new(
        node_id: impl Into<String>,
        bus: Arc<MessageBus>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            bus,
            executor,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Attach to the bus and begin serving tasks.
    pub fn start(&self) -> Result<(), ProtocolError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyRunning);
        }
        let mut receiver = self.bus.attach(&self.node_id);
        let token = CancellationToken::new();
        *self.shutdown.lock() = Some(token.clone());

        let node_id = self.node_id.clone();
        let bus = Arc::clone(&self.bus);
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = receiver.recv() => {
                        match message {
                            Some(message) if message.kind == MessageType::Task => {
                                serve_task(&node_id, &bus, executor.as_ref(), message).await;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });

        info!(event = "worker_started", node = %self.node_id, "task worker started");
        Ok(())
    }

    /// Detach from the bus. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.shutdown.lock().take() {
            token.cancel();
        }
        self.bus.detach(&self.node_id);
        info!(event = "worker_stopped", node = %self.node_id, "task worker stopped");
    }
}

async fn serve_task(
    node_id: &str,
    bus: &MessageBus,
    executor: &dyn TaskExecutor,
    message: ProtocolMessage,
) {
    let task_id = message.content_str("task_id").unwrap_or_default().to_string();
    let task_name = message
        .content_str("task_name")
        .unwrap_or_default()
        .to_string();
    let capability = message
        .content_str("capability")
        .unwrap_or_default()
        .to_string();

    let outcome = executor
        .execute(&task_name, &capability, &message.content)
        .await;

    let mut reply = ProtocolMessage::new(MessageType::Result, node_id)
        .with_target(&message.sender)
        .with_field("task_id", json!(task_id));
    reply = match outcome {
        Ok(result) => reply
            .with_field("success", json!(true))
            .with_field("result", result),
        Err(err) => reply
            .with_field("success", json!(false))
            .with_field("error", json!(err.to_string())),
    };

    if let Err(err) = bus.deliver(&message.sender, reply) {
        warn!(
            event = "result_undeliverable",
            node = node_id,
            peer = %message.sender,
            task_id = %task_id,
            error = %err,
            "could not deliver task result"
        );
    }
}
