//! Centralized task router.
//!
//! One coordinator node owns per-capability priority queues, a worker
//! registry with running statistics, and the pending-result table. Workers
//! are bus endpoints that receive `task` messages and answer with `result`
//! messages. The scheduler loop matches queued tasks to the best-scoring
//! eligible worker; the monitor loop fails overdue tasks and retires old
//! terminal ones.

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use swarmlink_protocol::{
    HandlerFn, MessageBus, MessageType, NetworkStatus, NodeRecord, NodeStatus, Protocol,
    ProtocolCore, ProtocolError, ProtocolMessage,
};

use crate::task::{RouterConfig, RouterStats, Task, TaskStatus, WorkerStats, WorkerStatsSnapshot};

pub const PROTOCOL_NAME: &str = "task_router";

/// Queue entry ordered by priority (desc), then arrival (asc).
#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    priority: i64,
    seq: u64,
    task_id: Uuid,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

type ResultSender = oneshot::Sender<Result<Value, ProtocolError>>;

struct RouterInner {
    core: Arc<ProtocolCore>,
    config: RouterConfig,
    tasks: DashMap<Uuid, Task>,
    queues: Mutex<HashMap<String, BinaryHeap<QueueEntry>>>,
    arrival_seq: AtomicU64,
    waiters: DashMap<Uuid, ResultSender>,
    workers: DashMap<String, WorkerStats>,
    capability_workers: RwLock<HashMap<String, std::collections::BTreeSet<String>>>,
}

/// Centralized priority/capability task router.
pub struct TaskRouter {
    inner: Arc<RouterInner>,
}

impl TaskRouter {
    pub fn new(node_id: impl Into<String>, bus: Arc<MessageBus>) -> Arc<Self> {
        Self::with_config(node_id, bus, RouterConfig::default())
    }

    pub fn with_config(
        node_id: impl Into<String>,
        bus: Arc<MessageBus>,
        config: RouterConfig,
    ) -> Arc<Self> {
        let core = ProtocolCore::new(node_id, PROTOCOL_NAME, bus);
        let inner = Arc::new(RouterInner {
            core,
            config,
            tasks: DashMap::new(),
            queues: Mutex::new(HashMap::new()),
            arrival_seq: AtomicU64::new(0),
            waiters: DashMap::new(),
            workers: DashMap::new(),
            capability_workers: RwLock::new(HashMap::new()),
        });
        RouterInner::register_handlers(&inner);
        Arc::new(Self { inner })
    }

    /// Queue a task and wait for its result.
    ///
    /// On deadline the task is marked failed and `TaskTimeout` is returned.
    pub async fn route_task(
        &self,
        name: &str,
        capability: &str,
        priority: i64,
        timeout: Option<Duration>,
        metadata: Map<String, Value>,
    ) -> Result<Value, ProtocolError> {
        let inner = &self.inner;
        if !inner.core.is_running() {
            return Err(ProtocolError::NotRunning);
        }

        let task = Task::new(name, capability, priority, metadata);
        let task_id = task.id;
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(task_id, tx);
        inner.tasks.insert(task_id, task);
        inner.enqueue(capability, priority, task_id);

        info!(
            event = "task_queued",
            protocol = PROTOCOL_NAME,
            node = inner.core.node_id(),
            task_id = %task_id,
            capability,
            priority,
            "task queued"
        );

        let deadline = timeout.unwrap_or(inner.config.task_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an outcome: the router stopped.
            Ok(Err(_)) => Err(ProtocolError::ShuttingDown),
            Err(_) => {
                inner.waiters.remove(&task_id);
                inner.fail_task(task_id, "task timed out");
                Err(ProtocolError::timeout(format!("task {task_id} timed out")))
            }
        }
    }

    /// Register a worker and the capabilities it serves.
    pub fn register_worker(&self, worker_id: &str, capabilities: &[String]) {
        let inner = &self.inner;
        inner
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerStats::new(worker_id, inner.config.default_max_concurrent));

        {
            let mut map = inner.capability_workers.write();
            for capability in capabilities {
                map.entry(capability.clone())
                    .or_default()
                    .insert(worker_id.to_string());
            }
        }

        match inner.core.nodes().get_mut(worker_id) {
            Some(mut record) => {
                record.capabilities = capabilities.to_vec();
                if record.status == NodeStatus::Offline {
                    record.status = NodeStatus::Idle;
                }
            }
            None => {
                let mut record = NodeRecord::new(worker_id, NodeStatus::Idle);
                record.capabilities = capabilities.to_vec();
                inner.core.nodes().insert(worker_id.to_string(), record);
            }
        }

        info!(
            event = "worker_registered",
            protocol = PROTOCOL_NAME,
            node = inner.core.node_id(),
            peer = worker_id,
            capabilities = ?capabilities,
            "worker registered"
        );
    }

    /// Remove a worker; its in-flight tasks go back on the queue.
    pub fn unregister_worker(&self, worker_id: &str) {
        self.inner.unregister_worker(worker_id);
    }

    /// Router-wide statistics snapshot.
    pub fn stats(&self) -> RouterStats {
        let inner = &self.inner;
        let mut pending = 0;
        let mut executing = 0;
        let mut completed = 0;
        let mut failed = 0;
        for task in inner.tasks.iter() {
            match task.status {
                TaskStatus::Pending | TaskStatus::Assigned => pending += 1,
                TaskStatus::Executing => executing += 1,
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
            }
        }

        let queues = inner
            .queues
            .lock()
            .iter()
            .map(|(capability, queue)| (capability.clone(), queue.len()))
            .collect();
        let workers = inner
            .workers
            .iter()
            .map(|entry| (entry.key().clone(), WorkerStatsSnapshot::from(entry.value())))
            .collect();

        RouterStats {
            total_tasks: inner.tasks.len(),
            pending_tasks: pending,
            executing_tasks: executing,
            completed_tasks: completed,
            failed_tasks: failed,
            queues,
            workers,
        }
    }

    /// Statistics for one worker.
    pub fn worker_stats(&self, worker_id: &str) -> Option<WorkerStats> {
        self.inner.workers.get(worker_id).map(|entry| entry.clone())
    }

    /// Current status of one task.
    pub fn task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.inner.tasks.get(&task_id).map(|task| task.status)
    }
}

impl RouterInner {
    fn register_handlers(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        inner
            .core
            .register_handler(MessageType::Result, result_handler(weak.clone()));
        inner
            .core
            .register_handler(MessageType::Status, status_handler(weak.clone()));
        inner
            .core
            .register_handler(MessageType::Task, task_request_handler(weak));
    }

    fn enqueue(&self, capability: &str, priority: i64, task_id: Uuid) {
        let seq = self.arrival_seq.fetch_add(1, Ordering::Relaxed);
        self.queues
            .lock()
            .entry(capability.to_string())
            .or_default()
            .push(QueueEntry {
                priority,
                seq,
                task_id,
            });
    }

    /// Workers serving a capability that are online and under their load cap.
    fn available_workers(&self, capability: &str) -> Vec<String> {
        let members = match self.capability_workers.read().get(capability) {
            Some(members) => members.iter().cloned().collect::<Vec<_>>(),
            None => return Vec::new(),
        };

        members
            .into_iter()
            .filter(|worker_id| {
                let online = self
                    .core
                    .node(worker_id)
                    .map(|record| record.status != NodeStatus::Offline)
                    .unwrap_or(false);
                if !online {
                    return false;
                }
                self.workers
                    .get(worker_id)
                    .map(|stats| stats.can_accept_task())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Highest scoring eligible worker; lexicographic id breaks ties.
    fn select_worker(&self, eligible: &[String]) -> Option<String> {
        let mut best: Option<(f64, &String)> = None;
        for worker_id in eligible {
            let score = self
                .workers
                .get(worker_id)
                .map(|stats| stats.score())
                .unwrap_or(0.0);
            let better = match best {
                None => true,
                Some((best_score, _)) => score > best_score,
            };
            if better {
                best = Some((score, worker_id));
            }
        }
        best.map(|(_, worker_id)| worker_id.clone())
    }

    /// One scheduler pass: drain each capability queue into eligible workers.
    fn schedule_once(&self) {
        let capabilities: Vec<String> = self.queues.lock().keys().cloned().collect();

        for capability in capabilities {
            loop {
                let eligible = self.available_workers(&capability);
                if eligible.is_empty() {
                    break;
                }
                let entry = {
                    let mut queues = self.queues.lock();
                    queues.get_mut(&capability).and_then(|queue| queue.pop())
                };
                let Some(entry) = entry else { break };

                let still_pending = self
                    .tasks
                    .get(&entry.task_id)
                    .map(|task| task.status == TaskStatus::Pending)
                    .unwrap_or(false);
                if !still_pending {
                    continue;
                }

                let Some(worker_id) = self.select_worker(&eligible) else {
                    break;
                };
                self.assign_task(entry.task_id, &worker_id);
            }
        }
    }

    fn assign_task(&self, task_id: Uuid, worker_id: &str) {
        let message = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            task.assigned_to = Some(worker_id.to_string());
            task.status = TaskStatus::Assigned;

            let mut message = ProtocolMessage::new(MessageType::Task, self.core.node_id())
                .with_target(worker_id)
                .with_field("task_id", json!(task_id))
                .with_field("task_name", json!(task.name))
                .with_field("capability", json!(task.capability));
            for (key, value) in &task.metadata {
                message.content.insert(key.clone(), value.clone());
            }
            message
        };

        if let Some(mut stats) = self.workers.get_mut(worker_id) {
            stats.current_load += 1;
        }

        match self.core.send_direct(worker_id, message) {
            Ok(()) => {
                if let Some(mut task) = self.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Executing;
                }
                info!(
                    event = "task_assigned",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    task_id = %task_id,
                    peer = worker_id,
                    "task dispatched to worker"
                );
            }
            Err(err) => {
                // The worker endpoint is gone; put the task back and drop
                // the worker from rotation.
                warn!(
                    event = "task_dispatch_failed",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    task_id = %task_id,
                    peer = worker_id,
                    error = %err,
                    "worker unreachable, re-queueing task"
                );
                if let Some(mut stats) = self.workers.get_mut(worker_id) {
                    stats.current_load = stats.current_load.saturating_sub(1);
                }
                self.core.set_status(worker_id, NodeStatus::Offline);
                let requeue = {
                    let mut task = match self.tasks.get_mut(&task_id) {
                        Some(task) => task,
                        None => return,
                    };
                    task.assigned_to = None;
                    task.status = TaskStatus::Pending;
                    (task.capability.clone(), task.priority)
                };
                self.enqueue(&requeue.0, requeue.1, task_id);
            }
        }
    }

    /// One monitor pass: fail overdue tasks, retire old terminal ones.
    fn monitor_once(&self) {
        let now = Utc::now();

        let overdue: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Executing)
            .filter(|task| {
                (now - task.created_at).to_std().unwrap_or(Duration::ZERO) > self.config.task_timeout
            })
            .map(|task| task.id)
            .collect();

        for task_id in overdue {
            warn!(
                event = "task_timeout",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                task_id = %task_id,
                "task exceeded execution timeout"
            );
            self.fail_task(task_id, "execution timeout");
            if let Some((_, waiter)) = self.waiters.remove(&task_id) {
                let _ = waiter.send(Err(ProtocolError::timeout("execution timeout")));
            }
        }

        let retention = self.config.task_retention;
        let stale: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|task| task.status.is_terminal())
            .filter(|task| (now - task.created_at).to_std().unwrap_or(Duration::ZERO) > retention)
            .map(|task| task.id)
            .collect();
        for task_id in stale {
            self.tasks.remove(&task_id);
            self.waiters.remove(&task_id);
        }
    }

    /// Mark a task failed and settle the assigned worker's stats.
    fn fail_task(&self, task_id: Uuid, reason: &str) {
        let assigned = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if task.status.is_terminal() {
                return;
            }
            let assigned = if task.status == TaskStatus::Executing
                || task.status == TaskStatus::Assigned
            {
                task.assigned_to.clone()
            } else {
                None
            };
            task.status = TaskStatus::Failed;
            task.error = Some(reason.to_string());
            assigned
        };
        if let Some(worker_id) = assigned {
            if let Some(mut stats) = self.workers.get_mut(&worker_id) {
                stats.tasks_failed += 1;
                stats.current_load = stats.current_load.saturating_sub(1);
            }
        }
    }

    /// Apply an incoming result message to the task and worker tables.
    fn apply_result(&self, message: &ProtocolMessage) {
        let Some(task_id) = message
            .content_str("task_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
        else {
            warn!(
                event = "result_malformed",
                protocol = PROTOCOL_NAME,
                node = self.core.node_id(),
                peer = %message.sender,
                "result message without task id"
            );
            return;
        };

        let success = message
            .content
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let result = message.content.get("result").cloned();
        let error = message.content_str("error").map(str::to_string);

        let (assigned, elapsed) = {
            let Some(mut task) = self.tasks.get_mut(&task_id) else {
                warn!(
                    event = "result_unknown_task",
                    protocol = PROTOCOL_NAME,
                    node = self.core.node_id(),
                    task_id = %task_id,
                    "result for unknown task"
                );
                return;
            };
            if task.status.is_terminal() {
                return;
            }
            task.status = if success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            task.result = result.clone();
            task.error = error.clone();
            let elapsed = (Utc::now() - task.created_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            (task.assigned_to.clone(), elapsed)
        };

        if let Some(worker_id) = assigned {
            if let Some(mut stats) = self.workers.get_mut(&worker_id) {
                stats.current_load = stats.current_load.saturating_sub(1);
                if success {
                    stats.tasks_completed += 1;
                } else {
                    stats.tasks_failed += 1;
                }
                stats.total_execution += elapsed;
            }
        }

        if let Some((_, waiter)) = self.waiters.remove(&task_id) {
            let outcome = if success {
                Ok(result.unwrap_or(Value::Null))
            } else {
                Err(ProtocolError::failed(
                    error.unwrap_or_else(|| "task failed".to_string()),
                ))
            };
            let _ = waiter.send(outcome);
        }
    }

    fn unregister_worker(&self, worker_id: &str) {
        {
            let mut map = self.capability_workers.write();
            for members in map.values_mut() {
                members.remove(worker_id);
            }
        }
        self.core.set_status(worker_id, NodeStatus::Offline);

        // Revert this worker's in-flight tasks to pending, exactly once each.
        let in_flight: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|task| {
                task.assigned_to.as_deref() == Some(worker_id)
                    && matches!(task.status, TaskStatus::Assigned | TaskStatus::Executing)
            })
            .map(|task| task.id)
            .collect();

        let mut requeues = Vec::new();
        for task_id in &in_flight {
            let Some(mut task) = self.tasks.get_mut(task_id) else {
                continue;
            };
            task.assigned_to = None;
            task.retries += 1;
            if task.retries > self.config.max_retries {
                task.status = TaskStatus::Failed;
                task.error = Some("worker lost, retry budget exhausted".to_string());
                if let Some((_, waiter)) = self.waiters.remove(task_id) {
                    let _ = waiter.send(Err(ProtocolError::failed(
                        "worker lost, retry budget exhausted",
                    )));
                }
            } else {
                task.status = TaskStatus::Pending;
                requeues.push((task.capability.clone(), task.priority, *task_id));
            }
        }
        for (capability, priority, task_id) in requeues {
            self.enqueue(&capability, priority, task_id);
        }

        if let Some(mut stats) = self.workers.get_mut(worker_id) {
            stats.current_load = stats
                .current_load
                .saturating_sub(in_flight.len() as u32);
        }

        info!(
            event = "worker_unregistered",
            protocol = PROTOCOL_NAME,
            node = self.core.node_id(),
            peer = worker_id,
            reverted = in_flight.len(),
            "worker unregistered"
        );
    }

    fn release_waiters(&self) {
        let task_ids: Vec<Uuid> = self.waiters.iter().map(|entry| *entry.key()).collect();
        for task_id in task_ids {
            if let Some((_, waiter)) = self.waiters.remove(&task_id) {
                let _ = waiter.send(Err(ProtocolError::ShuttingDown));
            }
        }
    }

    fn spawn_scheduler(inner: &Arc<Self>, token: CancellationToken) {
        let weak = Arc::downgrade(inner);
        let interval = inner.config.scheduler_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            inner.schedule_once();
                        }));
                        if pass.is_err() {
                            error!(
                                event = "scheduler_crash",
                                protocol = PROTOCOL_NAME,
                                "scheduler pass panicked, backing off"
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_monitor(inner: &Arc<Self>, token: CancellationToken) {
        let weak = Arc::downgrade(inner);
        let interval = inner.config.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            inner.monitor_once();
                        }));
                        if pass.is_err() {
                            error!(
                                event = "monitor_crash",
                                protocol = PROTOCOL_NAME,
                                "monitor pass panicked, backing off"
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
    }
}

fn result_handler(inner: Weak<RouterInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                inner.apply_result(&message);
            }
            Ok(())
        }
        .boxed()
    })
}

fn status_handler(inner: Weak<RouterInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                inner.core.apply_status(&message);
                if message.content_str("status") == Some("offline") {
                    inner.unregister_worker(&message.sender);
                }
            }
            Ok(())
        }
        .boxed()
    })
}

/// Protocol-borne task request: route it and answer the asker.
fn task_request_handler(inner: Weak<RouterInner>) -> HandlerFn {
    Arc::new(move |message| {
        let inner = inner.clone();
        async move {
            let Some(inner) = inner.upgrade() else {
                return Ok(());
            };
            // Results addressed to us are handled elsewhere; a task message
            // carries the request fields.
            let name = message
                .content_str("task_name")
                .unwrap_or_default()
                .to_string();
            let capability = message
                .content_str("capability")
                .unwrap_or_default()
                .to_string();
            if capability.is_empty() {
                debug!(
                    event = "task_request_malformed",
                    protocol = PROTOCOL_NAME,
                    peer = %message.sender,
                    "task request without capability"
                );
                return Ok(());
            }
            let priority = message
                .content
                .get("priority")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let correlation = message.content_str("task_id").map(str::to_string);
            let asker = message.sender.clone();

            let router = TaskRouter {
                inner: inner.clone(),
            };
            tokio::spawn(async move {
                let outcome = router
                    .route_task(&name, &capability, priority, None, Map::new())
                    .await;
                let mut reply = ProtocolMessage::new(
                    MessageType::Result,
                    router.inner.core.node_id(),
                )
                .with_target(&asker);
                if let Some(correlation) = correlation {
                    reply = reply.with_field("task_id", json!(correlation));
                }
                reply = match outcome {
                    Ok(result) => reply
                        .with_field("success", json!(true))
                        .with_field("result", result),
                    Err(err) => reply
                        .with_field("success", json!(false))
                        .with_field("error", json!(err.to_string())),
                };
                let _ = router.inner.core.send_direct(&asker, reply);
            });
            Ok(())
        }
        .boxed()
    })
}

#[async_trait::async_trait]
impl Protocol for TaskRouter {
    fn node_id(&self) -> &str {
        self.inner.core.node_id()
    }

    fn protocol_name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    async fn start(&self) -> Result<(), ProtocolError> {
        let (receiver, token) = self.inner.core.begin_start()?;
        ProtocolCore::spawn_dispatch_loop(self.inner.core.clone(), receiver, token.clone());
        RouterInner::spawn_scheduler(&self.inner, token.clone());
        RouterInner::spawn_monitor(&self.inner, token);
        self.inner.core.broadcast_all(self.inner.core.discovery_request());
        info!(
            event = "protocol_started",
            protocol = PROTOCOL_NAME,
            node = self.inner.core.node_id(),
            "task router started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProtocolError> {
        if !self.inner.core.begin_stop() {
            return Ok(());
        }
        self.inner.release_waiters();
        info!(
            event = "protocol_stopped",
            protocol = PROTOCOL_NAME,
            node = self.inner.core.node_id(),
            "task router stopped"
        );
        Ok(())
    }

    async fn send(&self, message: ProtocolMessage) -> Result<(), ProtocolError> {
        let target = message
            .target
            .clone()
            .ok_or_else(|| ProtocolError::Internal("send requires a target".to_string()))?;
        self.inner.core.send_direct(&target, message)
    }

    async fn broadcast(&self, message: ProtocolMessage) -> Result<(), ProtocolError> {
        self.inner.core.broadcast_all(message);
        Ok(())
    }

    fn register_handler(&self, kind: MessageType, handler: HandlerFn) {
        self.inner.core.register_handler(kind, handler);
    }

    fn register_capability(&self, capability: &str) {
        self.inner.core.register_capability(capability);
    }

    fn unregister_capability(&self, capability: &str) {
        self.inner.core.unregister_capability(capability);
    }

    fn update_status(&self, status: NodeStatus) {
        self.inner.core.update_status(status);
    }

    fn active_nodes(&self) -> Vec<String> {
        self.inner.core.active_nodes()
    }

    fn nodes_with_capability(&self, capability: &str) -> Vec<String> {
        self.inner.core.nodes_with_capability(capability)
    }

    fn network_status(&self) -> NetworkStatus {
        self.inner.core.network_status()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
