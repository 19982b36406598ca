//! Task and worker bookkeeping for the centralized router.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle of a routed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A unit of work routed to a worker.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    /// Capability a worker must advertise to receive this task.
    pub capability: String,
    /// Higher is more urgent; ties break by arrival order.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub assigned_to: Option<String>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Times this task was re-enqueued after losing its worker.
    pub retries: u32,
    pub metadata: Map<String, Value>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        capability: impl Into<String>,
        priority: i64,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            capability: capability.into(),
            priority,
            created_at: Utc::now(),
            assigned_to: None,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            retries: 0,
            metadata,
        }
    }
}

/// Running statistics for a registered worker.
///
/// All fields of one worker are updated together under its table entry.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub node_id: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_execution: Duration,
    pub current_load: u32,
    pub max_concurrent: u32,
}

impl WorkerStats {
    pub fn new(node_id: impl Into<String>, max_concurrent: u32) -> Self {
        Self {
            node_id: node_id.into(),
            tasks_completed: 0,
            tasks_failed: 0,
            total_execution: Duration::ZERO,
            current_load: 0,
            max_concurrent,
        }
    }

    /// Fraction of finished tasks that completed; 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }

    pub fn avg_execution_time(&self) -> Duration {
        if self.tasks_completed == 0 {
            Duration::ZERO
        } else {
            self.total_execution / self.tasks_completed as u32
        }
    }

    pub fn can_accept_task(&self) -> bool {
        self.current_load < self.max_concurrent
    }

    /// Weighted assignment score: 0.4·success-rate + 0.3·headroom +
    /// 0.3·time-score, where time-score is 1 until the first completion
    /// and `min(1, 60 / avg_exec_seconds)` afterwards.
    pub fn score(&self) -> f64 {
        let success = self.success_rate();
        let headroom = 1.0 - self.current_load as f64 / self.max_concurrent.max(1) as f64;
        let time = if self.tasks_completed == 0 {
            1.0
        } else {
            let avg_secs = self.avg_execution_time().as_secs_f64();
            if avg_secs <= 0.0 {
                1.0
            } else {
                (60.0 / avg_secs).min(1.0)
            }
        };
        0.4 * success + 0.3 * headroom + 0.3 * time
    }
}

/// Router tuning knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How often the scheduler matches queued tasks to workers.
    pub scheduler_interval: Duration,
    /// How often the monitor sweeps for timed-out and stale tasks.
    pub monitor_interval: Duration,
    /// Deadline applied to task execution and to `route_task` waits when
    /// the caller passes no explicit timeout.
    pub task_timeout: Duration,
    /// Terminal tasks older than this are dropped from the table.
    pub task_retention: Duration,
    /// Re-enqueues allowed per task before it fails outright.
    pub max_retries: u32,
    /// Concurrency cap for newly registered workers.
    pub default_max_concurrent: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            scheduler_interval: Duration::from_millis(500),
            monitor_interval: Duration::from_secs(10),
            task_timeout: Duration::from_secs(300),
            task_retention: Duration::from_secs(3600),
            max_retries: 3,
            default_max_concurrent: 3,
        }
    }
}

/// Snapshot returned by `TaskRouter::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub executing_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Queue depth per capability.
    pub queues: std::collections::BTreeMap<String, usize>,
    pub workers: std::collections::BTreeMap<String, WorkerStatsSnapshot>,
}

/// Per-worker slice of the router statistics.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatsSnapshot {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub current_load: u32,
    pub avg_execution_ms: u64,
}

impl From<&WorkerStats> for WorkerStatsSnapshot {
    fn from(stats: &WorkerStats) -> Self {
        Self {
            tasks_completed: stats.tasks_completed,
            tasks_failed: stats.tasks_failed,
            success_rate: stats.success_rate(),
            current_load: stats.current_load,
            avg_execution_ms: stats.avg_execution_time().as_millis() as u64,
        }
    }
}
