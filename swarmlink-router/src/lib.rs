//! # Swarmlink Task Router
//!
//! Centralized coordination: one router node owns per-capability priority
//! queues and dispatches tasks to registered workers, scored by success
//! rate, load headroom, and execution speed. Worker death is recoverable —
//! unregistering a worker reverts its in-flight tasks to the queue.

pub mod router;
pub mod task;
pub mod worker;

pub use router::{TaskRouter, PROTOCOL_NAME};
pub use task::{RouterConfig, RouterStats, Task, TaskStatus, WorkerStats};
pub use worker::TaskWorker;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Map, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use swarmlink_protocol::{EchoExecutor, MessageBus, Protocol, ProtocolError, TaskExecutor};
    use tokio::time::sleep;

    fn fast_config() -> RouterConfig {
        RouterConfig {
            scheduler_interval: Duration::from_millis(20),
            monitor_interval: Duration::from_millis(50),
            task_timeout: Duration::from_secs(5),
            ..RouterConfig::default()
        }
    }

    /// Executor that records task names in arrival order.
    struct RecordingExecutor {
        node_id: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(
            &self,
            task: &str,
            _capability: &str,
            _context: &Map<String, Value>,
        ) -> anyhow::Result<Value> {
            self.log.lock().push(task.to_string());
            Ok(json!(format!("{} done by {}", task, self.node_id)))
        }
    }

    /// Executor that never answers in time.
    struct StallingExecutor;

    #[async_trait]
    impl TaskExecutor for StallingExecutor {
        async fn execute(
            &self,
            _task: &str,
            _capability: &str,
            _context: &Map<String, Value>,
        ) -> anyhow::Result<Value> {
            sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn routes_tasks_to_both_workers_and_tracks_stats() {
        let bus = MessageBus::new();
        let router = TaskRouter::with_config("router", bus.clone(), fast_config());
        router.start().await.unwrap();

        let w1 = TaskWorker::new("w1", bus.clone(), Arc::new(EchoExecutor::new("w1")));
        let w2 = TaskWorker::new("w2", bus.clone(), Arc::new(EchoExecutor::new("w2")));
        w1.start().unwrap();
        w2.start().unwrap();
        router.register_worker("w1", &["compute".to_string()]);
        router.register_worker("w2", &["compute".to_string(), "analyze".to_string()]);

        let (first, second) = tokio::join!(
            router.route_task("job1", "compute", 5, Some(Duration::from_secs(2)), Map::new()),
            router.route_task("job1", "compute", 5, Some(Duration::from_secs(2)), Map::new()),
        );
        let first = first.unwrap();
        let second = second.unwrap();
        for reply in [&first, &second] {
            assert!(reply.as_str().unwrap().contains("executed by"));
        }

        // Load-aware scoring spreads the concurrent tasks one per worker.
        for worker_id in ["w1", "w2"] {
            let stats = router.worker_stats(worker_id).unwrap();
            assert_eq!(stats.tasks_completed, 1, "worker {worker_id}");
            assert_eq!(stats.tasks_failed, 0, "worker {worker_id}");
            assert_eq!(stats.current_load, 0, "worker {worker_id}");
        }

        router.stop().await.unwrap();
        w1.stop();
        w2.stop();
    }

    #[tokio::test]
    async fn zero_eligible_workers_times_out_without_assignment() {
        let bus = MessageBus::new();
        let router = TaskRouter::with_config("router", bus, fast_config());
        router.start().await.unwrap();

        let err = router
            .route_task(
                "orphan",
                "compute",
                0,
                Some(Duration::from_millis(200)),
                Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TaskTimeout { .. }));

        let stats = router.stats();
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.executing_tasks, 0);

        router.stop().await.unwrap();
    }

    #[tokio::test]
    async fn task_succeeds_once_worker_registers() {
        let bus = MessageBus::new();
        let router = TaskRouter::with_config("router", bus.clone(), fast_config());
        router.start().await.unwrap();

        let pending = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .route_task("late", "compute", 0, Some(Duration::from_secs(3)), Map::new())
                    .await
            })
        };

        sleep(Duration::from_millis(100)).await;
        let worker = TaskWorker::new("w1", bus.clone(), Arc::new(EchoExecutor::new("w1")));
        worker.start().unwrap();
        router.register_worker("w1", &["compute".to_string()]);

        let result = pending.await.unwrap().unwrap();
        assert!(result.as_str().unwrap().contains("w1"));

        router.stop().await.unwrap();
        worker.stop();
    }

    #[tokio::test]
    async fn priority_orders_execution_with_fifo_ties() {
        let bus = MessageBus::new();
        let mut config = fast_config();
        config.default_max_concurrent = 1;
        let router = TaskRouter::with_config("router", bus.clone(), config);
        router.start().await.unwrap();

        let mut handles = Vec::new();
        for (name, priority) in [("low", 1), ("high", 5), ("mid-a", 3), ("mid-b", 3)] {
            let router = router.clone();
            handles.push(tokio::spawn(async move {
                router
                    .route_task(name, "compute", priority, Some(Duration::from_secs(5)), Map::new())
                    .await
            }));
            // Distinct arrival order for the FIFO tie-break.
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(50)).await;

        let log = Arc::new(Mutex::new(Vec::new()));
        let worker = TaskWorker::new(
            "w1",
            bus.clone(),
            Arc::new(RecordingExecutor {
                node_id: "w1".to_string(),
                log: log.clone(),
            }),
        );
        worker.start().unwrap();
        router.register_worker("w1", &["compute".to_string()]);

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*log.lock(), vec!["high", "mid-a", "mid-b", "low"]);

        router.stop().await.unwrap();
        worker.stop();
    }

    #[tokio::test]
    async fn unregister_requeues_executing_tasks_exactly_once() {
        let bus = MessageBus::new();
        let router = TaskRouter::with_config("router", bus.clone(), fast_config());
        router.start().await.unwrap();

        let stalled = TaskWorker::new("w1", bus.clone(), Arc::new(StallingExecutor));
        stalled.start().unwrap();
        router.register_worker("w1", &["compute".to_string()]);

        let pending = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .route_task("stuck", "compute", 7, Some(Duration::from_secs(5)), Map::new())
                    .await
            })
        };

        // Wait for the task to be assigned to w1.
        sleep(Duration::from_millis(150)).await;
        let stats = router.worker_stats("w1").unwrap();
        assert_eq!(stats.current_load, 1);

        router.unregister_worker("w1");
        let stats = router.worker_stats("w1").unwrap();
        assert_eq!(stats.current_load, 0);
        assert_eq!(router.stats().pending_tasks, 1);

        // A healthy replacement picks the task up and finishes it.
        let healthy = TaskWorker::new("w2", bus.clone(), Arc::new(EchoExecutor::new("w2")));
        healthy.start().unwrap();
        router.register_worker("w2", &["compute".to_string()]);

        let result = pending.await.unwrap().unwrap();
        assert!(result.as_str().unwrap().contains("w2"));

        router.stop().await.unwrap();
        stalled.stop();
        healthy.stop();
    }

    #[tokio::test]
    async fn stop_releases_waiters_with_shutdown_error() {
        let bus = MessageBus::new();
        let router = TaskRouter::with_config("router", bus, fast_config());
        router.start().await.unwrap();

        let pending = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .route_task("doomed", "compute", 0, Some(Duration::from_secs(10)), Map::new())
                    .await
            })
        };
        sleep(Duration::from_millis(50)).await;

        router.stop().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::ShuttingDown));
    }

    #[tokio::test]
    async fn start_stop_start_behaves_like_fresh_start() {
        let bus = MessageBus::new();
        let router = TaskRouter::with_config("router", bus.clone(), fast_config());

        router.start().await.unwrap();
        assert!(matches!(
            router.start().await.unwrap_err(),
            ProtocolError::AlreadyRunning
        ));
        router.stop().await.unwrap();
        router.start().await.unwrap();

        // The restarted router schedules tasks as a fresh one would.
        let worker = TaskWorker::new("w1", bus.clone(), Arc::new(EchoExecutor::new("w1")));
        worker.start().unwrap();
        router.register_worker("w1", &["compute".to_string()]);
        let result = router
            .route_task("again", "compute", 0, Some(Duration::from_secs(2)), Map::new())
            .await
            .unwrap();
        assert!(result.as_str().unwrap().contains("w1"));

        router.stop().await.unwrap();
        worker.stop();
    }
}
