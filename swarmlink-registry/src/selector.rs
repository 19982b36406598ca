//! Adaptive coordination-mode selector.
//!
//! A pure decision function from workload context to coordination mode,
//! plus online feedback: callers report task outcomes and the selector
//! aggregates success rate and latency per mode with atomic counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::registry::CoordinationType;

/// Workload characteristics the decision rules consume.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionContext {
    /// Complexity score in [0, 1].
    pub task_complexity: f64,
    pub agent_count: usize,
    /// Maximum acceptable latency in milliseconds.
    pub latency_requirement_ms: f64,
    /// Required success rate in [0, 1].
    pub reliability_requirement: f64,
}

/// One recorded decision.
#[derive(Debug, Clone, Serialize)]
pub struct ModeDecision {
    pub mode: CoordinationType,
    pub context: SelectionContext,
    pub decided_at: DateTime<Utc>,
}

/// One reported outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ModeOutcome {
    pub mode: CoordinationType,
    pub success: bool,
    pub latency_ms: f64,
    pub resource_usage: Map<String, Value>,
    pub reported_at: DateTime<Utc>,
}

/// Per-mode aggregate visible through `mode_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeStats {
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tasks: u64,
}

#[derive(Default)]
struct ModeAggregate {
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_us: AtomicU64,
}

/// Chooses a coordination mode and learns from reported outcomes.
///
/// Safe to call concurrently; aggregates use per-mode atomic updates.
#[derive(Default)]
pub struct AdaptiveModeSelector {
    decisions: Mutex<Vec<ModeDecision>>,
    outcomes: Mutex<Vec<ModeOutcome>>,
    aggregates: DashMap<CoordinationType, ModeAggregate>,
}

impl AdaptiveModeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a mode for the given context and record the decision.
    pub fn select_mode(&self, context: &SelectionContext) -> CoordinationType {
        let mode = if context.agent_count < 5 && context.task_complexity < 0.5 {
            // Small scale, simple work: a single coordinator is cheapest.
            CoordinationType::Centralized
        } else if context.agent_count > 20 || context.reliability_requirement >= 0.95 {
            CoordinationType::Decentralized
        } else {
            // Low-latency complex work and every remaining case both land
            // on the hybrid mesh.
            CoordinationType::Hybrid
        };

        self.decisions.lock().push(ModeDecision {
            mode,
            context: context.clone(),
            decided_at: Utc::now(),
        });
        mode
    }

    /// Report how a coordinated task went.
    pub fn update_performance(
        &self,
        mode: CoordinationType,
        success: bool,
        latency_ms: f64,
        resource_usage: Map<String, Value>,
    ) {
        {
            let aggregate = self.aggregates.entry(mode).or_default();
            if success {
                aggregate.successes.fetch_add(1, Ordering::Relaxed);
            } else {
                aggregate.failures.fetch_add(1, Ordering::Relaxed);
            }
            aggregate
                .total_latency_us
                .fetch_add((latency_ms * 1000.0) as u64, Ordering::Relaxed);
        }

        self.outcomes.lock().push(ModeOutcome {
            mode,
            success,
            latency_ms,
            resource_usage,
            reported_at: Utc::now(),
        });
    }

    /// Success rate, mean latency, and task count per mode.
    pub fn mode_stats(&self) -> BTreeMap<CoordinationType, ModeStats> {
        let mut stats = BTreeMap::new();
        for entry in self.aggregates.iter() {
            let successes = entry.successes.load(Ordering::Relaxed);
            let failures = entry.failures.load(Ordering::Relaxed);
            let total = successes + failures;
            if total == 0 {
                continue;
            }
            let latency_us = entry.total_latency_us.load(Ordering::Relaxed);
            stats.insert(
                *entry.key(),
                ModeStats {
                    success_rate: successes as f64 / total as f64,
                    avg_latency_ms: latency_us as f64 / 1000.0 / total as f64,
                    total_tasks: total,
                },
            );
        }
        stats
    }

    /// Recorded decisions, oldest first.
    pub fn decision_history(&self) -> Vec<ModeDecision> {
        self.decisions.lock().clone()
    }
}
