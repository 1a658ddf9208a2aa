use crate::types::{AgentRegistration, Task, TaskStatus};
use crate::workflow::{WorkflowInstance, WorkflowStatus};
use chrono::{DateTime, Utc};
use overseer_core::BusStats;
use overseer_resilience::{CircuitBreakerSnapshot, WindowUsage};
use serde::Serialize;
use std::collections::BTreeMap;

/// Task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    /// Pending tasks waiting in the queue.
    pub queued: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub(crate) fn tally<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.queued += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.queued + self.assigned + self.in_progress + self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkflowCounts {
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl WorkflowCounts {
    pub(crate) fn tally<'a>(workflows: impl IntoIterator<Item = &'a WorkflowInstance>) -> Self {
        let mut counts = Self::default();
        for wf in workflows {
            match wf.status {
                WorkflowStatus::InProgress => counts.in_progress += 1,
                WorkflowStatus::Completed => counts.completed += 1,
                WorkflowStatus::Failed => counts.failed += 1,
                WorkflowStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

/// Point-in-time view of the whole system for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub generated_at: DateTime<Utc>,
    pub running: bool,
    pub tasks: TaskCounts,
    /// Registered agents, sorted by id.
    pub agents: Vec<AgentRegistration>,
    pub workflows: WorkflowCounts,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
    /// Limiter usage per principal.
    pub rate_limits: BTreeMap<String, Vec<WindowUsage>>,
    pub bus: BusStats,
}
