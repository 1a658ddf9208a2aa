use crate::types::{Task, TaskId, TaskMetadata, TaskPriority, TaskRequest};
use overseer_core::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// An agent's request to spawn a child task under a task it is working on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskRequest {
    /// The parent task that is spawning this subtask.
    pub parent_task_id: TaskId,
    pub description: String,
    pub task_type: String,
    /// Defaults to the parent's priority.
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl SubtaskRequest {
    pub fn new(
        parent_task_id: TaskId,
        description: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            parent_task_id,
            description: description.into(),
            task_type: task_type.into(),
            priority: None,
            required_capabilities: BTreeSet::new(),
            parameters: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Validates subtask requests against depth and fan-out limits to prevent
/// runaway recursion.
#[derive(Debug, Clone)]
pub struct SubtaskSpawner {
    /// Maximum allowed depth in the task hierarchy (root = 0).
    max_depth: u32,
    /// Maximum number of direct children a single task may have.
    max_children_per_task: u32,
}

impl SubtaskSpawner {
    /// Create a spawner with default limits (max_depth=3, max_children=5).
    pub fn new() -> Self {
        Self {
            max_depth: 3,
            max_children_per_task: 5,
        }
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_children(mut self, max: u32) -> Self {
        self.max_children_per_task = max;
        self
    }

    /// Turn `request` into a child task request of `parent`.
    ///
    /// Fails if the parent already finished, the depth limit would be
    /// exceeded, or the parent already has the maximum number of children.
    pub fn prepare(
        &self,
        parent: &Task,
        existing_children: usize,
        request: SubtaskRequest,
    ) -> OverseerResult<TaskRequest> {
        if parent.is_terminal() {
            return Err(OverseerError::Orchestrator(format!(
                "parent task {} already finished ({})",
                parent.id, parent.status
            )));
        }

        let parent_depth = parent.metadata.depth;
        if parent_depth + 1 > self.max_depth {
            return Err(OverseerError::Orchestrator(format!(
                "maximum spawn depth {} exceeded (parent depth is {})",
                self.max_depth, parent_depth
            )));
        }

        if existing_children >= self.max_children_per_task as usize {
            return Err(OverseerError::Orchestrator(format!(
                "parent task {} already has {} children (max {})",
                parent.id, existing_children, self.max_children_per_task
            )));
        }

        let metadata = TaskMetadata {
            parent_task: Some(parent.id),
            depth: parent_depth + 1,
            workflow_id: None,
            workflow_step_id: None,
            extra: Map::new(),
        };
        Ok(TaskRequest {
            description: request.description,
            task_type: request.task_type,
            priority: request.priority.unwrap_or(parent.priority),
            required_capabilities: request.required_capabilities,
            parameters: request.parameters,
            metadata,
        })
    }
}

impl Default for SubtaskSpawner {
    fn default() -> Self {
        Self::new()
    }
}
