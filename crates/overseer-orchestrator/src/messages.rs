use crate::spawner::SubtaskRequest;
use crate::types::{AgentStatus, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status report for a task, sent by its agent to the feedback topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub agent_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskUpdate {
    fn new(task_id: TaskId, agent_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id,
            agent_id: agent_id.into(),
            status,
            result: None,
            error: None,
        }
    }

    pub fn in_progress(task_id: TaskId, agent_id: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, TaskStatus::InProgress)
    }

    pub fn completed(task_id: TaskId, agent_id: impl Into<String>, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(task_id, agent_id, TaskStatus::Completed)
        }
    }

    pub fn failed(task_id: TaskId, agent_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(task_id, agent_id, TaskStatus::Failed)
        }
    }

    pub fn cancelled(task_id: TaskId, agent_id: impl Into<String>) -> Self {
        Self::new(task_id, agent_id, TaskStatus::Cancelled)
    }
}

/// Everything exchanged between the orchestrator and agents on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Orchestrator to agent: run this task.
    AssignTask { task: Task },
    /// Orchestrator to agent: stop working on this task if possible.
    CancelTask { task_id: TaskId },
    /// Agent to orchestrator: progress or outcome of a task.
    TaskUpdate(TaskUpdate),
    /// Agent to orchestrator: hand the task back for a later attempt after a
    /// transient failure (open circuit, rate limit).
    TaskDeferred {
        task_id: TaskId,
        agent_id: String,
        reason: String,
    },
    /// Agent to orchestrator: spawn a child task.
    RequestSubtask {
        agent_id: String,
        request: SubtaskRequest,
    },
    /// Agent to orchestrator: the agent's own busy/idle state.
    AgentStatus { agent_id: String, status: AgentStatus },
}

impl AgentMessage {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::AssignTask { .. } => "assign_task",
            AgentMessage::CancelTask { .. } => "cancel_task",
            AgentMessage::TaskUpdate(_) => "task_update",
            AgentMessage::TaskDeferred { .. } => "task_deferred",
            AgentMessage::RequestSubtask { .. } => "request_subtask",
            AgentMessage::AgentStatus { .. } => "agent_status",
        }
    }
}
