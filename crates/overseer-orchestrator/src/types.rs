use chrono::{DateTime, Utc};
use overseer_core::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

pub type TaskId = Uuid;
pub type WorkflowId = Uuid;

/// Task priority. Ordering is `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// One level lower, bottoming out at `Low`.
    pub fn demoted(self) -> Self {
        match self {
            TaskPriority::Critical => TaskPriority::High,
            TaskPriority::High => TaskPriority::Medium,
            TaskPriority::Medium | TaskPriority::Low => TaskPriority::Low,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for TaskPriority {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(OverseerError::Config(format!("unknown priority '{other}'"))),
        }
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether a forward move to `next` is allowed. Moving back to `Pending`
    /// is never a forward move; only [`Task::requeue`] does that.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned | Failed | Cancelled) => true,
            (Assigned, InProgress | Completed | Failed | Cancelled) => true,
            (InProgress, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Back-references and lineage for a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub workflow_step_id: Option<String>,
    /// Parent task if this is a subtask spawned by another task.
    #[serde(default)]
    pub parent_task: Option<TaskId>,
    /// Depth in the task hierarchy (0 = root task).
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl TaskMetadata {
    pub fn for_workflow_step(workflow_id: WorkflowId, step_id: impl Into<String>) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            workflow_step_id: Some(step_id.into()),
            ..Self::default()
        }
    }
}

/// Everything needed to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub description: String,
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Defaults to `{task_type}` when empty.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl TaskRequest {
    pub fn new(description: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            task_type: task_type.into(),
            priority: TaskPriority::default(),
            required_capabilities: BTreeSet::new(),
            parameters: Map::new(),
            metadata: TaskMetadata::default(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_metadata(mut self, metadata: TaskMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A unit of work tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub task_type: String,
    pub priority: TaskPriority,
    /// Priority the queue currently uses; lowered each time dispatch passes
    /// the task over.
    pub effective_priority: TaskPriority,
    pub status: TaskStatus,
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub assigned_agent_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatch_attempts: u32,
    /// Creation order; breaks priority ties FIFO.
    #[serde(default)]
    pub sequence: u64,
}

impl Task {
    pub fn from_request(request: TaskRequest, sequence: u64) -> Self {
        let required_capabilities = if request.required_capabilities.is_empty() {
            BTreeSet::from([request.task_type.clone()])
        } else {
            request.required_capabilities
        };
        Self {
            id: Uuid::new_v4(),
            description: request.description,
            task_type: request.task_type,
            priority: request.priority,
            effective_priority: request.priority,
            status: TaskStatus::Pending,
            required_capabilities,
            parameters: request.parameters,
            metadata: request.metadata,
            assigned_agent_id: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            dispatch_attempts: 0,
            sequence,
        }
    }

    pub fn new(description: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self::from_request(TaskRequest::new(description, task_type), 0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn advance(&mut self, next: TaskStatus) -> OverseerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OverseerError::InvalidTransition(format!(
                "task {}: {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn assign(&mut self, agent_id: &str) -> OverseerResult<()> {
        self.advance(TaskStatus::Assigned)?;
        self.assigned_agent_id = Some(agent_id.to_string());
        self.assigned_at = Some(Utc::now());
        Ok(())
    }

    pub fn start(&mut self) -> OverseerResult<()> {
        self.advance(TaskStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, result: Value) -> OverseerResult<()> {
        self.advance(TaskStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> OverseerResult<()> {
        self.advance(TaskStatus::Failed)?;
        self.error = Some(error.into());
        self.result = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> OverseerResult<()> {
        self.advance(TaskStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Return an assigned or running task to `Pending`.
    pub fn requeue(&mut self) -> OverseerResult<()> {
        if !matches!(self.status, TaskStatus::Assigned | TaskStatus::InProgress) {
            return Err(OverseerError::InvalidTransition(format!(
                "task {}: cannot requeue from {}",
                self.id, self.status
            )));
        }
        self.status = TaskStatus::Pending;
        self.assigned_agent_id = None;
        self.assigned_at = None;
        self.started_at = None;
        Ok(())
    }

    /// When the task was handed to its current agent, preferring the start time.
    pub fn in_flight_since(&self) -> Option<DateTime<Utc>> {
        self.started_at.or(self.assigned_at)
    }
}

/// Closed set of agent roles known at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Decomposes work and delegates subtasks.
    Coordinator,
    CodeGenerator,
    DataAnalyst,
    Researcher,
    Reviewer,
    /// Runs governed tools on behalf of other agents.
    ToolRunner,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Coordinator,
        AgentRole::CodeGenerator,
        AgentRole::DataAnalyst,
        AgentRole::Researcher,
        AgentRole::Reviewer,
        AgentRole::ToolRunner,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Coordinator => "coordinator",
            AgentRole::CodeGenerator => "code_generator",
            AgentRole::DataAnalyst => "data_analyst",
            AgentRole::Researcher => "researcher",
            AgentRole::Reviewer => "reviewer",
            AgentRole::ToolRunner => "tool_runner",
        }
    }

    /// Capabilities an agent of this role declares unless configured otherwise.
    pub fn default_capabilities(self) -> BTreeSet<String> {
        let caps: &[&str] = match self {
            AgentRole::Coordinator => &["planning", "delegation"],
            AgentRole::CodeGenerator => &["code_generation", "refactoring"],
            AgentRole::DataAnalyst => &["data_analysis", "reporting"],
            AgentRole::Researcher => &["research", "summarization"],
            AgentRole::Reviewer => &["code_review", "testing"],
            AgentRole::ToolRunner => &["tool_execution"],
        };
        caps.iter().map(|c| c.to_string()).collect()
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = OverseerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentRole::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| OverseerError::Config(format!("unknown agent role '{s}'")))
    }
}

/// Status an agent reports about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Idle,
    Busy,
    Error,
}

/// What an agent declares when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub agent_id: String,
    pub role: AgentRole,
    pub capabilities: BTreeSet<String>,
}

impl AgentCapabilities {
    /// Capabilities default to the role's defaults.
    pub fn new(agent_id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            capabilities: role.default_capabilities(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

/// Aggregate outcome counters for an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_assigned: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_latency_ms: u64,
}

impl AgentMetrics {
    /// Fraction of finished tasks that completed; 0 when none finished.
    pub fn success_rate(&self) -> f64 {
        let finished = self.tasks_completed + self.tasks_failed;
        if finished == 0 {
            0.0
        } else {
            self.tasks_completed as f64 / finished as f64
        }
    }

    pub fn average_latency_ms(&self) -> f64 {
        let finished = self.tasks_completed + self.tasks_failed;
        if finished == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / finished as f64
        }
    }
}

/// The orchestrator's view of a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub role: AgentRole,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Task reserved for this agent by dispatch.
    pub current_task: Option<TaskId>,
    pub metrics: AgentMetrics,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn new(caps: AgentCapabilities) -> Self {
        let now = Utc::now();
        Self {
            agent_id: caps.agent_id,
            role: caps.role,
            capabilities: caps.capabilities,
            status: AgentStatus::Idle,
            current_task: None,
            metrics: AgentMetrics::default(),
            registered_at: now,
            last_seen: now,
        }
    }

    pub fn declares(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Idle, unreserved and capable of `required`.
    pub fn is_eligible(&self, required: &BTreeSet<String>) -> bool {
        self.status == AgentStatus::Idle && self.current_task.is_none() && self.declares(required)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_defaults_capability_to_type() {
        let task = Task::new("Summarize logs", "summarization");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(
            task.required_capabilities,
            BTreeSet::from(["summarization".to_string()])
        );
        assert_eq!(task.effective_priority, TaskPriority::Medium);
    }

    #[test]
    fn test_lifecycle_is_monotone() {
        let mut task = Task::new("t", "research");
        task.assign("a1").unwrap();
        task.start().unwrap();
        task.complete(json!({"ok": true})).unwrap();
        assert!(task.is_terminal());
        assert!(task.fail("late").is_err());
        assert!(task.requeue().is_err());
        assert_eq!(task.result, Some(json!({"ok": true})));
        assert!(task.error.is_none());
    }

    #[test]
    fn test_requeue_clears_assignment() {
        let mut task = Task::new("t", "research");
        task.assign("a1").unwrap();
        task.start().unwrap();
        task.requeue().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent_id.is_none());
        assert!(task.in_flight_since().is_none());
        assert!(!TaskStatus::InProgress.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_priority_order_and_demotion() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert_eq!(TaskPriority::High.demoted(), TaskPriority::Medium);
        assert_eq!(TaskPriority::Low.demoted(), TaskPriority::Low);
        assert_eq!("HIGH".parse::<TaskPriority>().unwrap(), TaskPriority::High);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(
            "data_analyst".parse::<AgentRole>().unwrap(),
            AgentRole::DataAnalyst
        );
        assert!("wizard".parse::<AgentRole>().is_err());
        assert_eq!(AgentRole::ToolRunner.to_string(), "tool_runner");
    }

    #[test]
    fn test_eligibility() {
        let mut reg = AgentRegistration::new(
            AgentCapabilities::new("a1", AgentRole::Researcher).with_capability("web"),
        );
        let need = BTreeSet::from(["research".to_string(), "web".to_string()]);
        assert!(reg.is_eligible(&need));
        reg.status = AgentStatus::Busy;
        assert!(!reg.is_eligible(&need));
        assert!(reg.declares(&need));
        reg.status = AgentStatus::Idle;
        reg.current_task = Some(Uuid::new_v4());
        assert!(!reg.is_eligible(&need));
    }

    #[test]
    fn test_metrics_rates() {
        let m = AgentMetrics {
            tasks_assigned: 4,
            tasks_completed: 3,
            tasks_failed: 1,
            total_latency_ms: 400,
        };
        assert!((m.success_rate() - 0.75).abs() < f64::EPSILON);
        assert!((m.average_latency_ms() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
