use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of governance contract an agent broke when invoking a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// The agent may not use the tool, or the tool does not exist.
    AccessDenied,
    /// The tool's per-agent rate limit is exhausted.
    RateLimited,
    /// The call carried a forbidden parameter.
    InvalidParameters,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::AccessDenied => write!(f, "access_denied"),
            ViolationKind::RateLimited => write!(f, "rate_limited"),
            ViolationKind::InvalidParameters => write!(f, "invalid_parameters"),
        }
    }
}

/// Top-level error type for Overseer.
///
/// The enum is `Clone` so a single outcome can be handed to every caller
/// attached to a deduplicated execution; I/O and JSON failures are captured
/// by message for that reason.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OverseerError {
    /// No task with the given id is known to the orchestrator.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No workflow instance with the given id exists.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No workflow template is registered under the given name.
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    /// An agent with the same id is already registered.
    #[error("Agent already registered: {0}")]
    AgentAlreadyRegistered(String),

    /// No agent with the given id is registered.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No registered agent can serve the task right now.
    #[error("No capable agent for task {task_id} (requires {required})")]
    NoCapableAgent {
        /// Task that could not be dispatched.
        task_id: String,
        /// Comma-separated capabilities the task requires.
        required: String,
    },

    /// The circuit protecting a dependency is open.
    #[error("Circuit '{name}' is open; retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Name of the protected dependency.
        name: String,
        /// Milliseconds until the breaker lets a probe through.
        retry_after_ms: u64,
    },

    /// A principal exceeded its request budget.
    #[error("Rate limit exceeded for '{principal}'; retry after {retry_after_ms}ms")]
    RateLimitExceeded {
        /// User, tool or agent being throttled.
        principal: String,
        /// Milliseconds until the exhausted window resets.
        retry_after_ms: u64,
    },

    /// An agent broke a tool-governance contract.
    #[error("Contract violation by agent '{agent_id}' ({violation}): {details}")]
    ContractViolation {
        /// Agent that attempted the call.
        agent_id: String,
        /// What kind of rule was broken.
        violation: ViolationKind,
        /// Human-readable details.
        details: String,
    },

    /// No pending approval with the given id exists.
    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    /// A state change that the lifecycle does not allow.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A tool raised an error while executing.
    #[error("Tool error: {0}")]
    Tool(String),

    /// A message bus failure (unknown channel, closed loop).
    #[error("Bus error: {0}")]
    Bus(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A persistence collaborator failed.
    #[error("Store error: {0}")]
    Store(String),

    /// An error from the orchestration engine.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(String),
}

impl OverseerError {
    /// Whether the error comes from resource contention and is worth retrying
    /// later rather than failing the surrounding task.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OverseerError::CircuitOpen { .. }
                | OverseerError::RateLimitExceeded { .. }
                | OverseerError::NoCapableAgent { .. }
        )
    }

    /// Convenience constructor for [`OverseerError::ContractViolation`].
    pub fn violation(
        agent_id: impl Into<String>,
        violation: ViolationKind,
        details: impl Into<String>,
    ) -> Self {
        OverseerError::ContractViolation {
            agent_id: agent_id.into(),
            violation,
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for OverseerError {
    fn from(err: serde_json::Error) -> Self {
        OverseerError::Json(err.to_string())
    }
}

impl From<std::io::Error> for OverseerError {
    fn from(err: std::io::Error) -> Self {
        OverseerError::Io(err.to_string())
    }
}

/// A convenience `Result` alias using [`OverseerError`].
pub type OverseerResult<T> = Result<T, OverseerError>;
