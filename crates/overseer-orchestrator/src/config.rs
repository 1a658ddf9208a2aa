use overseer_core::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the orchestration engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound between dispatch passes when nothing wakes the loop.
    #[serde(default = "default_redispatch_interval_ms")]
    pub redispatch_interval_ms: u64,
    /// Passes a task may spend with no agent declaring its capabilities
    /// before it fails.
    #[serde(default = "default_max_dispatch_attempts")]
    pub max_dispatch_attempts: u32,
    #[serde(default = "default_max_subtask_depth")]
    pub max_subtask_depth: u32,
    #[serde(default = "default_max_children_per_task")]
    pub max_children_per_task: u32,
    /// Topic agents publish task updates to.
    #[serde(default = "default_feedback_topic")]
    pub feedback_topic: String,
}

fn default_redispatch_interval_ms() -> u64 {
    250
}

fn default_max_dispatch_attempts() -> u32 {
    40
}

fn default_max_subtask_depth() -> u32 {
    3
}

fn default_max_children_per_task() -> u32 {
    5
}

fn default_feedback_topic() -> String {
    "orchestrator.feedback".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            redispatch_interval_ms: default_redispatch_interval_ms(),
            max_dispatch_attempts: default_max_dispatch_attempts(),
            max_subtask_depth: default_max_subtask_depth(),
            max_children_per_task: default_max_children_per_task(),
            feedback_topic: default_feedback_topic(),
        }
    }
}

impl OrchestratorConfig {
    pub fn redispatch_interval(&self) -> Duration {
        Duration::from_millis(self.redispatch_interval_ms)
    }

    pub fn validate(&self) -> OverseerResult<()> {
        if self.redispatch_interval_ms == 0 {
            return Err(OverseerError::Config(
                "orchestrator.redispatch_interval_ms must be greater than 0".into(),
            ));
        }
        if self.max_dispatch_attempts == 0 {
            return Err(OverseerError::Config(
                "orchestrator.max_dispatch_attempts must be greater than 0".into(),
            ));
        }
        if self.feedback_topic.trim().is_empty() {
            return Err(OverseerError::Config(
                "orchestrator.feedback_topic must not be empty".into(),
            ));
        }
        Ok(())
    }
}
