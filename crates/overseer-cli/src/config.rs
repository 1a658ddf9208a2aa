//! `overseer.toml` loading and validation.

use overseer_core::{OverseerError, OverseerResult, RiskLevel};
use overseer_governance::ToolSpec;
use overseer_orchestrator::{
    AgentCapabilities, AgentRole, OrchestratorConfig, ScheduledJob, WorkflowTemplate,
};
use overseer_resilience::{CircuitBreakerConfig, RateLimitConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverseerConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub approval: ApprovalPolicy,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub workflows: Vec<WorkflowTemplate>,
    #[serde(default)]
    pub schedules: Vec<ScheduledJob>,
    /// Directory for task and workflow records. In-memory when absent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Directory for the JSONL tool audit trail. Disabled when absent.
    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Role name; checked against the known roles in [`OverseerConfig::validate`].
    pub role: String,
    /// Overrides the role's default capabilities when non-empty.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Tools this agent may invoke.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Simulated work time per task.
    #[serde(default = "default_work_ms")]
    pub work_ms: u64,
}

fn default_work_ms() -> u64 {
    20
}

impl AgentConfig {
    pub fn capabilities(&self) -> OverseerResult<AgentCapabilities> {
        let role = AgentRole::from_str(&self.role)?;
        let caps = AgentCapabilities::new(self.agent_id.as_str(), role);
        Ok(if self.capabilities.is_empty() {
            caps
        } else {
            caps.with_capabilities(self.capabilities.iter().cloned())
        })
    }
}

/// Which parked tool calls `simulate` may approve on its own.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApprovalPolicy {
    /// Highest risk level approved automatically; nothing is when absent.
    #[serde(default)]
    pub auto_approve_up_to: Option<RiskLevel>,
}

impl ApprovalPolicy {
    pub fn allows(&self, risk: RiskLevel) -> bool {
        self.auto_approve_up_to.is_some_and(|max| risk <= max)
    }
}

impl OverseerConfig {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {e}", path.display())
        })?;
        Ok(Self::parse(&raw)?)
    }

    /// Parse and validate a TOML document.
    pub fn parse(raw: &str) -> OverseerResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| OverseerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OverseerResult<()> {
        self.orchestrator.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;

        let mut tool_names = HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(OverseerError::Config("tool name must not be empty".into()));
            }
            if !tool_names.insert(tool.name.as_str()) {
                return Err(OverseerError::Config(format!(
                    "tool '{}' is declared twice",
                    tool.name
                )));
            }
            if tool.rate_limit_per_minute == Some(0) {
                return Err(OverseerError::Config(format!(
                    "tool '{}' rate limit must be positive",
                    tool.name
                )));
            }
        }

        let mut agent_ids = HashSet::new();
        for agent in &self.agents {
            agent.capabilities()?;
            if !agent_ids.insert(agent.agent_id.as_str()) {
                return Err(OverseerError::Config(format!(
                    "agent '{}' is declared twice",
                    agent.agent_id
                )));
            }
            if let Some(unknown) = agent.tools.iter().find(|t| !tool_names.contains(t.as_str())) {
                return Err(OverseerError::Config(format!(
                    "agent '{}' is granted undeclared tool '{unknown}'",
                    agent.agent_id
                )));
            }
        }

        let mut workflow_names = HashSet::new();
        for workflow in &self.workflows {
            workflow.validate()?;
            if !workflow_names.insert(workflow.name.as_str()) {
                return Err(OverseerError::Config(format!(
                    "workflow '{}' is declared twice",
                    workflow.name
                )));
            }
        }

        for job in &self.schedules {
            job.validate()?;
        }
        Ok(())
    }
}
