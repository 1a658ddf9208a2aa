//! In-process simulation of a configured deployment.
//!
//! Every `[[agents]]` entry becomes a [`WorkerAgent`] that sleeps for its
//! configured work time and calls each tool it was granted. Every `[[tools]]`
//! entry is backed by an echo tool, so governance (permissions, limits,
//! approvals, audit) runs for real while nothing leaves the process.

use crate::config::{AgentConfig, OverseerConfig};
use async_trait::async_trait;
use overseer_core::{ApprovalDecision, OverseerError, OverseerResult};
use overseer_governance::{
    tool_fn, AuditLog, ExecutionGuard, GuardOutcome, PermissionsEngine, ToolRegistry,
    UsageReport,
};
use overseer_orchestrator::{
    AgentWorker, InMemoryStore, JsonFileStore, Orchestrator, RecordStore, ScheduledJob,
    Scheduler, SystemStatus, Task, TaskId, TaskPriority, TaskRequest, WorkerAgent, WorkerContext,
    WorkflowId, WorkflowInstance,
};
use overseer_resilience::{CircuitBreakerRegistry, RateLimiter};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const REVIEWER: &str = "overseer-cli";

/// Parse a `task_type:description` argument.
pub fn parse_task_arg(arg: &str, priority: TaskPriority) -> OverseerResult<TaskRequest> {
    match arg.split_once(':') {
        Some((task_type, description))
            if !task_type.trim().is_empty() && !description.trim().is_empty() =>
        {
            Ok(TaskRequest::new(description.trim(), task_type.trim()).with_priority(priority))
        }
        _ => Err(OverseerError::Config(format!(
            "task '{arg}' must look like <task_type>:<description>"
        ))),
    }
}

struct SimulatedWorker {
    tools: Vec<String>,
    work: Duration,
}

#[async_trait]
impl AgentWorker for SimulatedWorker {
    async fn perform(&self, task: &Task, ctx: &WorkerContext) -> OverseerResult<Value> {
        tokio::time::sleep(self.work).await;

        let mut calls = Map::new();
        for tool in &self.tools {
            let mut params = Map::new();
            params.insert("task".into(), Value::String(task.description.clone()));
            params.insert("task_type".into(), Value::String(task.task_type.clone()));
            let outcome = match ctx.invoke_tool(tool, params).await? {
                GuardOutcome::Completed(output) => output.value,
                GuardOutcome::PendingApproval(p) => json!({ "pending_approval": p.approval_id }),
            };
            calls.insert(tool.clone(), outcome);
        }

        Ok(json!({
            "agent": ctx.agent_id(),
            "task_type": task.task_type,
            "tools": calls,
        }))
    }
}

/// What to submit and how long to wait for it.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub tasks: Vec<TaskRequest>,
    pub workflows: Vec<String>,
    pub timeout: Duration,
    /// Run the configured schedules for this long after the submitted work.
    pub schedule_for: Option<Duration>,
}

/// Decision taken on a parked tool call after the run.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub approval_id: String,
    pub agent_id: String,
    pub tool_name: String,
    pub approved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub timed_out: bool,
    pub tasks: Vec<Task>,
    pub workflows: Vec<WorkflowInstance>,
    pub approvals: Vec<ApprovalOutcome>,
    pub status: SystemStatus,
    pub usage: UsageReport,
}

/// A fully wired, not yet started deployment.
pub struct Simulation {
    config: OverseerConfig,
    orchestrator: Orchestrator,
    guard: Arc<ExecutionGuard>,
    audit: Option<Arc<AuditLog>>,
}

impl Simulation {
    pub async fn build(config: OverseerConfig) -> OverseerResult<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        let audit = config
            .audit_dir
            .as_ref()
            .map(|dir| Arc::new(AuditLog::new(dir.clone())));
        let mut registry = ToolRegistry::new().with_circuit_breakers(Arc::clone(&breakers));
        if let Some(audit) = &audit {
            registry = registry.with_audit_log(Arc::clone(audit));
        }
        for spec in &config.tools {
            let name = spec.name.clone();
            registry.register(
                spec.clone(),
                tool_fn(move |params: Map<String, Value>| {
                    let name = name.clone();
                    async move { Ok(json!({ "tool": name, "echo": params })) }
                }),
            )?;
        }

        let permissions = Arc::new(PermissionsEngine::new(Arc::new(registry)));
        for agent in &config.agents {
            for tool in &agent.tools {
                permissions.grant(&agent.agent_id, tool.as_str());
            }
        }
        let guard = Arc::new(ExecutionGuard::new(permissions));

        let store: Arc<dyn RecordStore> = match &config.data_dir {
            Some(dir) => Arc::new(JsonFileStore::new(dir).await?),
            None => Arc::new(InMemoryStore::new()),
        };

        let mut builder = Orchestrator::builder()
            .with_config(config.orchestrator.clone())
            .with_store(store)
            .with_circuit_breakers(breakers)
            .with_rate_limiter(limiter)
            .with_execution_guard(Arc::clone(&guard));
        for template in &config.workflows {
            builder = builder.with_template(template.clone());
        }
        let orchestrator = builder.build()?;

        for agent in &config.agents {
            register_agent(&orchestrator, agent).await?;
        }
        info!(
            agents = config.agents.len(),
            tools = config.tools.len(),
            workflows = config.workflows.len(),
            "Simulation wired"
        );

        Ok(Self {
            config,
            orchestrator,
            guard,
            audit,
        })
    }

    pub async fn run(self, plan: SimulationPlan) -> OverseerResult<SimulationReport> {
        self.orchestrator.start()?;

        let mut task_ids = Vec::with_capacity(plan.tasks.len());
        for request in plan.tasks {
            task_ids.push(self.orchestrator.submit(request).await);
        }
        let mut workflow_ids = Vec::with_capacity(plan.workflows.len());
        for name in &plan.workflows {
            workflow_ids.push(self.orchestrator.execute_workflow(name, Map::new()).await?);
        }

        let timed_out = tokio::time::timeout(
            plan.timeout,
            self.wait_until_settled(&task_ids, &workflow_ids),
        )
        .await
        .is_err();
        if timed_out {
            warn!(timeout_ms = plan.timeout.as_millis() as u64, "Simulation timed out");
        }

        if let Some(window) = plan.schedule_for {
            self.run_schedules(window).await?;
        }

        let approvals = self.settle_approvals().await;

        let mut tasks = Vec::with_capacity(task_ids.len());
        for id in &task_ids {
            tasks.push(self.orchestrator.get_task_status(*id).await?);
        }
        let mut workflows = Vec::with_capacity(workflow_ids.len());
        for id in &workflow_ids {
            workflows.push(self.orchestrator.get_workflow(*id).await?);
        }
        let status = self.orchestrator.get_system_status().await;
        let usage = self.orchestrator.get_usage_report(None);

        self.orchestrator.shutdown().await;
        if let Some(audit) = &self.audit {
            audit.shutdown().await;
        }

        Ok(SimulationReport {
            timed_out,
            tasks,
            workflows,
            approvals,
            status,
            usage,
        })
    }

    async fn wait_until_settled(&self, tasks: &[TaskId], workflows: &[WorkflowId]) {
        loop {
            let mut settled = true;
            for id in tasks {
                if let Ok(task) = self.orchestrator.get_task_status(*id).await {
                    settled &= task.is_terminal();
                }
            }
            for id in workflows {
                if let Ok(wf) = self.orchestrator.get_workflow(*id).await {
                    settled &= !wf.is_running();
                }
            }
            if settled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn run_schedules(&self, window: Duration) -> OverseerResult<()> {
        let jobs: Vec<ScheduledJob> = self.config.schedules.clone();
        if jobs.is_empty() {
            return Ok(());
        }
        let handle = Scheduler::new(jobs)?.start(self.orchestrator.clone());
        tokio::time::sleep(window).await;
        handle.shutdown().await;
        Ok(())
    }

    /// Approve or reject every parked call according to the approval policy.
    async fn settle_approvals(&self) -> Vec<ApprovalOutcome> {
        let mut outcomes = Vec::new();
        for pending in self.guard.pending_approvals() {
            let approved = self.config.approval.allows(pending.risk_level);
            let decision = if approved {
                ApprovalDecision::approve(REVIEWER)
            } else {
                ApprovalDecision::reject(REVIEWER, "above auto-approval threshold")
            };
            match self.guard.resolve_approval(&pending.approval_id, decision).await {
                Ok(_) => outcomes.push(ApprovalOutcome {
                    approval_id: pending.approval_id,
                    agent_id: pending.agent_id,
                    tool_name: pending.tool_name,
                    approved,
                }),
                Err(e) => {
                    warn!(approval_id = %pending.approval_id, error = %e, "Could not resolve approval");
                }
            }
        }
        outcomes
    }
}

async fn register_agent(orchestrator: &Orchestrator, agent: &AgentConfig) -> OverseerResult<()> {
    let caps = agent.capabilities()?;
    let worker = SimulatedWorker {
        tools: agent.tools.clone(),
        work: Duration::from_millis(agent.work_ms),
    };
    let handler = WorkerAgent::new(worker, orchestrator.worker_context(&agent.agent_id))
        .with_circuit_breaker(
            orchestrator
                .circuit_breakers()
                .get_or_create(&format!("agent:{}", agent.agent_id)),
        )
        .with_rate_limiter(Arc::clone(orchestrator.rate_limiter()))
        .into_handler();
    orchestrator.register_agent(caps, handler).await?;
    Ok(())
}
