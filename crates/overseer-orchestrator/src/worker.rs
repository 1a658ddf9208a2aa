//! Adapter that turns a plain task executor into a bus participant.
//!
//! [`WorkerAgent`] speaks the orchestrator's protocol on behalf of an
//! [`AgentWorker`]: it reports `Busy`, publishes `InProgress`, runs the work
//! off the delivery loop so that `CancelTask` can still be received, then
//! publishes the outcome and reports `Idle` again.

use crate::messages::{AgentMessage, TaskUpdate};
use crate::spawner::SubtaskRequest;
use crate::types::{AgentStatus, Task, TaskId};
use async_trait::async_trait;
use overseer_core::{MessageBus, MessageHandler, OverseerError, OverseerResult};
use overseer_governance::{ExecutionGuard, GuardOutcome, InvocationContext};
use overseer_resilience::{CircuitBreaker, RateLimiter};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Executes tasks for one agent.
#[async_trait]
pub trait AgentWorker: Send + Sync + 'static {
    async fn perform(&self, task: &Task, ctx: &WorkerContext) -> OverseerResult<Value>;
}

/// What a worker can reach while performing a task.
#[derive(Clone)]
pub struct WorkerContext {
    agent_id: String,
    bus: MessageBus<AgentMessage>,
    feedback_topic: String,
    guard: Option<Arc<ExecutionGuard>>,
}

impl WorkerContext {
    pub fn new(
        agent_id: impl Into<String>,
        bus: MessageBus<AgentMessage>,
        feedback_topic: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            feedback_topic: feedback_topic.into(),
            guard: None,
        }
    }

    pub fn with_execution_guard(mut self, guard: Arc<ExecutionGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Publish a message on the feedback topic.
    pub fn report(&self, message: AgentMessage) -> usize {
        self.bus.publish(&self.feedback_topic, message)
    }

    /// Ask the orchestrator to spawn a child task.
    pub fn request_subtask(&self, request: SubtaskRequest) -> usize {
        self.report(AgentMessage::RequestSubtask {
            agent_id: self.agent_id.clone(),
            request,
        })
    }

    /// Invoke a governed tool as this agent.
    pub async fn invoke_tool(
        &self,
        tool_name: &str,
        params: Map<String, Value>,
    ) -> OverseerResult<GuardOutcome> {
        let guard = self.guard.as_ref().ok_or_else(|| {
            OverseerError::Config(format!(
                "agent '{}' has no execution guard for tool calls",
                self.agent_id
            ))
        })?;
        guard
            .execute(&InvocationContext::agent(self.agent_id.as_str()), tool_name, params)
            .await
    }
}

/// Bus handler running an [`AgentWorker`] one task at a time.
pub struct WorkerAgent<W> {
    worker: Arc<W>,
    ctx: WorkerContext,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
    running: Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>,
}

impl<W: AgentWorker> WorkerAgent<W> {
    pub fn new(worker: W, ctx: WorkerContext) -> Self {
        Self {
            worker: Arc::new(worker),
            ctx,
            breaker: None,
            limiter: None,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run every task through `breaker`; an open circuit defers the task.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Charge every task to the agent's id on `limiter`; an exhausted budget
    /// defers the task.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn into_handler(self) -> Arc<dyn MessageHandler<AgentMessage>> {
        Arc::new(self)
    }

    fn start(&self, task: Task) {
        let agent_id = self.ctx.agent_id.clone();
        let task_id = task.id;
        let worker = Arc::clone(&self.worker);
        let ctx = self.ctx.clone();
        let breaker = self.breaker.clone();
        let limiter = self.limiter.clone();
        let running = Arc::clone(&self.running);

        self.ctx.report(AgentMessage::AgentStatus {
            agent_id: agent_id.clone(),
            status: AgentStatus::Busy,
        });

        // Held across the spawn so the task cannot remove itself before it
        // has been inserted.
        let mut slots = self.running.lock();
        let handle = tokio::spawn(async move {
            ctx.report(AgentMessage::TaskUpdate(TaskUpdate::in_progress(
                task_id,
                agent_id.as_str(),
            )));

            let outcome = run_once(&*worker, &task, &ctx, breaker, limiter).await;
            let message = match outcome {
                Ok(result) => {
                    info!(agent_id = %agent_id, task_id = %task_id, "Task performed");
                    AgentMessage::TaskUpdate(TaskUpdate::completed(task_id, agent_id.as_str(), result))
                }
                Err(e) if e.is_transient() => {
                    warn!(agent_id = %agent_id, task_id = %task_id, error = %e, "Task deferred");
                    AgentMessage::TaskDeferred {
                        task_id,
                        agent_id: agent_id.clone(),
                        reason: e.to_string(),
                    }
                }
                Err(e) => {
                    error!(agent_id = %agent_id, task_id = %task_id, error = %e, "Task failed");
                    AgentMessage::TaskUpdate(TaskUpdate::failed(
                        task_id,
                        agent_id.as_str(),
                        e.to_string(),
                    ))
                }
            };

            running.lock().remove(&task_id);
            ctx.report(message);
            ctx.report(AgentMessage::AgentStatus {
                agent_id,
                status: AgentStatus::Idle,
            });
        });
        slots.insert(task_id, handle);
    }

    fn cancel(&self, task_id: TaskId) {
        let Some(handle) = self.running.lock().remove(&task_id) else {
            debug!(agent_id = %self.ctx.agent_id, task_id = %task_id, "Nothing to cancel");
            return;
        };
        handle.abort();
        info!(agent_id = %self.ctx.agent_id, task_id = %task_id, "Task cancelled");
        self.ctx.report(AgentMessage::TaskUpdate(TaskUpdate::cancelled(
            task_id,
            self.ctx.agent_id.as_str(),
        )));
        self.ctx.report(AgentMessage::AgentStatus {
            agent_id: self.ctx.agent_id.clone(),
            status: AgentStatus::Idle,
        });
    }
}

async fn run_once<W: AgentWorker>(
    worker: &W,
    task: &Task,
    ctx: &WorkerContext,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
) -> OverseerResult<Value> {
    if let Some(limiter) = limiter {
        limiter.enforce(ctx.agent_id()).await?;
    }
    match breaker {
        Some(breaker) => breaker.call(|| worker.perform(task, ctx)).await,
        None => worker.perform(task, ctx).await,
    }
}

#[async_trait]
impl<W: AgentWorker> MessageHandler<AgentMessage> for WorkerAgent<W> {
    async fn handle(&self, message: AgentMessage) -> OverseerResult<()> {
        match message {
            AgentMessage::AssignTask { task } => {
                debug!(agent_id = %self.ctx.agent_id, task_id = %task.id, "Assignment received");
                self.start(task);
                Ok(())
            }
            AgentMessage::CancelTask { task_id } => {
                self.cancel(task_id);
                Ok(())
            }
            other => {
                debug!(agent_id = %self.ctx.agent_id, kind = other.kind(), "Ignoring message");
                Ok(())
            }
        }
    }
}

impl<W> Drop for WorkerAgent<W> {
    fn drop(&mut self) {
        for (_, handle) in self.running.lock().drain() {
            handle.abort();
        }
    }
}
