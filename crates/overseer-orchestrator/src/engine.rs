use crate::config::OrchestratorConfig;
use crate::messages::{AgentMessage, TaskUpdate};
use crate::monitor::AgentMonitor;
use crate::spawner::{SubtaskRequest, SubtaskSpawner};
use crate::status::{SystemStatus, TaskCounts, WorkflowCounts};
use crate::store::RecordStore;
use crate::task_queue::{QueueEntry, TaskQueue};
use crate::types::{
    AgentCapabilities, AgentStatus, Task, TaskId, TaskMetadata, TaskPriority, TaskRequest,
    TaskStatus, WorkflowId,
};
use crate::worker::WorkerContext;
use crate::workflow::{WorkflowInstance, WorkflowTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{MessageBus, MessageHandler, OverseerError, OverseerResult};
use overseer_governance::{ExecutionGuard, ToolRegistry, UsageLedger, UsageReport};
use overseer_resilience::{CircuitBreakerRegistry, RateLimiter};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bus channel the orchestrator receives feedback on. Agents may not use it.
pub const ORCHESTRATOR_CHANNEL: &str = "orchestrator";

/// Result of [`Orchestrator::cancel_task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task never reached an agent and is now cancelled.
    Cancelled,
    /// The task's agent was asked to stop; the task finishes when it reports.
    CancellationRequested,
    /// Nothing to do; the task had already finished.
    AlreadyFinished(TaskStatus),
}

/// What [`Orchestrator::reap_stale_tasks`] does with a stuck task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    Requeue,
    Fail,
}

enum Write {
    Create,
    Update,
}

/// Records touched while the state lock is held, written to the store before
/// it is released.
struct Changes {
    enabled: bool,
    tasks: Vec<(Write, Task)>,
    workflows: Vec<(Write, WorkflowInstance)>,
}

impl Changes {
    fn task(&mut self, write: Write, task: &Task) {
        if self.enabled {
            self.tasks.push((write, task.clone()));
        }
    }

    fn workflow(&mut self, write: Write, workflow: &WorkflowInstance) {
        if self.enabled {
            self.workflows.push((write, workflow.clone()));
        }
    }
}

#[derive(Default)]
struct EngineState {
    tasks: HashMap<TaskId, Task>,
    queue: TaskQueue,
    /// Deferred tasks held back until their instant passes.
    parked: Vec<(Instant, QueueEntry)>,
    agents: AgentMonitor,
    workflows: HashMap<WorkflowId, WorkflowInstance>,
    templates: HashMap<String, WorkflowTemplate>,
}

impl EngineState {
    fn enqueue(&mut self, request: TaskRequest, changes: &mut Changes) -> TaskId {
        let sequence = self.queue.next_sequence();
        let task = Task::from_request(request, sequence);
        let id = task.id;
        self.queue.push(id, task.effective_priority, sequence);
        changes.task(Write::Create, &task);
        info!(
            task_id = %id,
            task_type = %task.task_type,
            priority = %task.priority,
            "Task submitted"
        );
        self.tasks.insert(id, task);
        id
    }

    /// Children spawned under `parent` so far.
    fn child_count(&self, parent: TaskId) -> usize {
        self.tasks
            .values()
            .filter(|t| t.metadata.parent_task == Some(parent))
            .count()
    }
}

fn elapsed_ms(since: Option<DateTime<Utc>>) -> u64 {
    since
        .map(|t| (Utc::now() - t).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

struct Inner {
    config: OrchestratorConfig,
    bus: MessageBus<AgentMessage>,
    state: Mutex<EngineState>,
    notify: Notify,
    spawner: SubtaskSpawner,
    store: Option<Arc<dyn RecordStore>>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    tools: Option<Arc<ToolRegistry>>,
    guard: Option<Arc<ExecutionGuard>>,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl Inner {
    fn changes(&self) -> Changes {
        Changes {
            enabled: self.store.is_some(),
            tasks: Vec::new(),
            workflows: Vec::new(),
        }
    }

    async fn persist(&self, changes: Changes) {
        let Some(store) = &self.store else {
            return;
        };
        for (write, task) in changes.tasks {
            let outcome = match write {
                Write::Create => store.create_task(&task).await,
                Write::Update => store.update_task(&task).await,
            };
            if let Err(e) = outcome {
                warn!(task_id = %task.id, error = %e, "Failed to persist task");
            }
        }
        for (write, workflow) in changes.workflows {
            let outcome = match write {
                Write::Create => store.create_workflow(&workflow).await,
                Write::Update => store.update_workflow(&workflow).await,
            };
            if let Err(e) = outcome {
                warn!(workflow_id = %workflow.id, error = %e, "Failed to persist workflow");
            }
        }
    }

    async fn submit(&self, request: TaskRequest) -> TaskId {
        let mut changes = self.changes();
        let id = {
            let mut state = self.state.lock().await;
            let id = state.enqueue(request, &mut changes);
            self.persist(changes).await;
            id
        };
        self.notify.notify_one();
        id
    }

    // ── Dispatch ────────────────────────────────────────────────

    /// One pass over the queue. Returns the number of tasks assigned.
    async fn dispatch_pass(&self) -> usize {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let mut changes = self.changes();

        let now = Instant::now();
        let (ready, still_parked): (Vec<_>, Vec<_>) =
            st.parked.drain(..).partition(|(until, _)| *until <= now);
        st.parked = still_parked;
        for (_, entry) in ready {
            st.queue.push_entry(entry);
        }

        let mut assigned = 0;
        let mut last_assigned = None;
        let mut requeue = Vec::new();
        let mut waiting = Vec::new();
        let mut exhausted = Vec::new();

        for (position, entry) in st.queue.drain_ordered().into_iter().enumerate() {
            let Some(task) = st.tasks.get_mut(&entry.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            if let Some(agent_id) = st.agents.find_eligible(&task.required_capabilities) {
                if let Err(e) = task.assign(&agent_id) {
                    error!(task_id = %task.id, error = %e, "Cannot assign task");
                    continue;
                }
                st.agents.reserve(&agent_id, task.id);
                let message = AgentMessage::AssignTask { task: task.clone() };
                match self.bus.send_direct(&agent_id, message) {
                    Ok(()) => {
                        info!(task_id = %task.id, agent_id = %agent_id, "Task assigned");
                        changes.task(Write::Update, task);
                        assigned += 1;
                        last_assigned = Some(position);
                    }
                    Err(e) => {
                        warn!(
                            task_id = %task.id,
                            agent_id = %agent_id,
                            error = %e,
                            "Assignment delivery failed, requeueing"
                        );
                        st.agents.cancel_reservation(&agent_id, task.id);
                        if task.requeue().is_ok() {
                            requeue.push(entry);
                        }
                    }
                }
                continue;
            }

            if !st.agents.any_declares(&task.required_capabilities) {
                task.dispatch_attempts += 1;
                let required = task
                    .required_capabilities
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                if task.dispatch_attempts >= self.config.max_dispatch_attempts {
                    let err = OverseerError::NoCapableAgent {
                        task_id: task.id.to_string(),
                        required,
                    };
                    warn!(
                        task_id = %task.id,
                        attempts = task.dispatch_attempts,
                        "No agent declares the required capabilities; failing task"
                    );
                    if task.fail(err.to_string()).is_ok() {
                        changes.task(Write::Update, task);
                        exhausted.push(task.id);
                    }
                    continue;
                }
                if task.dispatch_attempts == 1 {
                    warn!(task_id = %task.id, required = %required, "No capable agent registered");
                }
            }

            waiting.push((position, entry));
        }

        // A waiting task loses a level only when work queued behind it was
        // dispatched in this pass. Idle passes leave priorities alone.
        for (position, entry) in waiting {
            let passed_over = last_assigned.is_some_and(|last| position < last);
            if !passed_over {
                requeue.push(entry);
                continue;
            }
            let Some(task) = st.tasks.get_mut(&entry.task_id) else {
                continue;
            };
            task.effective_priority = entry.priority.demoted();
            debug!(
                task_id = %task.id,
                priority = %task.effective_priority,
                "Passed over for later work, requeued lower"
            );
            requeue.push(QueueEntry {
                priority: task.effective_priority,
                ..entry
            });
        }

        for entry in requeue {
            st.queue.push_entry(entry);
        }
        for task_id in exhausted {
            advance_workflow(st, task_id, &mut changes);
        }

        self.persist(changes).await;
        assigned
    }

    // ── Feedback ────────────────────────────────────────────────

    async fn handle_feedback(&self, message: AgentMessage) -> OverseerResult<()> {
        match message {
            AgentMessage::TaskUpdate(update) => self.apply_update(update).await,
            AgentMessage::TaskDeferred {
                task_id,
                agent_id,
                reason,
            } => self.defer(task_id, &agent_id, &reason).await,
            AgentMessage::RequestSubtask { agent_id, request } => {
                self.spawn_subtask(&agent_id, request).await;
                Ok(())
            }
            AgentMessage::AgentStatus { agent_id, status } => {
                let known = self.state.lock().await.agents.set_status(&agent_id, status);
                if !known {
                    debug!(agent_id = %agent_id, "Status from unknown agent");
                }
                self.notify.notify_one();
                Ok(())
            }
            other => {
                debug!(kind = other.kind(), "Ignoring orchestrator-bound message");
                Ok(())
            }
        }
    }

    async fn apply_update(&self, update: TaskUpdate) -> OverseerResult<()> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let mut changes = self.changes();

        let task = st
            .tasks
            .get_mut(&update.task_id)
            .ok_or_else(|| OverseerError::TaskNotFound(update.task_id.to_string()))?;
        if task.assigned_agent_id.as_deref() != Some(update.agent_id.as_str()) {
            debug!(
                task_id = %task.id,
                agent_id = %update.agent_id,
                "Ignoring update from an agent that does not hold the task"
            );
            return Ok(());
        }
        if !task.status.can_transition_to(update.status) {
            debug!(
                task_id = %task.id,
                from = %task.status,
                to = %update.status,
                "Ignoring update that does not advance the task"
            );
            return Ok(());
        }

        match update.status {
            TaskStatus::InProgress => task.start()?,
            TaskStatus::Completed => task.complete(update.result.unwrap_or(Value::Null))?,
            TaskStatus::Failed => {
                let reason = update.error.unwrap_or_else(|| "agent reported failure".into());
                error!(task_id = %task.id, agent_id = %update.agent_id, error = %reason, "Task failed");
                task.fail(reason)?;
            }
            TaskStatus::Cancelled => task.cancel()?,
            TaskStatus::Pending | TaskStatus::Assigned => return Ok(()),
        }
        changes.task(Write::Update, task);

        if task.is_terminal() {
            let task_id = task.id;
            let status = task.status;
            let latency_ms = elapsed_ms(task.assigned_at);
            match status {
                TaskStatus::Completed => {
                    info!(task_id = %task_id, agent_id = %update.agent_id, latency_ms, "Task completed");
                    st.agents.release(&update.agent_id, task_id, true, latency_ms);
                }
                TaskStatus::Failed => {
                    st.agents.release(&update.agent_id, task_id, false, latency_ms);
                }
                _ => {
                    info!(task_id = %task_id, agent_id = %update.agent_id, "Task cancelled");
                    st.agents.clear(&update.agent_id, task_id);
                }
            }
            advance_workflow(st, task_id, &mut changes);
        } else {
            debug!(task_id = %task.id, agent_id = %update.agent_id, "Task in progress");
        }

        self.persist(changes).await;
        drop(guard);
        self.notify.notify_one();
        Ok(())
    }

    async fn defer(&self, task_id: TaskId, agent_id: &str, reason: &str) -> OverseerResult<()> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        let mut changes = self.changes();

        let task = st
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| OverseerError::TaskNotFound(task_id.to_string()))?;
        if task.assigned_agent_id.as_deref() != Some(agent_id) || task.is_terminal() {
            return Ok(());
        }

        st.agents.clear(agent_id, task_id);
        task.requeue()?;
        task.dispatch_attempts += 1;
        if task.dispatch_attempts >= self.config.max_dispatch_attempts {
            warn!(task_id = %task_id, reason = %reason, "Task deferred too often; failing");
            task.fail(format!(
                "gave up after {} deferrals: {reason}",
                task.dispatch_attempts
            ))?;
            changes.task(Write::Update, task);
            advance_workflow(st, task_id, &mut changes);
        } else {
            warn!(task_id = %task_id, agent_id = %agent_id, reason = %reason, "Task deferred by agent");
            changes.task(Write::Update, task);
            let entry = QueueEntry {
                task_id,
                priority: task.effective_priority,
                sequence: task.sequence,
            };
            st.parked
                .push((Instant::now() + self.config.redispatch_interval(), entry));
        }

        self.persist(changes).await;
        Ok(())
    }

    async fn spawn_subtask(&self, agent_id: &str, request: SubtaskRequest) {
        let mut changes = self.changes();
        let spawned = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let parent_id = request.parent_task_id;
            let prepared = match st.tasks.get(&parent_id) {
                None => Err(OverseerError::TaskNotFound(parent_id.to_string())),
                Some(parent) if parent.assigned_agent_id.as_deref() != Some(agent_id) => {
                    Err(OverseerError::Orchestrator(format!(
                        "agent '{agent_id}' does not hold task {parent_id}"
                    )))
                }
                Some(parent) => {
                    self.spawner
                        .prepare(parent, st.child_count(parent_id), request)
                }
            };
            match prepared {
                Ok(child) => {
                    let id = st.enqueue(child, &mut changes);
                    info!(task_id = %id, parent_task = %parent_id, agent_id = %agent_id, "Subtask spawned");
                    self.persist(changes).await;
                    true
                }
                Err(e) => {
                    warn!(parent_task = %parent_id, agent_id = %agent_id, error = %e, "Subtask rejected");
                    false
                }
            }
        };
        if spawned {
            self.notify.notify_one();
        }
    }

    // ── Cancellation ────────────────────────────────────────────

    fn cancel_locked(
        &self,
        st: &mut EngineState,
        task_id: TaskId,
        changes: &mut Changes,
    ) -> OverseerResult<CancelOutcome> {
        let task = st
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| OverseerError::TaskNotFound(task_id.to_string()))?;

        match task.status {
            TaskStatus::Pending => {
                st.queue.remove(task_id);
                st.parked.retain(|(_, e)| e.task_id != task_id);
                task.cancel()?;
                changes.task(Write::Update, task);
                info!(task_id = %task_id, "Pending task cancelled");
                advance_workflow(st, task_id, changes);
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Assigned | TaskStatus::InProgress => {
                let agent_id = task.assigned_agent_id.clone().unwrap_or_default();
                match self
                    .bus
                    .send_direct(&agent_id, AgentMessage::CancelTask { task_id })
                {
                    Ok(()) => {
                        info!(task_id = %task_id, agent_id = %agent_id, "Cancellation requested");
                        Ok(CancelOutcome::CancellationRequested)
                    }
                    Err(e) => {
                        // Nobody left to report back; settle it here.
                        warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Agent unreachable, cancelling directly");
                        task.cancel()?;
                        changes.task(Write::Update, task);
                        st.agents.clear(&agent_id, task_id);
                        advance_workflow(st, task_id, changes);
                        Ok(CancelOutcome::Cancelled)
                    }
                }
            }
            status => Ok(CancelOutcome::AlreadyFinished(status)),
        }
    }
}

/// Move the workflow owning `task_id` forward after the task finished.
fn advance_workflow(st: &mut EngineState, task_id: TaskId, changes: &mut Changes) {
    let Some(task) = st.tasks.get(&task_id) else {
        return;
    };
    let Some(workflow_id) = task.metadata.workflow_id else {
        return;
    };
    let status = task.status;
    let result = task.result.clone();
    let error = task.error.clone();

    let next_request = {
        let Some(wf) = st.workflows.get_mut(&workflow_id) else {
            return;
        };
        if !wf.is_running() || wf.current_task() != Some(task_id) {
            return;
        }
        match status {
            TaskStatus::Completed => {
                match wf.record_step_result(task_id, result.unwrap_or(Value::Null)) {
                    Ok(true) => wf.current_step_request(),
                    Ok(false) => {
                        info!(workflow_id = %workflow_id, template = %wf.template, "Workflow completed");
                        None
                    }
                    Err(e) => {
                        warn!(workflow_id = %workflow_id, error = %e, "Cannot record step result");
                        None
                    }
                }
            }
            TaskStatus::Failed => {
                wf.fail(error.unwrap_or_else(|| "step failed".into()));
                warn!(
                    workflow_id = %workflow_id,
                    failed_step = wf.failed_step.as_deref().unwrap_or_default(),
                    "Workflow failed"
                );
                None
            }
            TaskStatus::Cancelled => {
                wf.cancel();
                info!(workflow_id = %workflow_id, "Workflow cancelled");
                None
            }
            _ => return,
        }
    };

    if let Some(request) = next_request {
        let next = st.enqueue(request, changes);
        if let Some(wf) = st.workflows.get_mut(&workflow_id) {
            wf.attach_task(next);
            debug!(
                workflow_id = %workflow_id,
                step = wf.current_step_index,
                task_id = %next,
                "Workflow advanced"
            );
        }
    }
    if let Some(wf) = st.workflows.get(&workflow_id) {
        changes.workflow(Write::Update, wf);
    }
}

struct FeedbackHandler {
    inner: Weak<Inner>,
}

#[async_trait]
impl MessageHandler<AgentMessage> for FeedbackHandler {
    async fn handle(&self, message: AgentMessage) -> OverseerResult<()> {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_feedback(message).await,
            None => Ok(()),
        }
    }
}

async fn dispatch_loop(inner: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let Some(engine) = inner.upgrade() else {
            break;
        };
        let assigned = engine.dispatch_pass().await;
        if assigned > 0 {
            debug!(assigned, "Dispatch pass");
        }
        let interval = engine.config.redispatch_interval();
        tokio::select! {
            _ = engine.notify.notified() => {}
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("Dispatch loop stopped");
}

/// Assembles an [`Orchestrator`] from explicitly supplied collaborators.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    bus: Option<MessageBus<AgentMessage>>,
    store: Option<Arc<dyn RecordStore>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    limiter: Option<Arc<RateLimiter>>,
    tools: Option<Arc<ToolRegistry>>,
    guard: Option<Arc<ExecutionGuard>>,
    templates: Vec<WorkflowTemplate>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_bus(mut self, bus: MessageBus<AgentMessage>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_tool_registry(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Guard handed to workers through [`Orchestrator::worker_context`].
    /// Its registry also backs the usage report unless one is set explicitly.
    pub fn with_execution_guard(mut self, guard: Arc<ExecutionGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_template(mut self, template: WorkflowTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn build(self) -> OverseerResult<Orchestrator> {
        self.config.validate()?;
        let mut templates = HashMap::new();
        for template in self.templates {
            template.validate()?;
            templates.insert(template.name.clone(), template);
        }

        let tools = self.tools.or_else(|| {
            self.guard
                .as_ref()
                .map(|g| Arc::clone(g.permissions().registry()))
        });
        let spawner = SubtaskSpawner::new()
            .with_max_depth(self.config.max_subtask_depth)
            .with_max_children(self.config.max_children_per_task);
        let (shutdown, _) = watch::channel(false);

        let inner = Inner {
            spawner,
            bus: self.bus.unwrap_or_default(),
            state: Mutex::new(EngineState {
                templates,
                ..Default::default()
            }),
            notify: Notify::new(),
            store: self.store,
            breakers: self.breakers.unwrap_or_default(),
            limiter: self.limiter.unwrap_or_default(),
            tools,
            guard: self.guard,
            dispatcher: parking_lot::Mutex::new(None),
            shutdown,
            running: AtomicBool::new(false),
            config: self.config,
        };
        Ok(Orchestrator {
            inner: Arc::new(inner),
        })
    }
}

/// The task orchestrator.
///
/// Owns the priority queue, the agent registry, the workflow sequencer and
/// the dispatch loop. Cloning is cheap and every clone drives the same
/// engine.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// An orchestrator with default collaborators.
    pub fn new(config: OrchestratorConfig) -> OverseerResult<Self> {
        Self::builder().with_config(config).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &MessageBus<AgentMessage> {
        &self.inner.bus
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Context for a [`WorkerAgent`](crate::WorkerAgent) registered as `agent_id`.
    pub fn worker_context(&self, agent_id: &str) -> WorkerContext {
        let ctx = WorkerContext::new(
            agent_id,
            self.inner.bus.clone(),
            self.inner.config.feedback_topic.as_str(),
        );
        match &self.inner.guard {
            Some(guard) => ctx.with_execution_guard(Arc::clone(guard)),
            None => ctx,
        }
    }

    // ── Tasks ───────────────────────────────────────────────────

    /// Queue a task requiring the `task_type` capability.
    pub async fn submit_task(
        &self,
        description: impl Into<String>,
        task_type: impl Into<String>,
        priority: TaskPriority,
        metadata: TaskMetadata,
    ) -> TaskId {
        self.submit(
            TaskRequest::new(description, task_type)
                .with_priority(priority)
                .with_metadata(metadata),
        )
        .await
    }

    /// Queue a fully specified task. Never waits for dispatch.
    pub async fn submit(&self, request: TaskRequest) -> TaskId {
        self.inner.submit(request).await
    }

    pub async fn get_task_status(&self, task_id: TaskId) -> OverseerResult<Task> {
        self.inner
            .state
            .lock()
            .await
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| OverseerError::TaskNotFound(task_id.to_string()))
    }

    /// Children spawned under `parent`, oldest first.
    pub async fn subtasks_of(&self, parent: TaskId) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        let mut children: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.metadata.parent_task == Some(parent))
            .cloned()
            .collect();
        children.sort_by_key(|t| t.sequence);
        children
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> OverseerResult<CancelOutcome> {
        let mut changes = self.inner.changes();
        let outcome = {
            let mut guard = self.inner.state.lock().await;
            let outcome = self.inner.cancel_locked(&mut guard, task_id, &mut changes)?;
            self.inner.persist(changes).await;
            outcome
        };
        self.inner.notify.notify_one();
        Ok(outcome)
    }

    /// Requeue or fail every task that has been with an agent longer than
    /// `older_than`. The agent is asked to stop and marked `Error` until it
    /// reports a new status.
    pub async fn reap_stale_tasks(&self, older_than: Duration, policy: StalePolicy) -> Vec<TaskId> {
        let Ok(bound) = chrono::Duration::from_std(older_than) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - bound;

        let mut changes = self.inner.changes();
        let mut guard = self.inner.state.lock().await;
        let st = &mut *guard;

        let mut stale: Vec<(u64, TaskId)> = st
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
            .filter(|t| t.in_flight_since().is_some_and(|since| since < cutoff))
            .map(|t| (t.sequence, t.id))
            .collect();
        stale.sort_unstable();

        let mut reaped = Vec::with_capacity(stale.len());
        for (_, task_id) in stale {
            let Some(task) = st.tasks.get_mut(&task_id) else {
                continue;
            };
            let agent_id = task.assigned_agent_id.clone().unwrap_or_default();
            let latency_ms = elapsed_ms(task.assigned_at);
            if let Err(e) = self
                .inner
                .bus
                .send_direct(&agent_id, AgentMessage::CancelTask { task_id })
            {
                debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "Stale task cancel not delivered");
            }
            st.agents.set_status(&agent_id, AgentStatus::Error);

            match policy {
                StalePolicy::Requeue => {
                    if task.requeue().is_err() {
                        continue;
                    }
                    st.agents.clear(&agent_id, task_id);
                    st.queue
                        .push(task_id, task.effective_priority, task.sequence);
                    changes.task(Write::Update, task);
                    warn!(task_id = %task_id, agent_id = %agent_id, latency_ms, "Stale task requeued");
                }
                StalePolicy::Fail => {
                    let reason = format!(
                        "no outcome from agent '{agent_id}' within {}ms",
                        older_than.as_millis()
                    );
                    if task.fail(reason).is_err() {
                        continue;
                    }
                    changes.task(Write::Update, task);
                    st.agents.release(&agent_id, task_id, false, latency_ms);
                    warn!(task_id = %task_id, agent_id = %agent_id, latency_ms, "Stale task failed");
                    advance_workflow(st, task_id, &mut changes);
                }
            }
            reaped.push(task_id);
        }

        self.inner.persist(changes).await;
        drop(guard);
        if !reaped.is_empty() {
            self.inner.notify.notify_one();
        }
        reaped
    }

    /// Run one dispatch pass now instead of waiting for the loop.
    pub async fn dispatch_pending(&self) -> usize {
        self.inner.dispatch_pass().await
    }

    // ── Agents ──────────────────────────────────────────────────

    /// Register an agent and open its bus channel.
    ///
    /// Returns `true` when some queued task is already waiting on
    /// capabilities this agent declares.
    pub async fn register_agent(
        &self,
        caps: AgentCapabilities,
        handler: Arc<dyn MessageHandler<AgentMessage>>,
    ) -> OverseerResult<bool> {
        if caps.agent_id == ORCHESTRATOR_CHANNEL {
            return Err(OverseerError::Config(format!(
                "agent id '{ORCHESTRATOR_CHANNEL}' is reserved"
            )));
        }
        let agent_id = caps.agent_id.clone();
        let waiting = {
            let mut state = self.inner.state.lock().await;
            if state.agents.contains(&agent_id) || self.inner.bus.is_registered(&agent_id) {
                return Err(OverseerError::AgentAlreadyRegistered(agent_id));
            }
            self.inner.bus.register(&agent_id, handler)?;
            let waiting = state
                .tasks
                .values()
                .any(|t| t.status == TaskStatus::Pending && t.required_capabilities.is_subset(&caps.capabilities));
            state.agents.register(caps)?;
            waiting
        };
        self.inner.notify.notify_one();
        Ok(waiting)
    }

    /// Remove an agent. Any task it still held goes back to the queue.
    pub async fn unregister_agent(&self, agent_id: &str) -> OverseerResult<()> {
        let mut changes = self.inner.changes();
        {
            let mut guard = self.inner.state.lock().await;
            let st = &mut *guard;
            st.agents
                .unregister(agent_id)
                .ok_or_else(|| OverseerError::AgentNotFound(agent_id.to_string()))?;

            for task in st.tasks.values_mut() {
                if task.assigned_agent_id.as_deref() == Some(agent_id) && !task.is_terminal() {
                    task.requeue()?;
                    st.queue
                        .push(task.id, task.effective_priority, task.sequence);
                    changes.task(Write::Update, task);
                    info!(task_id = %task.id, agent_id = %agent_id, "Task requeued from departing agent");
                }
            }
            self.inner.persist(changes).await;
        }
        if self.inner.bus.is_registered(agent_id) {
            self.inner.bus.unregister(agent_id).await?;
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    // ── Workflows ───────────────────────────────────────────────

    /// Add or replace a workflow template.
    pub async fn register_template(&self, template: WorkflowTemplate) -> OverseerResult<()> {
        template.validate()?;
        info!(template = %template.name, steps = template.steps.len(), "Workflow template registered");
        self.inner
            .state
            .lock()
            .await
            .templates
            .insert(template.name.clone(), template);
        Ok(())
    }

    pub async fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state.lock().await.templates.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start a workflow from a registered template; its first step is queued
    /// immediately.
    pub async fn execute_workflow(
        &self,
        template_name: &str,
        initial_parameters: Map<String, Value>,
    ) -> OverseerResult<WorkflowId> {
        let mut changes = self.inner.changes();
        let workflow_id = {
            let mut guard = self.inner.state.lock().await;
            let st = &mut *guard;
            let template = st
                .templates
                .get(template_name)
                .ok_or_else(|| OverseerError::TemplateNotFound(template_name.to_string()))?;
            let mut workflow = WorkflowInstance::new(template, initial_parameters);
            let first = workflow.current_step_request().ok_or_else(|| {
                OverseerError::Config(format!("workflow '{template_name}' has no steps"))
            })?;
            let task_id = st.enqueue(first, &mut changes);
            workflow.attach_task(task_id);
            changes.workflow(Write::Create, &workflow);
            info!(workflow_id = %workflow.id, template = %template_name, "Workflow started");
            let id = workflow.id;
            st.workflows.insert(id, workflow);
            self.inner.persist(changes).await;
            id
        };
        self.inner.notify.notify_one();
        Ok(workflow_id)
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> OverseerResult<WorkflowInstance> {
        self.inner
            .state
            .lock()
            .await
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| OverseerError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Mark the workflow cancelled and cancel its running step.
    pub async fn cancel_workflow(&self, workflow_id: WorkflowId) -> OverseerResult<()> {
        let mut changes = self.inner.changes();
        {
            let mut guard = self.inner.state.lock().await;
            let st = &mut *guard;
            let workflow = st
                .workflows
                .get_mut(&workflow_id)
                .ok_or_else(|| OverseerError::WorkflowNotFound(workflow_id.to_string()))?;
            if !workflow.is_running() {
                return Ok(());
            }
            let current = workflow.current_task();
            workflow.cancel();
            changes.workflow(Write::Update, workflow);
            info!(workflow_id = %workflow_id, "Workflow cancelled");

            if let Some(task_id) = current {
                self.inner.cancel_locked(st, task_id, &mut changes)?;
            }
            self.inner.persist(changes).await;
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    // ── Administration ──────────────────────────────────────────

    pub async fn get_system_status(&self) -> SystemStatus {
        let (tasks, agents, workflows) = {
            let state = self.inner.state.lock().await;
            (
                TaskCounts::tally(state.tasks.values()),
                state.agents.snapshot(),
                WorkflowCounts::tally(state.workflows.values()),
            )
        };
        let rate_limits: BTreeMap<_, _> = self.inner.limiter.usage_snapshot().await.into_iter().collect();
        SystemStatus {
            generated_at: Utc::now(),
            running: self.is_running(),
            tasks,
            agents,
            workflows,
            circuit_breakers: self.inner.breakers.snapshots(),
            rate_limits,
            bus: self.inner.bus.stats(),
        }
    }

    /// Tool usage aggregates; empty when no tool registry is attached.
    pub fn get_usage_report(&self, window: Option<Duration>) -> UsageReport {
        match &self.inner.tools {
            Some(tools) => tools.usage_report(window),
            None => UsageLedger::new().report(window),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Open the feedback channel and spawn the dispatch loop.
    pub fn start(&self) -> OverseerResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(OverseerError::Orchestrator("already running".into()));
        }
        let handler = Arc::new(FeedbackHandler {
            inner: Arc::downgrade(&self.inner),
        });
        let opened = self
            .inner
            .bus
            .register(ORCHESTRATOR_CHANNEL, handler)
            .and_then(|()| {
                self.inner
                    .bus
                    .subscribe(ORCHESTRATOR_CHANNEL, &self.inner.config.feedback_topic)
            });
        if let Err(e) = opened {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let handle = tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            self.inner.shutdown.subscribe(),
        ));
        *self.inner.dispatcher.lock() = Some(handle);
        info!(feedback_topic = %self.inner.config.feedback_topic, "Orchestrator started");
        Ok(())
    }

    /// Stop the dispatch loop and every bus channel, and wait for them.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);
        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }
        self.inner.bus.shutdown().await;
        info!("Orchestrator shut down");
    }
}
