//! Task orchestration for Overseer.
//!
//! Callers submit tasks to the [`Orchestrator`], which keeps them in a
//! priority queue and dispatches each one to an idle agent that declares the
//! required capabilities. Agents are bus participants: they receive
//! [`AgentMessage::AssignTask`] on their own channel and report back on the
//! feedback topic. Workflows chain tasks step by step, handing each step the
//! previous step's result.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Queue, dispatch loop, feedback handling and workflows.
//! - [`OrchestratorBuilder`]: Injects the bus, store, breakers, limiter and tools.
//! - [`TaskQueue`]: Priority queue keyed by `(priority, creation sequence)`.
//! - [`AgentMonitor`]: Agent registrations, reservations and metrics.
//! - [`WorkflowTemplate`], [`WorkflowInstance`]: The step sequencer.
//! - [`WorkerAgent`]: Adapts an [`AgentWorker`] to the bus protocol.
//! - [`RecordStore`]: Persistence of task and workflow records.
//! - [`Scheduler`]: Cron-based submission of recurring work.

/// Engine tunables.
pub mod config;
/// The orchestration engine.
pub mod engine;
/// Messages exchanged with agents.
pub mod messages;
/// Agent registry and metrics.
pub mod monitor;
/// Cron-based job scheduler.
pub mod scheduler;
/// Depth- and fan-out-limited subtask creation.
pub mod spawner;
/// Operator-facing status snapshot.
pub mod status;
/// Task and workflow persistence.
pub mod store;
/// Priority task queue.
pub mod task_queue;
/// Tasks, priorities and agent types.
pub mod types;
/// Bus adapter for task executors.
pub mod worker;
/// Workflow templates and instances.
pub mod workflow;

pub use config::OrchestratorConfig;
pub use engine::{CancelOutcome, Orchestrator, OrchestratorBuilder, StalePolicy, ORCHESTRATOR_CHANNEL};
pub use messages::{AgentMessage, TaskUpdate};
pub use monitor::AgentMonitor;
pub use scheduler::{ScheduleTarget, ScheduledJob, Scheduler, SchedulerHandle};
pub use spawner::{SubtaskRequest, SubtaskSpawner};
pub use status::{SystemStatus, TaskCounts, WorkflowCounts};
pub use store::{InMemoryStore, JsonFileStore, RecordStore};
pub use task_queue::{QueueEntry, TaskQueue};
pub use types::{
    AgentCapabilities, AgentMetrics, AgentRegistration, AgentRole, AgentStatus, Task, TaskId,
    TaskMetadata, TaskPriority, TaskRequest, TaskStatus, WorkflowId,
};
pub use worker::{AgentWorker, WorkerAgent, WorkerContext};
pub use workflow::{StepResult, WorkflowInstance, WorkflowStatus, WorkflowStep, WorkflowTemplate};
