use crate::engine::Orchestrator;
use crate::types::{TaskMetadata, TaskPriority};
use chrono::{DateTime, Utc};
use cron::Schedule;
use overseer_core::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What a job submits when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleTarget {
    Task {
        description: String,
        task_type: String,
        #[serde(default)]
        priority: TaskPriority,
    },
    Workflow {
        template: String,
        #[serde(default)]
        parameters: Map<String, Value>,
    },
}

/// A single scheduled job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    pub cron_expression: String,
    pub target: ScheduleTarget,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduledJob {
    pub fn validate(&self) -> OverseerResult<()> {
        Scheduler::parse_cron(&self.cron_expression).map(|_| ())
    }
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Scheduler loop ended abnormally");
        }
    }
}

/// Cron-based scheduler that submits work to an [`Orchestrator`].
#[derive(Debug)]
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    /// Create a scheduler, rejecting jobs with invalid cron expressions.
    pub fn new(jobs: Vec<ScheduledJob>) -> OverseerResult<Self> {
        for job in &jobs {
            job.validate()?;
        }
        Ok(Self { jobs })
    }

    /// Parse a cron expression string into a [`cron::Schedule`].
    ///
    /// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
    pub fn parse_cron(cron_expr: &str) -> OverseerResult<Schedule> {
        Schedule::from_str(cron_expr).map_err(|e| {
            OverseerError::Config(format!("Invalid cron expression '{cron_expr}': {e}"))
        })
    }

    /// First fire time of `cron_expr` strictly after `after`.
    pub fn next_fire_after(cron_expr: &str, after: DateTime<Utc>) -> OverseerResult<DateTime<Utc>> {
        let schedule = Self::parse_cron(cron_expr)?;
        schedule.after(&after).next().ok_or_else(|| {
            OverseerError::Config(format!(
                "Cron expression '{cron_expr}' has no upcoming fire times"
            ))
        })
    }

    pub fn next_fire_time(cron_expr: &str) -> OverseerResult<DateTime<Utc>> {
        Self::next_fire_after(cron_expr, Utc::now())
    }

    pub fn enabled_jobs(&self) -> Vec<&ScheduledJob> {
        self.jobs.iter().filter(|j| j.enabled).collect()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Submit `job`'s target to `orchestrator`.
    pub async fn fire(orchestrator: &Orchestrator, job: &ScheduledJob) -> OverseerResult<()> {
        match &job.target {
            ScheduleTarget::Task {
                description,
                task_type,
                priority,
            } => {
                let mut metadata = TaskMetadata::default();
                metadata
                    .extra
                    .insert("scheduled_by".into(), Value::String(job.name.clone()));
                let id = orchestrator
                    .submit_task(description.as_str(), task_type.as_str(), *priority, metadata)
                    .await;
                info!(job = %job.name, task_id = %id, "Scheduled task submitted");
            }
            ScheduleTarget::Workflow {
                template,
                parameters,
            } => {
                let id = orchestrator
                    .execute_workflow(template, parameters.clone())
                    .await?;
                info!(job = %job.name, workflow_id = %id, "Scheduled workflow started");
            }
        }
        Ok(())
    }

    /// Spawn the scheduler loop.
    ///
    /// The loop sleeps until the nearest fire time among enabled jobs and
    /// submits every job due at that instant.
    pub fn start(self, orchestrator: Orchestrator) -> SchedulerHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let jobs: Vec<ScheduledJob> = self.jobs.into_iter().filter(|j| j.enabled).collect();
            if jobs.is_empty() {
                info!("Scheduler: no enabled jobs");
                let _ = stopped.changed().await;
                return;
            }

            let mut cursor = Utc::now();
            loop {
                let mut due: Vec<(&ScheduledJob, DateTime<Utc>)> = Vec::new();
                for job in &jobs {
                    match Self::next_fire_after(&job.cron_expression, cursor) {
                        Ok(next) => due.push((job, next)),
                        Err(e) => warn!(job = %job.name, error = %e, "Skipping job"),
                    }
                }
                let Some(nearest) = due.iter().map(|(_, t)| *t).min() else {
                    info!("Scheduler: no upcoming fire times");
                    let _ = stopped.changed().await;
                    return;
                };

                let wait = (nearest - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stopped.changed() => break,
                }

                for (job, at) in due.iter().filter(|(_, t)| *t == nearest) {
                    if let Err(e) = Self::fire(&orchestrator, job).await {
                        warn!(job = %job.name, fire_time = %at, error = %e, "Scheduled job failed");
                    }
                }
                cursor = nearest;
            }
            info!("Scheduler stopped");
        });
        SchedulerHandle { stop, task }
    }
}
