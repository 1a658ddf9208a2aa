//! Workflow templates and the step sequencer.
//!
//! A [`WorkflowInstance`] runs its template's steps strictly one after the
//! other. Each step becomes a task requiring the step's capability; the
//! result of step *i* is handed to step *i + 1* as `previous_result`, and all
//! results so far as `workflow_results`.

use crate::types::{TaskId, TaskMetadata, TaskRequest, WorkflowId};
use chrono::{DateTime, Utc};
use overseer_core::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use uuid::Uuid;

/// One step of a workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Capability the step's task requires.
    pub capability: String,
    /// What the agent should do; passed to the task as the `action` parameter.
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capability: capability.into(),
            action: String::new(),
            parameters: Map::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps,
        }
    }

    pub fn validate(&self) -> OverseerResult<()> {
        if self.name.trim().is_empty() {
            return Err(OverseerError::Config("workflow name must not be empty".into()));
        }
        if self.steps.is_empty() {
            return Err(OverseerError::Config(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(OverseerError::Config(format!(
                    "workflow '{}' repeats step id '{}'",
                    self.name, step.id
                )));
            }
            if step.capability.trim().is_empty() {
                return Err(OverseerError::Config(format!(
                    "workflow '{}' step '{}' has no capability",
                    self.name, step.id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Result of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub task_id: TaskId,
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}

/// A running or finished execution of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub template: String,
    pub steps: Vec<WorkflowStep>,
    pub current_step_index: usize,
    pub status: WorkflowStatus,
    /// Completed step results, in step order.
    pub results: Vec<StepResult>,
    /// Task spawned for each step so far, in step order.
    pub step_tasks: Vec<TaskId>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub initial_parameters: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(template: &WorkflowTemplate, initial_parameters: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            template: template.name.clone(),
            steps: template.steps.clone(),
            current_step_index: 0,
            status: WorkflowStatus::InProgress,
            results: Vec::new(),
            step_tasks: Vec::new(),
            failed_step: None,
            error: None,
            initial_parameters,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::InProgress
    }

    pub fn current_step(&self) -> Option<&WorkflowStep> {
        self.steps.get(self.current_step_index)
    }

    /// Task currently executing the active step.
    pub fn current_task(&self) -> Option<TaskId> {
        self.step_tasks.get(self.current_step_index).copied()
    }

    /// Step results keyed by step id.
    pub fn results_map(&self) -> Map<String, Value> {
        self.results
            .iter()
            .map(|r| (r.step_id.clone(), r.result.clone()))
            .collect()
    }

    /// Build the task request for the active step.
    ///
    /// Parameters layer as: initial workflow parameters, then the step's
    /// static parameters, then `action`, `previous_result` and
    /// `workflow_results`.
    pub fn current_step_request(&self) -> Option<TaskRequest> {
        let step = self.current_step()?;
        let mut params = self.initial_parameters.clone();
        params.extend(step.parameters.clone());
        if !step.action.is_empty() {
            params.insert("action".into(), Value::String(step.action.clone()));
        }
        if let Some(prev) = self.results.last() {
            params.insert("previous_result".into(), prev.result.clone());
        }
        params.insert("workflow_results".into(), Value::Object(self.results_map()));

        let description = if step.name.is_empty() {
            format!("{} / {}", self.template, step.id)
        } else {
            format!("{} / {}", self.template, step.name)
        };
        Some(
            TaskRequest::new(description, step.capability.clone())
                .with_parameters(params)
                .with_metadata(TaskMetadata::for_workflow_step(self.id, step.id.clone())),
        )
    }

    pub fn attach_task(&mut self, task_id: TaskId) {
        self.step_tasks.push(task_id);
    }

    /// Record the active step's result. Returns `true` when another step
    /// remains to be spawned, `false` when the workflow just completed.
    pub fn record_step_result(&mut self, task_id: TaskId, result: Value) -> OverseerResult<bool> {
        if !self.is_running() {
            return Err(OverseerError::InvalidTransition(format!(
                "workflow {} is not running",
                self.id
            )));
        }
        let step_id = self.current_step().map(|s| s.id.clone()).ok_or_else(|| {
            OverseerError::InvalidTransition(format!("workflow {} has no active step", self.id))
        })?;
        self.results.push(StepResult {
            step_id,
            task_id,
            result,
            completed_at: Utc::now(),
        });
        self.current_step_index += 1;
        if self.current_step_index >= self.steps.len() {
            self.status = WorkflowStatus::Completed;
            self.completed_at = Some(Utc::now());
            Ok(false)
        } else {
            Ok(true)
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if !self.is_running() {
            return;
        }
        self.failed_step = self.current_step().map(|s| s.id.clone());
        self.error = Some(error.into());
        self.status = WorkflowStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        if !self.is_running() {
            return;
        }
        self.status = WorkflowStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline() -> WorkflowTemplate {
        WorkflowTemplate::new(
            "report",
            vec![
                WorkflowStep::new("collect", "research").with_action("gather sources"),
                WorkflowStep::new("analyze", "data_analysis").with_parameter("depth", json!(2)),
                WorkflowStep::new("review", "code_review"),
            ],
        )
    }

    #[test]
    fn test_validate() {
        assert!(pipeline().validate().is_ok());
        let empty = WorkflowTemplate::new("x", vec![]);
        assert!(empty.validate().is_err());
        let dup = WorkflowTemplate::new(
            "x",
            vec![WorkflowStep::new("a", "c"), WorkflowStep::new("a", "c")],
        );
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_step_requests_carry_previous_results() {
        let mut params = Map::new();
        params.insert("topic".into(), json!("rust"));
        let mut wf = WorkflowInstance::new(&pipeline(), params);

        let first = wf.current_step_request().unwrap();
        assert_eq!(first.task_type, "research");
        assert_eq!(first.parameters["topic"], json!("rust"));
        assert_eq!(first.parameters["action"], json!("gather sources"));
        assert!(!first.parameters.contains_key("previous_result"));
        assert_eq!(first.metadata.workflow_step_id.as_deref(), Some("collect"));

        let t1 = Uuid::new_v4();
        wf.attach_task(t1);
        assert!(wf.record_step_result(t1, json!(["a", "b"])).unwrap());

        let second = wf.current_step_request().unwrap();
        assert_eq!(second.parameters["previous_result"], json!(["a", "b"]));
        assert_eq!(
            second.parameters["workflow_results"],
            json!({"collect": ["a", "b"]})
        );
        assert_eq!(second.parameters["depth"], json!(2));
    }

    #[test]
    fn test_completes_after_last_step() {
        let mut wf = WorkflowInstance::new(&pipeline(), Map::new());
        for i in 0..3 {
            let t = Uuid::new_v4();
            wf.attach_task(t);
            let more = wf.record_step_result(t, json!(i)).unwrap();
            assert_eq!(more, i < 2);
        }
        assert_eq!(wf.status, WorkflowStatus::Completed);
        let ids: Vec<&str> = wf.results.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(ids, vec!["collect", "analyze", "review"]);
        assert!(wf.record_step_result(Uuid::new_v4(), json!(null)).is_err());
    }

    #[test]
    fn test_failure_records_step() {
        let mut wf = WorkflowInstance::new(&pipeline(), Map::new());
        let t = Uuid::new_v4();
        wf.attach_task(t);
        wf.record_step_result(t, json!(1)).unwrap();
        wf.fail("analysis crashed");
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.failed_step.as_deref(), Some("analyze"));
        assert_eq!(wf.error.as_deref(), Some("analysis crashed"));
        wf.cancel();
        assert_eq!(wf.status, WorkflowStatus::Failed);
    }
}
