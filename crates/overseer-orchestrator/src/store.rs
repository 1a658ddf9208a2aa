//! Persistence of task and workflow records.
//!
//! The orchestrator keeps its authoritative state in memory and mirrors every
//! change to an optional [`RecordStore`]. Store failures are logged by the
//! engine and never fail the operation that produced the change.

use crate::types::{Task, TaskId, WorkflowId};
use crate::workflow::WorkflowInstance;
use async_trait::async_trait;
use overseer_core::{OverseerError, OverseerResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> OverseerResult<()>;
    async fn get_task(&self, id: TaskId) -> OverseerResult<Option<Task>>;
    async fn update_task(&self, task: &Task) -> OverseerResult<()>;
    async fn create_workflow(&self, workflow: &WorkflowInstance) -> OverseerResult<()>;
    async fn get_workflow(&self, id: WorkflowId) -> OverseerResult<Option<WorkflowInstance>>;
    async fn update_workflow(&self, workflow: &WorkflowInstance) -> OverseerResult<()>;
}

/// Process-local store, mostly useful in tests.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    workflows: RwLock<HashMap<WorkflowId, WorkflowInstance>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn create_task(&self, task: &Task) -> OverseerResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(OverseerError::Store(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> OverseerResult<Option<Task>> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn update_task(&self, task: &Task) -> OverseerResult<()> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn create_workflow(&self, workflow: &WorkflowInstance) -> OverseerResult<()> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(OverseerError::Store(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> OverseerResult<Option<WorkflowInstance>> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn update_workflow(&self, workflow: &WorkflowInstance) -> OverseerResult<()> {
        self.workflows
            .write()
            .await
            .insert(workflow.id, workflow.clone());
        Ok(())
    }
}

/// One pretty-printed JSON file per record under `<dir>/tasks` and
/// `<dir>/workflows`.
pub struct JsonFileStore {
    tasks_dir: PathBuf,
    workflows_dir: PathBuf,
}

impl JsonFileStore {
    pub async fn new(dir: impl AsRef<Path>) -> OverseerResult<Self> {
        let dir = dir.as_ref();
        let tasks_dir = dir.join("tasks");
        let workflows_dir = dir.join("workflows");
        tokio::fs::create_dir_all(&tasks_dir).await?;
        tokio::fs::create_dir_all(&workflows_dir).await?;
        Ok(Self {
            tasks_dir,
            workflows_dir,
        })
    }

    fn record_path(dir: &Path, id: Uuid) -> PathBuf {
        dir.join(format!("{id}.json"))
    }

    async fn write<T: Serialize + Sync>(path: PathBuf, record: &T) -> OverseerResult<()> {
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn read<T: DeserializeOwned>(path: PathBuf) -> OverseerResult<Option<T>> {
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_str(&data).map_err(|e| {
            OverseerError::Store(format!("failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(record))
    }

    /// Ids of every stored task.
    pub async fn list_tasks(&self) -> OverseerResult<Vec<TaskId>> {
        let mut entries = tokio::fs::read_dir(&self.tasks_dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn create_task(&self, task: &Task) -> OverseerResult<()> {
        Self::write(Self::record_path(&self.tasks_dir, task.id), task).await
    }

    async fn get_task(&self, id: TaskId) -> OverseerResult<Option<Task>> {
        Self::read(Self::record_path(&self.tasks_dir, id)).await
    }

    async fn update_task(&self, task: &Task) -> OverseerResult<()> {
        self.create_task(task).await
    }

    async fn create_workflow(&self, workflow: &WorkflowInstance) -> OverseerResult<()> {
        Self::write(Self::record_path(&self.workflows_dir, workflow.id), workflow).await
    }

    async fn get_workflow(&self, id: WorkflowId) -> OverseerResult<Option<WorkflowInstance>> {
        Self::read(Self::record_path(&self.workflows_dir, id)).await
    }

    async fn update_workflow(&self, workflow: &WorkflowInstance) -> OverseerResult<()> {
        self.create_workflow(workflow).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::workflow::{WorkflowStep, WorkflowTemplate};
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryStore::new();
        let mut task = Task::new("Summarize", "research");
        store.create_task(&task).await.unwrap();
        assert!(store.create_task(&task).await.is_err());

        task.fail("no sources").unwrap();
        store.update_task(&task).await.unwrap();
        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.error.as_deref(), Some("no sources"));
        assert_eq!(store.task_count().await, 1);
    }

    #[tokio::test]
    async fn test_json_file_store_persists_tasks_and_workflows() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(tmp.path()).await.unwrap();

        let mut task = Task::new("Build index", "data_analysis");
        task.assign("analyst-1").unwrap();
        task.complete(json!({"rows": 42})).unwrap();
        store.create_task(&task).await.unwrap();

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded, task);
        assert_eq!(store.list_tasks().await.unwrap(), vec![task.id]);
        assert!(store.get_task(Uuid::new_v4()).await.unwrap().is_none());

        let template = WorkflowTemplate::new("one", vec![WorkflowStep::new("s", "research")]);
        let wf = WorkflowInstance::new(&template, Map::new());
        store.create_workflow(&wf).await.unwrap();
        let loaded = store.get_workflow(wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.template, "one");
        assert!(tmp.path().join("workflows").join(format!("{}.json", wf.id)).exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_store_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(tmp.path()).await.unwrap();
        let id = Uuid::new_v4();
        std::fs::write(tmp.path().join("tasks").join(format!("{id}.json")), "{not json").unwrap();
        let err = store.get_task(id).await.unwrap_err();
        assert!(matches!(err, OverseerError::Store(_)));
    }
}
