//! Task store port and in-memory implementation.
//!
//! The store is the single mutation path for Task documents. Updates are
//! optimistic: a patch carries the version the writer read, and the store
//! rejects the write when the stored version has moved on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use flowrun_core::{StepId, StepStatus, Task, TaskId, TaskStatus};

/// Task store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already exists: {0}")]
    TaskExists(TaskId),

    #[error("Stale write for task {task_id}: expected version {expected}, stored {actual}")]
    VersionConflict {
        task_id: TaskId,
        expected: u64,
        actual: u64,
    },
}

/// Partial update applied to a Task through the store.
///
/// Only set fields are written. `step_updates` merges per-step status,
/// outputs, and error without replacing the whole step list.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    /// New task status.
    pub status: Option<TaskStatus>,

    /// New current step index.
    pub current_step_index: Option<usize>,

    /// Findings appended to `accumulated_findings`.
    pub append_findings: Vec<Value>,

    /// Per-step updates.
    pub step_updates: Vec<StepUpdate>,
}

/// Update to one step inside a task.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    /// Step to update.
    pub step_id: StepId,

    /// New step status.
    pub status: StepStatus,

    /// Outputs recorded when the step is DONE.
    pub outputs: Option<HashMap<String, Value>>,

    /// Error recorded when the step FAILED.
    pub error: Option<String>,
}

impl TaskPatch {
    /// A patch that only changes the task status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Builder method to add a step update.
    pub fn with_step_update(mut self, update: StepUpdate) -> Self {
        self.step_updates.push(update);
        self
    }

    /// Builder method to append a finding.
    pub fn with_finding(mut self, finding: Value) -> Self {
        self.append_findings.push(finding);
        self
    }
}

/// Durable keyed storage for Task documents.
///
/// Implementations must give the orchestrator read-your-writes consistency
/// within its own process and reject stale writes via the version check.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetch a task by id.
    async fn get_task(&self, id: &TaskId) -> Option<Task>;

    /// Create a task; fails if the id already exists.
    async fn create_task(&self, task: Task) -> Result<Task, StoreError>;

    /// Apply a partial update, rejecting the write when `expected_version`
    /// no longer matches. Returns the updated task (version bumped).
    async fn update_task(
        &self,
        id: &TaskId,
        patch: TaskPatch,
        expected_version: u64,
    ) -> Result<Task, StoreError>;
}

/// In-memory task store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    /// Create an empty store wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    async fn create_task(&self, task: Task) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::TaskExists(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn update_task(
        &self,
        id: &TaskId,
        patch: TaskPatch,
        expected_version: u64,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.clone()))?;

        if task.version != expected_version {
            return Err(StoreError::VersionConflict {
                task_id: id.clone(),
                expected: expected_version,
                actual: task.version,
            });
        }

        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(index) = patch.current_step_index {
            task.current_step_index = index;
        }
        task.accumulated_findings.extend(patch.append_findings);
        for update in patch.step_updates {
            if let Some(step) = task.step_mut(&update.step_id) {
                step.status = update.status;
                if let Some(outputs) = update.outputs {
                    step.outputs = outputs;
                }
                if update.error.is_some() {
                    step.error = update.error;
                }
            }
        }
        task.version += 1;

        Ok(task.clone())
    }
}
