//! Execution tree manager: storage and locking around the core tree.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use flowrun_core::{ExecutionTree, JobId, NodeStatus, StepId, Task, TreeId};

/// Tree manager errors.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Execution tree not found: {0}")]
    TreeNotFound(TreeId),
}

/// Holds every live execution tree, keyed by tree id.
#[derive(Default)]
pub struct ExecutionTreeManager {
    trees: RwLock<HashMap<TreeId, ExecutionTree>>,
}

impl ExecutionTreeManager {
    /// Create an empty manager wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create (or replace) the tree for a task, one pending node per step.
    pub async fn create_for_task(&self, task: &Task) -> TreeId {
        let tree = ExecutionTree::new(
            task.tree_id.clone(),
            task.id.clone(),
            task.steps.iter().map(|s| s.id.clone()),
        );
        let tree_id = tree.id.clone();
        self.trees.write().await.insert(tree_id.clone(), tree);
        tree_id
    }

    /// Snapshot of a tree.
    pub async fn get(&self, tree_id: &TreeId) -> Option<ExecutionTree> {
        self.trees.read().await.get(tree_id).cloned()
    }

    /// Mark a node RUNNING; returns the generation to present with the
    /// job's result.
    pub async fn start_node(
        &self,
        tree_id: &TreeId,
        step_id: &StepId,
        job_id: JobId,
    ) -> Result<u64, TreeError> {
        let mut trees = self.trees.write().await;
        let tree = trees
            .get_mut(tree_id)
            .ok_or_else(|| TreeError::TreeNotFound(tree_id.clone()))?;
        tree.start_node(step_id, job_id)
            .ok_or_else(|| TreeError::TreeNotFound(tree_id.clone()))
    }

    /// Persist resolved inputs on a node for audit.
    pub async fn record_resolved_inputs(
        &self,
        tree_id: &TreeId,
        step_id: &StepId,
        inputs: serde_json::Value,
    ) -> Result<(), TreeError> {
        let mut trees = self.trees.write().await;
        let tree = trees
            .get_mut(tree_id)
            .ok_or_else(|| TreeError::TreeNotFound(tree_id.clone()))?;
        tree.record_resolved_inputs(step_id, inputs);
        Ok(())
    }

    /// Apply a job result; stale generations and non-RUNNING nodes are
    /// ignored. Returns whether the result was applied.
    pub async fn record_result(
        &self,
        tree_id: &TreeId,
        step_id: &StepId,
        generation: u64,
        success: bool,
    ) -> Result<bool, TreeError> {
        let mut trees = self.trees.write().await;
        let tree = trees
            .get_mut(tree_id)
            .ok_or_else(|| TreeError::TreeNotFound(tree_id.clone()))?;
        Ok(tree.record_result(step_id, generation, success))
    }

    /// Pause every RUNNING node in a tree; returns external job ids for
    /// the caller to cancel out-of-band.
    pub async fn pause(&self, tree_id: &TreeId) -> Result<Vec<JobId>, TreeError> {
        let mut trees = self.trees.write().await;
        let tree = trees
            .get_mut(tree_id)
            .ok_or_else(|| TreeError::TreeNotFound(tree_id.clone()))?;
        let job_ids = tree.pause();
        info!(tree_id = %tree_id, paused = job_ids.len(), "Paused execution tree");
        Ok(job_ids)
    }

    /// Transition every PAUSED node back to PENDING; returns the count.
    pub async fn resume(&self, tree_id: &TreeId) -> Result<usize, TreeError> {
        let mut trees = self.trees.write().await;
        let tree = trees
            .get_mut(tree_id)
            .ok_or_else(|| TreeError::TreeNotFound(tree_id.clone()))?;
        let count = tree.resume();
        info!(tree_id = %tree_id, resumed = count, "Resumed execution tree");
        Ok(count)
    }

    /// Node status counts for one tree.
    pub async fn status_counts(
        &self,
        tree_id: &TreeId,
    ) -> Result<HashMap<NodeStatus, usize>, TreeError> {
        let trees = self.trees.read().await;
        trees
            .get(tree_id)
            .map(|t| t.status_counts())
            .ok_or_else(|| TreeError::TreeNotFound(tree_id.clone()))
    }

    /// Drop a tree, e.g. when its task is deleted.
    pub async fn remove(&self, tree_id: &TreeId) {
        self.trees.write().await.remove(tree_id);
    }
}
