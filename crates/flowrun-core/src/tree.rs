//! Execution tree: the runtime status ledger for steps.
//!
//! Node lifecycle is tracked independently of `TaskStep.status` so status
//! queries and pause/resume never re-serialize the whole Task. Each node
//! carries a generation counter: pausing bumps it, and results reported
//! with a stale generation are ignored, which closes the race where an
//! external job completes between the pause snapshot and its cancellation.

use crate::{JobId, NodeStatus, StepId, TaskId, TreeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Runtime status record for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Step this node tracks.
    pub step_id: StepId,

    /// Current node status.
    pub status: NodeStatus,

    /// Fencing counter; results with a stale generation are ignored.
    pub generation: u64,

    /// External job identifier used for out-of-band cancellation.
    pub external_job_id: Option<JobId>,

    /// Resolved inputs persisted at dispatch time for audit.
    pub resolved_inputs: Option<Value>,

    /// Anything else worth recording about this node.
    pub metadata: HashMap<String, Value>,

    /// Last status transition time.
    pub updated_at: DateTime<Utc>,
}

impl TreeNode {
    /// Create a pending node for a step.
    pub fn new(step_id: StepId) -> Self {
        Self {
            step_id,
            status: NodeStatus::Pending,
            generation: 0,
            external_job_id: None,
            resolved_inputs: None,
            metadata: HashMap::new(),
            updated_at: Utc::now(),
        }
    }

    fn transition(&mut self, status: NodeStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// The runtime status ledger for one task's steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTree {
    /// Tree identifier, referenced from the Task.
    pub id: TreeId,

    /// Task this tree belongs to.
    pub task_id: TaskId,

    /// Nodes indexed by step id.
    pub nodes: HashMap<StepId, TreeNode>,
}

impl ExecutionTree {
    /// Create a tree with a pending node per step id.
    pub fn new(id: TreeId, task_id: TaskId, step_ids: impl IntoIterator<Item = StepId>) -> Self {
        let nodes = step_ids
            .into_iter()
            .map(|sid| (sid.clone(), TreeNode::new(sid)))
            .collect();
        Self { id, task_id, nodes }
    }

    /// Get a node by step id.
    pub fn node(&self, step_id: &StepId) -> Option<&TreeNode> {
        self.nodes.get(step_id)
    }

    /// Mark a node RUNNING with its external job id; returns the generation
    /// the caller must present when reporting the result.
    pub fn start_node(&mut self, step_id: &StepId, job_id: JobId) -> Option<u64> {
        let node = self.nodes.get_mut(step_id)?;
        node.external_job_id = Some(job_id);
        node.transition(NodeStatus::Running);
        Some(node.generation)
    }

    /// Persist resolved inputs on a node for audit.
    pub fn record_resolved_inputs(&mut self, step_id: &StepId, inputs: Value) {
        if let Some(node) = self.nodes.get_mut(step_id) {
            node.resolved_inputs = Some(inputs);
            node.updated_at = Utc::now();
        }
    }

    /// Apply a job result to a node.
    ///
    /// The result is accepted only when the node is still RUNNING and the
    /// reported generation matches; a late completion for a node paused
    /// after dispatch is dropped. Returns whether the result was applied.
    pub fn record_result(&mut self, step_id: &StepId, generation: u64, success: bool) -> bool {
        let Some(node) = self.nodes.get_mut(step_id) else {
            return false;
        };
        if node.status != NodeStatus::Running || node.generation != generation {
            return false;
        }
        node.transition(if success {
            NodeStatus::Done
        } else {
            NodeStatus::Failed
        });
        true
    }

    /// Pause every RUNNING node.
    ///
    /// Each paused node's generation is bumped so in-flight results are
    /// fenced out; returns the external job ids for the caller to cancel
    /// out-of-band.
    pub fn pause(&mut self) -> Vec<JobId> {
        let mut job_ids = Vec::new();
        for node in self.nodes.values_mut() {
            if node.status == NodeStatus::Running {
                node.generation += 1;
                node.transition(NodeStatus::Paused);
                if let Some(job_id) = &node.external_job_id {
                    job_ids.push(job_id.clone());
                }
            }
        }
        job_ids
    }

    /// Transition every PAUSED node back to PENDING; returns the count.
    pub fn resume(&mut self) -> usize {
        let mut count = 0;
        for node in self.nodes.values_mut() {
            if node.status == NodeStatus::Paused {
                node.external_job_id = None;
                node.transition(NodeStatus::Pending);
                count += 1;
            }
        }
        count
    }

    /// Status counts for observability, without touching the Task.
    pub fn status_counts(&self) -> HashMap<NodeStatus, usize> {
        let mut counts = HashMap::new();
        for node in self.nodes.values() {
            *counts.entry(node.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(step_ids: &[&str]) -> ExecutionTree {
        ExecutionTree::new(
            TreeId::generate(),
            TaskId::generate(),
            step_ids.iter().map(|s| StepId::new(*s)),
        )
    }

    #[test]
    fn test_pause_collects_running_job_ids_only() {
        let mut t = tree(&["a", "b"]);
        let job = JobId::new("job-a");
        t.start_node(&StepId::new("a"), job.clone());

        let paused = t.pause();
        assert_eq!(paused, vec![job]);
        assert_eq!(t.node(&StepId::new("a")).unwrap().status, NodeStatus::Paused);
        assert_eq!(t.node(&StepId::new("b")).unwrap().status, NodeStatus::Pending);
    }

    #[test]
    fn test_resume_returns_count() {
        let mut t = tree(&["a", "b"]);
        t.start_node(&StepId::new("a"), JobId::generate());
        t.pause();

        assert_eq!(t.resume(), 1);
        assert_eq!(t.node(&StepId::new("a")).unwrap().status, NodeStatus::Pending);
    }

    #[test]
    fn test_stale_generation_result_ignored() {
        let mut t = tree(&["a"]);
        let step = StepId::new("a");
        let generation = t.start_node(&step, JobId::generate()).unwrap();

        // Pause after dispatch: the job's eventual completion carries the
        // pre-pause generation and must not resurrect the node.
        t.pause();
        assert!(!t.record_result(&step, generation, true));
        assert_eq!(t.node(&step).unwrap().status, NodeStatus::Paused);
    }

    #[test]
    fn test_result_applies_to_running_node() {
        let mut t = tree(&["a"]);
        let step = StepId::new("a");
        let generation = t.start_node(&step, JobId::generate()).unwrap();

        assert!(t.record_result(&step, generation, true));
        assert_eq!(t.node(&step).unwrap().status, NodeStatus::Done);
    }

    #[test]
    fn test_result_for_pending_node_ignored() {
        let mut t = tree(&["a"]);
        assert!(!t.record_result(&StepId::new("a"), 0, true));
    }

    #[test]
    fn test_restart_after_resume_uses_new_generation() {
        let mut t = tree(&["a"]);
        let step = StepId::new("a");
        let stale = t.start_node(&step, JobId::generate()).unwrap();
        t.pause();
        t.resume();

        let fresh = t.start_node(&step, JobId::generate()).unwrap();
        assert_ne!(stale, fresh);
        assert!(!t.record_result(&step, stale, false));
        assert!(t.record_result(&step, fresh, true));
    }
}
