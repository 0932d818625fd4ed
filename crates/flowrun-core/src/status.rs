//! Status enums for Tasks, Steps, Tree nodes, and Checkpoint approvals.

use serde::{Deserialize, Serialize};

/// Status of a Task in the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task created, steps still being planned.
    #[default]
    Planning,
    /// Plan accepted; no step has been dispatched yet.
    Ready,
    /// At least one step has been dispatched.
    Executing,
    /// Execution suspended; no new steps are scheduled.
    Paused,
    /// All steps reached a terminal state and the task succeeded.
    Completed,
    /// Task aborted due to step failure or stall.
    Failed,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the scheduler may dispatch new steps.
    pub fn can_schedule(&self) -> bool {
        matches!(self, Self::Ready | Self::Executing)
    }
}

/// Status of a single step within a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Step not yet dispatched.
    #[default]
    Pending,
    /// Step handed to an executor.
    Running,
    /// Step completed successfully; outputs populated.
    Done,
    /// Step failed after retries and fallbacks.
    Failed,
}

impl StepStatus {
    /// Returns true if the step is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Status of an Execution Tree node.
///
/// Node status is tracked independently of [`StepStatus`] so pause/resume
/// and status queries never re-serialize the whole Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Node not yet dispatched.
    #[default]
    Pending,
    /// Node dispatched; external job in flight.
    Running,
    /// External job reported success.
    Done,
    /// External job reported failure.
    Failed,
    /// Node suspended by a pause; its job id was handed back for cancellation.
    Paused,
}

/// Status of a checkpoint approval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// Waiting for an external actor or auto-approval rule.
    #[default]
    Pending,
    /// Approved; the step may execute.
    Approved,
    /// Rejected; the step is failed per its failure policy.
    Rejected,
    /// Deadline elapsed unresolved; configured disposition applies.
    TimedOut,
}

impl ApprovalStatus {
    /// Returns true if the approval has been resolved one way or another.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// How a step failure affects the rest of its task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailurePolicy {
    /// Any critical step failure aborts the whole task.
    #[default]
    AllOrNothing,
    /// Remaining independent work keeps being scheduled.
    BestEffort,
    /// Abort as soon as the first failure in a dispatched group is observed,
    /// even while siblings are still in flight.
    FailFast,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Executing.is_terminal());
    }

    #[test]
    fn test_paused_cannot_schedule() {
        assert!(!TaskStatus::Paused.can_schedule());
        assert!(TaskStatus::Executing.can_schedule());
        assert!(TaskStatus::Ready.can_schedule());
    }

    #[test]
    fn test_serde_rename() {
        let s = serde_json::to_string(&FailurePolicy::AllOrNothing).unwrap();
        assert_eq!(s, "\"ALL_OR_NOTHING\"");
        let s = serde_json::to_string(&ApprovalStatus::TimedOut).unwrap();
        assert_eq!(s, "\"TIMED_OUT\"");
    }
}
