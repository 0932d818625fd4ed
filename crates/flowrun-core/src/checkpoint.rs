//! Checkpoint approval types.

use crate::{ApprovalStatus, StepId, TaskId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What to do with a checkpoint whose deadline elapsed unresolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutDisposition {
    /// Treat the timeout as a rejection.
    #[default]
    Reject,
    /// Treat the timeout as an approval.
    Approve,
}

/// An approval gate created when dispatch reaches a checkpointed step.
///
/// Resolution is a status transition; the record stays around for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointApproval {
    /// Task the gated step belongs to.
    pub task_id: TaskId,

    /// The gated step.
    pub step_id: StepId,

    /// Current approval status.
    pub status: ApprovalStatus,

    /// True when a learned rule resolved this approval without waiting.
    pub auto_approved: bool,

    /// Key matched against learned auto-approval rules.
    pub preference_key: Option<String>,

    /// Feedback or rejection reason from the resolving actor.
    pub feedback: Option<String>,

    /// When the approval was requested.
    pub requested_at: DateTime<Utc>,

    /// When the approval was resolved, if it has been.
    pub resolved_at: Option<DateTime<Utc>>,

    /// Deadline after which the approval times out.
    pub timeout_at: DateTime<Utc>,
}

impl CheckpointApproval {
    /// Create a pending approval with a deadline `timeout_minutes` from now.
    pub fn new(
        task_id: TaskId,
        step_id: StepId,
        preference_key: Option<String>,
        timeout_minutes: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            step_id,
            status: ApprovalStatus::Pending,
            auto_approved: false,
            preference_key,
            feedback: None,
            requested_at: now,
            resolved_at: None,
            timeout_at: now + Duration::minutes(timeout_minutes),
        }
    }

    /// Resolve as approved, with optional feedback.
    pub fn approve(&mut self, feedback: Option<String>) {
        self.status = ApprovalStatus::Approved;
        self.feedback = feedback;
        self.resolved_at = Some(Utc::now());
    }

    /// Resolve as approved by a learned rule, without waiting.
    pub fn auto_approve(&mut self) {
        self.status = ApprovalStatus::Approved;
        self.auto_approved = true;
        self.resolved_at = Some(Utc::now());
    }

    /// Resolve as rejected with a reason.
    pub fn reject(&mut self, reason: impl Into<String>) {
        self.status = ApprovalStatus::Rejected;
        self.feedback = Some(reason.into());
        self.resolved_at = Some(Utc::now());
    }

    /// Resolve as timed out.
    pub fn time_out(&mut self) {
        self.status = ApprovalStatus::TimedOut;
        self.resolved_at = Some(Utc::now());
    }

    /// True when the deadline has elapsed and the approval is unresolved.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && now >= self.timeout_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approval() -> CheckpointApproval {
        CheckpointApproval::new(TaskId::generate(), StepId::new("deploy"), None, 30)
    }

    #[test]
    fn test_new_approval_is_pending() {
        let a = approval();
        assert_eq!(a.status, ApprovalStatus::Pending);
        assert!(!a.auto_approved);
        assert!(a.resolved_at.is_none());
        assert!(a.timeout_at > a.requested_at);
    }

    #[test]
    fn test_approve_sets_resolution() {
        let mut a = approval();
        a.approve(Some("looks good".to_string()));
        assert_eq!(a.status, ApprovalStatus::Approved);
        assert_eq!(a.feedback.as_deref(), Some("looks good"));
        assert!(a.resolved_at.is_some());
        assert!(!a.auto_approved);
    }

    #[test]
    fn test_auto_approve_records_flag() {
        let mut a = approval();
        a.auto_approve();
        assert_eq!(a.status, ApprovalStatus::Approved);
        assert!(a.auto_approved);
    }

    #[test]
    fn test_overdue_only_while_pending() {
        let mut a = approval();
        let past_deadline = a.timeout_at + Duration::minutes(1);
        assert!(a.is_overdue(past_deadline));
        a.reject("no");
        assert!(!a.is_overdue(past_deadline));
    }
}
