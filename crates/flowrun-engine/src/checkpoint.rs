//! Checkpoint controller: approval gates for steps that require them.
//!
//! Dispatch stops at a `checkpoint_required` step until the approval
//! resolves. Resolution paths: explicit approve/reject from an external
//! actor, auto-approval from a learned preference rule, or timeout with a
//! configured default disposition.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use flowrun_core::{
    ApprovalStatus, CheckpointApproval, StepId, TaskId, TaskStep, TimeoutDisposition,
};

/// Checkpoint controller errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint pending for task {task_id} step {step_id}")]
    NotFound { task_id: TaskId, step_id: StepId },

    #[error("Checkpoint for task {task_id} step {step_id} already resolved: {status:?}")]
    AlreadyResolved {
        task_id: TaskId,
        step_id: StepId,
        status: ApprovalStatus,
    },
}

/// Policy knobs for checkpoint handling.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    /// Deadline applied when a step's checkpoint config does not set one.
    pub default_timeout_minutes: i64,

    /// Disposition applied to checkpoints that time out.
    pub on_timeout: TimeoutDisposition,

    /// Minimum approval ratio before a preference key auto-approves.
    pub confidence_threshold: f64,

    /// Minimum number of explicit resolutions before a preference key is
    /// trusted at all.
    pub min_observations: u32,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            default_timeout_minutes: 60,
            on_timeout: TimeoutDisposition::Reject,
            confidence_threshold: 0.8,
            min_observations: 3,
        }
    }
}

/// Outcome of requesting a checkpoint for a step.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointDecision {
    /// A learned rule approved immediately; dispatch may proceed.
    AutoApproved,

    /// Waiting for an external actor (or the timeout sweep).
    Waiting,
}

/// A checkpoint the timeout sweep resolved.
#[derive(Debug, Clone)]
pub struct ExpiredCheckpoint {
    /// Task the gated step belongs to.
    pub task_id: TaskId,

    /// The gated step.
    pub step_id: StepId,

    /// Disposition the orchestrator must apply.
    pub disposition: TimeoutDisposition,
}

#[derive(Debug, Default, Clone)]
struct PreferenceStats {
    approvals: u32,
    rejections: u32,
}

impl PreferenceStats {
    fn observations(&self) -> u32 {
        self.approvals + self.rejections
    }

    fn approval_ratio(&self) -> f64 {
        if self.observations() == 0 {
            return 0.0;
        }
        f64::from(self.approvals) / f64::from(self.observations())
    }
}

/// Manages the approval lifecycle for checkpointed steps.
pub struct CheckpointController {
    policy: CheckpointPolicy,
    approvals: RwLock<HashMap<(TaskId, StepId), CheckpointApproval>>,
    preferences: RwLock<HashMap<String, PreferenceStats>>,
}

impl CheckpointController {
    /// Create a controller with the given policy.
    pub fn new(policy: CheckpointPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            approvals: RwLock::new(HashMap::new()),
            preferences: RwLock::new(HashMap::new()),
        })
    }

    /// Create a controller with default policy.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(CheckpointPolicy::default())
    }

    /// Request approval for a checkpointed step.
    ///
    /// When the step's preference key matches a learned rule above the
    /// confidence threshold the checkpoint resolves to APPROVED immediately
    /// with `auto_approved` recorded; otherwise a pending approval with a
    /// deadline is registered.
    pub async fn request(&self, task_id: &TaskId, step: &TaskStep) -> CheckpointDecision {
        let config = step.checkpoint_config.clone().unwrap_or_default();
        let timeout_minutes = if config.timeout_minutes > 0 {
            config.timeout_minutes
        } else {
            self.policy.default_timeout_minutes
        };
        let mut approval = CheckpointApproval::new(
            task_id.clone(),
            step.id.clone(),
            config.preference_key.clone(),
            timeout_minutes,
        );

        let auto = match &config.preference_key {
            Some(key) => {
                let preferences = self.preferences.read().await;
                preferences.get(key).is_some_and(|stats| {
                    stats.observations() >= self.policy.min_observations
                        && stats.approval_ratio() >= self.policy.confidence_threshold
                })
            }
            None => false,
        };

        let decision = if auto {
            approval.auto_approve();
            info!(task_id = %task_id, step_id = %step.id, "Checkpoint auto-approved by learned rule");
            CheckpointDecision::AutoApproved
        } else {
            info!(
                task_id = %task_id,
                step_id = %step.id,
                timeout_at = %approval.timeout_at,
                "Checkpoint approval requested"
            );
            CheckpointDecision::Waiting
        };

        self.approvals
            .write()
            .await
            .insert((task_id.clone(), step.id.clone()), approval);
        decision
    }

    /// Explicitly approve a pending checkpoint.
    pub async fn approve(
        &self,
        task_id: &TaskId,
        step_id: &StepId,
        feedback: Option<String>,
    ) -> Result<CheckpointApproval, CheckpointError> {
        let approval = self
            .resolve(task_id, step_id, |approval| approval.approve(feedback.clone()))
            .await?;
        self.record_preference(&approval, true).await;
        Ok(approval)
    }

    /// Explicitly reject a pending checkpoint with a reason.
    pub async fn reject(
        &self,
        task_id: &TaskId,
        step_id: &StepId,
        reason: impl Into<String>,
    ) -> Result<CheckpointApproval, CheckpointError> {
        let reason = reason.into();
        let approval = self
            .resolve(task_id, step_id, |approval| approval.reject(reason.clone()))
            .await?;
        self.record_preference(&approval, false).await;
        Ok(approval)
    }

    /// Disposition applied to checkpoints that time out.
    pub fn timeout_disposition(&self) -> TimeoutDisposition {
        self.policy.on_timeout
    }

    /// Current approval record for a step, if one was ever requested.
    pub async fn get(&self, task_id: &TaskId, step_id: &StepId) -> Option<CheckpointApproval> {
        self.approvals
            .read()
            .await
            .get(&(task_id.clone(), step_id.clone()))
            .cloned()
    }

    /// Transition every overdue pending approval to TIMED_OUT.
    ///
    /// Returns the expired checkpoints with the configured disposition for
    /// the orchestrator to apply; the default treats a timeout as a
    /// rejection.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<ExpiredCheckpoint> {
        let mut approvals = self.approvals.write().await;
        let mut expired = Vec::new();
        for ((task_id, step_id), approval) in approvals.iter_mut() {
            if approval.is_overdue(now) {
                approval.time_out();
                warn!(
                    task_id = %task_id,
                    step_id = %step_id,
                    disposition = ?self.policy.on_timeout,
                    "Checkpoint timed out"
                );
                expired.push(ExpiredCheckpoint {
                    task_id: task_id.clone(),
                    step_id: step_id.clone(),
                    disposition: self.policy.on_timeout,
                });
            }
        }
        expired
    }

    async fn resolve(
        &self,
        task_id: &TaskId,
        step_id: &StepId,
        apply: impl FnOnce(&mut CheckpointApproval),
    ) -> Result<CheckpointApproval, CheckpointError> {
        let mut approvals = self.approvals.write().await;
        let approval = approvals
            .get_mut(&(task_id.clone(), step_id.clone()))
            .ok_or_else(|| CheckpointError::NotFound {
                task_id: task_id.clone(),
                step_id: step_id.clone(),
            })?;
        if approval.status.is_resolved() {
            return Err(CheckpointError::AlreadyResolved {
                task_id: task_id.clone(),
                step_id: step_id.clone(),
                status: approval.status,
            });
        }
        apply(approval);
        Ok(approval.clone())
    }

    async fn record_preference(&self, approval: &CheckpointApproval, approved: bool) {
        let Some(key) = &approval.preference_key else {
            return;
        };
        let mut preferences = self.preferences.write().await;
        let stats = preferences.entry(key.clone()).or_default();
        if approved {
            stats.approvals += 1;
        } else {
            stats.rejections += 1;
        }
    }
}
