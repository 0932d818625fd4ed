//! Best-effort notification sink.
//!
//! The orchestrator reports progress at defined points; delivery is a
//! collaborator concern. Failures are logged and swallowed; a broken
//! notification channel must never abort orchestration.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use flowrun_core::{StepId, TaskId, TaskStatus};

/// Step-level event reported to the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Started,
    Completed,
    Failed,
    Retried,
}

/// Notification sink consumed by the orchestrator.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A step changed state.
    async fn notify_step(
        &self,
        task_id: &TaskId,
        step_name: &str,
        event: StepEvent,
        text: &str,
        data: Option<Value>,
    ) -> Result<(), String>;

    /// A checkpoint is waiting for approval.
    async fn notify_checkpoint(
        &self,
        task_id: &TaskId,
        step_id: &StepId,
        step_name: &str,
        description: &str,
    ) -> Result<(), String>;

    /// The task reached a terminal state.
    async fn notify_completion(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        steps_completed: usize,
        total_steps: usize,
        error: Option<&str>,
    ) -> Result<(), String>;
}

/// Notifier that logs through tracing; the default sink.
#[derive(Default)]
pub struct LogNotifier;

impl LogNotifier {
    /// Create a log notifier wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_step(
        &self,
        task_id: &TaskId,
        step_name: &str,
        event: StepEvent,
        text: &str,
        _data: Option<Value>,
    ) -> Result<(), String> {
        info!(task_id = %task_id, step = step_name, event = ?event, "{text}");
        Ok(())
    }

    async fn notify_checkpoint(
        &self,
        task_id: &TaskId,
        step_id: &StepId,
        step_name: &str,
        description: &str,
    ) -> Result<(), String> {
        info!(
            task_id = %task_id,
            step_id = %step_id,
            step = step_name,
            "Checkpoint awaiting approval: {description}"
        );
        Ok(())
    }

    async fn notify_completion(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        steps_completed: usize,
        total_steps: usize,
        error: Option<&str>,
    ) -> Result<(), String> {
        info!(
            task_id = %task_id,
            status = ?status,
            steps_completed,
            total_steps,
            error = error.unwrap_or(""),
            "Task finished"
        );
        Ok(())
    }
}

/// Log-and-swallow wrapper for best-effort delivery.
pub(crate) async fn best_effort(result: Result<(), String>, what: &str) {
    if let Err(e) = result {
        warn!(error = %e, "Notification failed ({what}); continuing");
    }
}
