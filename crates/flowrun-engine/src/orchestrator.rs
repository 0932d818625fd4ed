//! Orchestrator loop: drives a task from READY to a terminal state.
//!
//! Each iteration takes a fresh task snapshot, asks the scheduler for
//! ready groups, dispatches them bounded by `max_parallel_steps`, and
//! writes results back through the task store. The loop yields control
//! when the task terminates, pauses, or every remaining step is gated on
//! a checkpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use flowrun_core::{
    ApprovalStatus, CoreError, FailurePolicy, JobId, StepId, StepStatus, Task, TaskId, TaskStatus,
};

use crate::checkpoint::CheckpointController;
use crate::dispatcher::{DispatchStatus, Dispatcher};
use crate::notify::{best_effort, Notifier, StepEvent};
use crate::scheduler::{is_stalled, ready_groups};
use crate::store::{StepUpdate, StoreError, TaskPatch, TaskStore};
use crate::tree::{ExecutionTreeManager, TreeError};

/// Orchestrator errors. Step failures are not errors; they flow through
/// task and step status.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// What a `run` call accomplished.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Task status when the loop yielded.
    pub status: TaskStatus,

    /// Steps dispatched to an executor during this run.
    pub steps_dispatched: usize,

    /// Steps still gated on a pending checkpoint when the loop yielded.
    pub waiting_checkpoints: Vec<StepId>,
}

/// Drives tasks through scheduling, dispatch, and completion.
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    trees: Arc<ExecutionTreeManager>,
    dispatcher: Arc<Dispatcher>,
    checkpoints: Arc<CheckpointController>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    /// Create an orchestrator.
    pub fn new(
        store: Arc<dyn TaskStore>,
        trees: Arc<ExecutionTreeManager>,
        dispatcher: Arc<Dispatcher>,
        checkpoints: Arc<CheckpointController>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            trees,
            dispatcher,
            checkpoints,
            notifier,
        })
    }

    /// Accept a planned task: create its execution tree and persist it as
    /// READY for scheduling.
    pub async fn submit(&self, mut task: Task) -> Result<Task, OrchestratorError> {
        task.status = TaskStatus::Ready;
        self.trees.create_for_task(&task).await;
        let task = self.store.create_task(task).await?;
        info!(task_id = %task.id, steps = task.steps.len(), "Task submitted");
        Ok(task)
    }

    /// Drive the task until it terminates, pauses, or blocks on
    /// checkpoints. Safe to call again after approvals or a resume.
    pub async fn run(&self, task_id: &TaskId) -> Result<RunReport, OrchestratorError> {
        let mut dispatched_total = 0usize;
        // Steps gated on a checkpoint stay PENDING; remember them so the
        // loop does not re-dispatch them within this run.
        let mut gated: HashSet<StepId> = HashSet::new();

        loop {
            let task = self
                .store
                .get_task(task_id)
                .await
                .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.clone()))?;

            if task.status.is_terminal() {
                return Ok(self.report(&task, dispatched_total, &gated).await);
            }
            if !task.status.can_schedule() {
                // PAUSED (or still PLANNING): schedule nothing.
                info!(task_id = %task_id, status = ?task.status, "Task not schedulable; yielding");
                return Ok(self.report(&task, dispatched_total, &gated).await);
            }

            let groups: Vec<_> = ready_groups(&task)
                .into_iter()
                .map(|group| {
                    group
                        .into_iter()
                        .filter(|s| !gated.contains(&s.id))
                        .collect::<Vec<_>>()
                })
                .filter(|group| !group.is_empty())
                .collect();

            if groups.is_empty() {
                if !gated.is_empty() {
                    // Blocked on approvals; yield and let the caller re-run
                    // once they resolve.
                    return Ok(self.report(&task, dispatched_total, &gated).await);
                }
                if task.all_steps_terminal() {
                    let task = self.finalize(task).await?;
                    return Ok(self.report(&task, dispatched_total, &gated).await);
                }
                if is_stalled(&task) {
                    let task = self
                        .fail_task(task, "no step can make progress: unsatisfiable dependencies")
                        .await?;
                    return Ok(self.report(&task, dispatched_total, &gated).await);
                }
                // Nothing ready and nothing terminal: steps are marked
                // RUNNING from an interrupted run. Surface it rather than
                // spin.
                warn!(task_id = %task_id, "No ready steps but non-terminal steps remain; yielding");
                return Ok(self.report(&task, dispatched_total, &gated).await);
            }

            let task = if task.status == TaskStatus::Ready {
                self.store
                    .update_task(task_id, TaskPatch::status(TaskStatus::Executing), task.version)
                    .await?
            } else {
                task
            };

            let batch: Vec<_> = groups.into_iter().flatten().collect();
            dispatched_total += self
                .dispatch_batch(task, batch, &mut gated)
                .await?;
        }
    }

    /// Pause a running task: suspend tree nodes, reclaim in-flight job ids
    /// for out-of-band cancellation, and stop scheduling.
    pub async fn pause_task(&self, task_id: &TaskId) -> Result<Vec<JobId>, OrchestratorError> {
        let task = self
            .store
            .get_task(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.clone()))?;

        if !task.status.can_schedule() {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", task.status),
                to: "Paused".to_string(),
            }
            .into());
        }

        let job_ids = self.trees.pause(&task.tree_id).await?;

        // Running steps go back to PENDING so resume re-dispatches them.
        let mut patch = TaskPatch::status(TaskStatus::Paused);
        for step in &task.steps {
            if step.status == StepStatus::Running {
                patch = patch.with_step_update(StepUpdate {
                    step_id: step.id.clone(),
                    status: StepStatus::Pending,
                    outputs: None,
                    error: None,
                });
            }
        }
        self.store.update_task(task_id, patch, task.version).await?;

        info!(
            task_id = %task_id,
            suspended_jobs = job_ids.len(),
            "Task paused"
        );
        Ok(job_ids)
    }

    /// Resume a paused task; returns the number of suspended nodes put
    /// back into play. The caller re-runs the loop afterwards.
    pub async fn resume_task(&self, task_id: &TaskId) -> Result<usize, OrchestratorError> {
        let task = self
            .store
            .get_task(task_id)
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.clone()))?;

        if task.status != TaskStatus::Paused {
            return Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", task.status),
                to: "Executing".to_string(),
            }
            .into());
        }

        let resumed = self.trees.resume(&task.tree_id).await?;
        self.store
            .update_task(task_id, TaskPatch::status(TaskStatus::Executing), task.version)
            .await?;

        info!(task_id = %task_id, resumed_nodes = resumed, "Task resumed");
        Ok(resumed)
    }

    /// Mark overdue checkpoints per the configured disposition, then fail
    /// the affected steps of rejected ones. Returns how many expired.
    pub async fn sweep_checkpoints(&self) -> Result<usize, OrchestratorError> {
        let expired = self.checkpoints.expire_overdue(chrono::Utc::now()).await;
        for item in &expired {
            if matches!(item.disposition, flowrun_core::TimeoutDisposition::Approve) {
                continue;
            }
            let Some(task) = self.store.get_task(&item.task_id).await else {
                continue;
            };
            let patch = TaskPatch::default().with_step_update(StepUpdate {
                step_id: item.step_id.clone(),
                status: StepStatus::Failed,
                outputs: None,
                error: Some("checkpoint timed out".to_string()),
            });
            if let Err(e) = self.store.update_task(&item.task_id, patch, task.version).await {
                warn!(task_id = %item.task_id, error = %e, "Failed to record checkpoint expiry");
            }
        }
        Ok(expired.len())
    }

    /// Dispatch one batch of ready steps, bounded by the task's
    /// parallelism cap, and write the results back. Returns how many steps
    /// reached an executor.
    async fn dispatch_batch(
        &self,
        task: Task,
        batch: Vec<flowrun_core::TaskStep>,
        gated: &mut HashSet<StepId>,
    ) -> Result<usize, OrchestratorError> {
        // Mark the batch RUNNING up front so a concurrent pause sees them.
        let mut patch = TaskPatch::default();
        for step in &batch {
            patch = patch.with_step_update(StepUpdate {
                step_id: step.id.clone(),
                status: StepStatus::Running,
                outputs: None,
                error: None,
            });
        }
        let task = self.store.update_task(&task.id, patch, task.version).await?;
        let snapshot = Arc::new(task);

        let policies: HashMap<StepId, (FailurePolicy, bool)> = batch
            .iter()
            .map(|s| (s.id.clone(), (s.failure_policy, s.is_critical)))
            .collect();
        let semaphore = Arc::new(Semaphore::new(snapshot.max_parallel_steps.max(1)));
        let mut join_set = JoinSet::new();
        for step in batch {
            let dispatcher = Arc::clone(&self.dispatcher);
            let snapshot = Arc::clone(&snapshot);
            let semaphore = Arc::clone(&semaphore);
            let notifier = Arc::clone(&self.notifier);
            join_set.spawn(async move {
                // Semaphore closes only on drop, which cannot happen while
                // this future holds a clone.
                let _permit = semaphore.acquire().await;
                best_effort(
                    notifier
                        .notify_step(
                            &snapshot.id,
                            &step.name,
                            StepEvent::Started,
                            "Step dispatched",
                            None,
                        )
                        .await,
                    "step started",
                )
                .await;
                let result = dispatcher
                    .dispatch(&snapshot.id, &step, Some(snapshot.as_ref()))
                    .await;
                (step, result)
            });
        }

        let mut updates: Vec<StepUpdate> = Vec::new();
        let mut findings = Vec::new();
        let mut executed = 0usize;
        let mut abort_reason: Option<String> = None;

        while let Some(joined) = join_set.join_next().await {
            let Ok((step, result)) = joined else {
                // A dispatch future panicked or was aborted; its step stays
                // RUNNING and is handled below with the other leftovers.
                continue;
            };
            match result {
                Ok(outcome) => {
                    if outcome.success() || outcome.error().is_some() {
                        executed += 1;
                    }
                    match outcome.status {
                        DispatchStatus::Succeeded(outputs) => {
                            findings.push(json!({
                                "step_id": step.id.as_str(),
                                "name": step.name.clone(),
                                "outputs": outputs.clone(),
                                "recorded_at": chrono::Utc::now().to_rfc3339(),
                            }));
                            updates.push(StepUpdate {
                                step_id: step.id.clone(),
                                status: StepStatus::Done,
                                outputs: Some(outputs),
                                error: None,
                            });
                            best_effort(
                                self.notifier
                                    .notify_step(
                                        &snapshot.id,
                                        &step.name,
                                        StepEvent::Completed,
                                        "Step completed",
                                        None,
                                    )
                                    .await,
                                "step completed",
                            )
                            .await;
                        }
                        DispatchStatus::Failed(message) => {
                            self.on_step_failed(&snapshot, &step, &message).await;
                            updates.push(StepUpdate {
                                step_id: step.id.clone(),
                                status: StepStatus::Failed,
                                outputs: None,
                                error: Some(message.clone()),
                            });
                            if let Some((policy, critical)) = policies.get(&step.id) {
                                let abort = match policy {
                                    FailurePolicy::FailFast => true,
                                    FailurePolicy::AllOrNothing => *critical,
                                    FailurePolicy::BestEffort => false,
                                };
                                if abort && abort_reason.is_none() {
                                    abort_reason = Some(format!(
                                        "step '{}' failed: {message}",
                                        step.id
                                    ));
                                    if *policy == FailurePolicy::FailFast {
                                        join_set.abort_all();
                                    }
                                }
                            }
                        }
                        DispatchStatus::Gated => {
                            gated.insert(step.id.clone());
                            updates.push(StepUpdate {
                                step_id: step.id.clone(),
                                status: StepStatus::Pending,
                                outputs: None,
                                error: None,
                            });
                            best_effort(
                                self.notifier
                                    .notify_checkpoint(
                                        &snapshot.id,
                                        &step.id,
                                        &step.name,
                                        step.checkpoint_config
                                            .as_ref()
                                            .and_then(|c| c.description.as_deref())
                                            .unwrap_or(&step.description),
                                    )
                                    .await,
                                "checkpoint",
                            )
                            .await;
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(task_id = %snapshot.id, step_id = %step.id, error = %message, "Dispatch failed");
                    self.on_step_failed(&snapshot, &step, &message).await;
                    updates.push(StepUpdate {
                        step_id: step.id.clone(),
                        status: StepStatus::Failed,
                        outputs: None,
                        error: Some(message.clone()),
                    });
                    if let Some((policy, critical)) = policies.get(&step.id) {
                        let abort = matches!(policy, FailurePolicy::FailFast)
                            || (matches!(policy, FailurePolicy::AllOrNothing) && *critical);
                        if abort && abort_reason.is_none() {
                            abort_reason =
                                Some(format!("step '{}' failed: {message}", step.id));
                            if matches!(policy, FailurePolicy::FailFast) {
                                join_set.abort_all();
                            }
                        }
                    }
                }
            }
        }

        // Steps whose futures were aborted never produced an update; put
        // them back to PENDING.
        let accounted: HashSet<&StepId> = updates.iter().map(|u| &u.step_id).collect();
        let leftover: Vec<StepId> = policies
            .keys()
            .filter(|id| !accounted.contains(id))
            .cloned()
            .collect();
        for step_id in leftover {
            updates.push(StepUpdate {
                step_id,
                status: StepStatus::Pending,
                outputs: None,
                error: None,
            });
        }

        let mut patch = TaskPatch::default();
        patch.step_updates = updates;
        patch.append_findings = findings;
        // Advance the progress cursor past the leading run of finished
        // steps, as seen once this patch lands.
        let patched: HashMap<&StepId, StepStatus> = patch
            .step_updates
            .iter()
            .map(|u| (&u.step_id, u.status))
            .collect();
        patch.current_step_index = Some(
            snapshot
                .steps
                .iter()
                .take_while(|s| patched.get(&s.id).copied().unwrap_or(s.status).is_terminal())
                .count(),
        );
        if abort_reason.is_some() {
            patch.status = Some(TaskStatus::Failed);
        }
        let task = self
            .store
            .update_task(&snapshot.id, patch, snapshot.version)
            .await?;

        if let Some(reason) = abort_reason {
            warn!(task_id = %task.id, reason = %reason, "Task aborted by failure policy");
            self.notify_completion(&task, Some(&reason)).await;
        }
        Ok(executed)
    }

    async fn on_step_failed(&self, task: &Task, step: &flowrun_core::TaskStep, message: &str) {
        best_effort(
            self.notifier
                .notify_step(&task.id, &step.name, StepEvent::Failed, message, None)
                .await,
            "step failed",
        )
        .await;
    }

    /// All steps terminal: settle the final task status.
    async fn finalize(&self, task: Task) -> Result<Task, OrchestratorError> {
        let critical_failure = task
            .steps
            .iter()
            .any(|s| s.status == StepStatus::Failed && s.is_critical);
        let status = if critical_failure {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        let updated = self
            .store
            .update_task(&task.id, TaskPatch::status(status), task.version)
            .await?;
        self.notify_completion(&updated, None).await;
        Ok(updated)
    }

    async fn fail_task(&self, task: Task, reason: &str) -> Result<Task, OrchestratorError> {
        warn!(task_id = %task.id, reason, "Failing task");
        let updated = self
            .store
            .update_task(&task.id, TaskPatch::status(TaskStatus::Failed), task.version)
            .await?;
        self.notify_completion(&updated, Some(reason)).await;
        Ok(updated)
    }

    async fn notify_completion(&self, task: &Task, error: Option<&str>) {
        best_effort(
            self.notifier
                .notify_completion(
                    &task.id,
                    task.status,
                    task.steps_completed(),
                    task.steps.len(),
                    error,
                )
                .await,
            "completion",
        )
        .await;
    }

    async fn report(&self, task: &Task, dispatched: usize, gated: &HashSet<StepId>) -> RunReport {
        let mut waiting: Vec<StepId> = Vec::new();
        for step_id in gated {
            let pending = self
                .checkpoints
                .get(&task.id, step_id)
                .await
                .map(|a| a.status == ApprovalStatus::Pending)
                .unwrap_or(false);
            if pending {
                waiting.push(step_id.clone());
            }
        }
        waiting.sort();
        RunReport {
            status: task.status,
            steps_dispatched: dispatched,
            waiting_checkpoints: waiting,
        }
    }
}
