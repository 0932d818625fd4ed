//! Step dispatcher: the pipeline between a ready step and its executor.
//!
//! Stages, each short-circuiting on failure:
//! 1. load the Task if not supplied (one fetch per call, so batch callers
//!    can share a snapshot),
//! 2. validate template syntax in the step's inputs,
//! 3. resolve references against completed step outputs,
//! 4. defensively coerce resolved values that miss the declared schema
//!    type into their textual representation,
//! 5. re-validate resolved inputs against the schema as a safety net
//!    (missing required fields are fatal, residual type mismatches are
//!    logged and tolerated),
//! 6. inject trusted execution context fields,
//! 7. persist the resolved inputs into the execution tree for audit,
//! 8. gate on the checkpoint controller when required, then hand the step
//!    to the executor with retries and fallbacks, recording the external
//!    job id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use flowrun_core::{
    resolve_value, validate_value, ApprovalStatus, ExecutionContext, FieldType, JobId, StepId,
    StepSchema, Task, TaskId, TaskStep, TemplateError,
};

use crate::budget::{BudgetController, BudgetError};
use crate::checkpoint::{CheckpointController, CheckpointDecision};
use crate::executor::{
    parse_executor_response, ExecutionRequest, ExecutorError, StepExecutor, StepOutcome,
};
use crate::notify::{best_effort, Notifier, StepEvent};
use crate::store::TaskStore;
use crate::tree::{ExecutionTreeManager, TreeError};

/// Base delay between executor retries; doubled per attempt with jitter.
const RETRY_BASE_DELAY_MS: u64 = 50;

/// Dispatch errors. These fail the step, not the orchestrator loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Schema validation failed for step {step_id}: {reason}")]
    Schema { step_id: StepId, reason: String },

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Executor protocol violation for step {step_id}: {detail}")]
    Protocol { step_id: StepId, detail: String },

    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Outcome of dispatching one step.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStatus {
    /// The executor reported success; outputs are ready to persist.
    Succeeded(HashMap<String, Value>),

    /// The step failed (executor error after retries/fallbacks, rejection,
    /// or pipeline error).
    Failed(String),

    /// A checkpoint is pending; the step was not executed and stays
    /// schedulable once the approval resolves.
    Gated,
}

/// Result handed back to the orchestrator loop.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    /// Step that was dispatched.
    pub step_id: StepId,

    /// What happened.
    pub status: DispatchStatus,

    /// External job id, when the step reached an executor.
    pub external_job_id: Option<JobId>,
}

impl DispatchResult {
    /// Whether the step succeeded.
    pub fn success(&self) -> bool {
        matches!(self.status, DispatchStatus::Succeeded(_))
    }

    /// The recorded error, if the step failed.
    pub fn error(&self) -> Option<&str> {
        match &self.status {
            DispatchStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Resolves, validates, and executes steps.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    trees: Arc<ExecutionTreeManager>,
    executor: Arc<dyn StepExecutor>,
    checkpoints: Arc<CheckpointController>,
    budgets: Option<Arc<BudgetController>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        store: Arc<dyn TaskStore>,
        trees: Arc<ExecutionTreeManager>,
        executor: Arc<dyn StepExecutor>,
        checkpoints: Arc<CheckpointController>,
    ) -> Self {
        Self {
            store,
            trees,
            executor,
            checkpoints,
            budgets: None,
            notifier: None,
        }
    }

    /// Builder method to meter step executions against task budgets.
    ///
    /// The budget id is read from the task's `budget_id` metadata entry;
    /// tasks without one are not metered.
    pub fn with_budget_controller(mut self, budgets: Arc<BudgetController>) -> Self {
        self.budgets = Some(budgets);
        self
    }

    /// Builder method to report retry attempts through a notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Run the dispatch pipeline for one step.
    ///
    /// `task` is an optional pre-fetched snapshot; callers dispatching a
    /// batch should pass it to avoid a store round-trip per step.
    pub async fn dispatch(
        &self,
        task_id: &TaskId,
        step: &TaskStep,
        task: Option<&Task>,
    ) -> Result<DispatchResult, DispatchError> {
        // Stage 1: load the task snapshot.
        let fetched;
        let task = match task {
            Some(t) => t,
            None => {
                fetched = self
                    .store
                    .get_task(task_id)
                    .await
                    .ok_or_else(|| DispatchError::TaskNotFound(task_id.clone()))?;
                &fetched
            }
        };

        // Stage 2: template syntax.
        for value in step.inputs.values() {
            validate_value(value)?;
        }

        // Stage 3: resolve references against completed outputs.
        let completed = completed_outputs(task);
        let mut resolved: HashMap<String, Value> = HashMap::with_capacity(step.inputs.len());
        for (key, value) in &step.inputs {
            resolved.insert(key.clone(), resolve_value(value, &completed)?);
        }

        // Stage 4: defensive coercion. The planner cannot always predict
        // resolved runtime types, so a structured value landing in a
        // scalar-typed input becomes its textual representation.
        if let Some(schema) = &step.input_schema {
            coerce_to_schema(schema, &mut resolved);
        }

        // Stage 5: safety-net re-validation of the fully resolved inputs.
        if let Some(schema) = &step.input_schema {
            for warning in validate_resolved(&step.id, schema, &resolved)? {
                warn!(task_id = %task_id, step_id = %step.id, "{warning}");
            }
        }

        // Stage 6: inject trusted context. Never sourced from step inputs.
        let context = ExecutionContext::for_step(task, step);
        if let Some(tenant_id) = &context.tenant_id {
            resolved.insert("tenant_id".to_string(), json!(tenant_id));
        }
        resolved.insert("workflow_id".to_string(), json!(context.workflow_id.clone()));
        resolved.insert("agent_id".to_string(), json!(context.agent_id.clone()));

        // Stage 7: persist resolution for audit.
        self.trees
            .record_resolved_inputs(&task.tree_id, &step.id, json!(resolved.clone()))
            .await?;

        // Checkpoint gate: a checkpointed step does not proceed to
        // execution until its approval resolves.
        if step.checkpoint_required {
            match self.checkpoint_state(task_id, step).await {
                Gate::Proceed => {}
                Gate::Wait => {
                    return Ok(DispatchResult {
                        step_id: step.id.clone(),
                        status: DispatchStatus::Gated,
                        external_job_id: None,
                    });
                }
                Gate::Rejected(reason) => {
                    return Ok(DispatchResult {
                        step_id: step.id.clone(),
                        status: DispatchStatus::Failed(reason),
                        external_job_id: None,
                    });
                }
            }
        }

        // Budget gate: meter the execution before handing it off.
        self.consume_step_budget(task).await?;

        // Stage 8: executor handoff with retries and fallbacks.
        Ok(self.execute(task, step, resolved, context).await?)
    }

    async fn checkpoint_state(&self, task_id: &TaskId, step: &TaskStep) -> Gate {
        if let Some(approval) = self.checkpoints.get(task_id, &step.id).await {
            return match approval.status {
                ApprovalStatus::Approved => Gate::Proceed,
                ApprovalStatus::Pending => Gate::Wait,
                ApprovalStatus::Rejected => Gate::Rejected(format!(
                    "checkpoint rejected: {}",
                    approval.feedback.as_deref().unwrap_or("no reason given")
                )),
                ApprovalStatus::TimedOut => {
                    match self.checkpoints.timeout_disposition() {
                        flowrun_core::TimeoutDisposition::Approve => Gate::Proceed,
                        flowrun_core::TimeoutDisposition::Reject => {
                            Gate::Rejected("checkpoint timed out".to_string())
                        }
                    }
                }
            };
        }
        match self.checkpoints.request(task_id, step).await {
            CheckpointDecision::AutoApproved => Gate::Proceed,
            CheckpointDecision::Waiting => Gate::Wait,
        }
    }

    async fn consume_step_budget(&self, task: &Task) -> Result<(), DispatchError> {
        let Some(budgets) = &self.budgets else {
            return Ok(());
        };
        let Some(budget_id) = task.metadata.get("budget_id").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        budgets
            .consume(
                &budget_id.into(),
                &flowrun_core::ResourceType::StepExecutions,
                1.0,
            )
            .await?;
        Ok(())
    }

    async fn execute(
        &self,
        task: &Task,
        step: &TaskStep,
        resolved: HashMap<String, Value>,
        context: ExecutionContext,
    ) -> Result<DispatchResult, DispatchError> {
        let mut agents = vec![step.agent_type.clone()];
        if let Some(fallback) = &step.fallback_config {
            agents.extend(fallback.agent_types.iter().cloned());
        }

        let mut last_error = String::from("no executor attempt was made");
        for (agent_index, agent_type) in agents.iter().enumerate() {
            if agent_index > 0 {
                info!(
                    task_id = %task.id,
                    step_id = %step.id,
                    fallback = %agent_type,
                    "Trying fallback capability"
                );
            }
            for attempt in 0..=step.max_retries {
                if attempt > 0 {
                    if let Some(notifier) = &self.notifier {
                        best_effort(
                            notifier
                                .notify_step(
                                    &task.id,
                                    &step.name,
                                    StepEvent::Retried,
                                    &format!("Retrying after: {last_error}"),
                                    None,
                                )
                                .await,
                            "step retried",
                        )
                        .await;
                    }
                    let backoff = RETRY_BASE_DELAY_MS * (1 << (attempt - 1).min(6));
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }

                let request = ExecutionRequest {
                    agent_type: agent_type.clone(),
                    resolved_inputs: resolved.clone(),
                    context: context.clone(),
                };
                let job_id = match self.executor.submit(request).await {
                    Ok(job_id) => job_id,
                    Err(ExecutorError::UnknownAgent(agent)) => {
                        last_error = format!("unknown agent type: {agent}");
                        break; // next fallback, retrying won't help
                    }
                    Err(e) => {
                        last_error = e.to_string();
                        continue;
                    }
                };

                let generation = self
                    .trees
                    .start_node(&task.tree_id, &step.id, job_id.clone())
                    .await?;
                debug!(
                    task_id = %task.id,
                    step_id = %step.id,
                    job_id = %job_id,
                    attempt,
                    "Step handed to executor"
                );

                let raw = match self.executor.await_result(&job_id).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        self.trees
                            .record_result(&task.tree_id, &step.id, generation, false)
                            .await?;
                        last_error = e.to_string();
                        continue;
                    }
                };

                match parse_executor_response(&raw) {
                    Some(StepOutcome::Success(outputs)) => {
                        let applied = self
                            .trees
                            .record_result(&task.tree_id, &step.id, generation, true)
                            .await?;
                        if !applied {
                            // The node was paused while the job was in
                            // flight; the generation fence discards this
                            // completion and resume will re-dispatch.
                            info!(
                                task_id = %task.id,
                                step_id = %step.id,
                                job_id = %job_id,
                                "Discarding stale completion for paused node"
                            );
                            return Ok(DispatchResult {
                                step_id: step.id.clone(),
                                status: DispatchStatus::Gated,
                                external_job_id: Some(job_id),
                            });
                        }
                        return Ok(DispatchResult {
                            step_id: step.id.clone(),
                            status: DispatchStatus::Succeeded(outputs),
                            external_job_id: Some(job_id),
                        });
                    }
                    Some(StepOutcome::Error(error)) => {
                        self.trees
                            .record_result(&task.tree_id, &step.id, generation, false)
                            .await?;
                        last_error = error;
                    }
                    None => {
                        // Protocol violation: do not retry a misbehaving
                        // executor against this step.
                        self.trees
                            .record_result(&task.tree_id, &step.id, generation, false)
                            .await?;
                        return Err(DispatchError::Protocol {
                            step_id: step.id.clone(),
                            detail: format!("unrecognized response shape: {raw}"),
                        });
                    }
                }
            }
        }

        Ok(DispatchResult {
            step_id: step.id.clone(),
            status: DispatchStatus::Failed(last_error),
            external_job_id: None,
        })
    }
}

enum Gate {
    Proceed,
    Wait,
    Rejected(String),
}

/// Outputs of all DONE steps, keyed by step id.
fn completed_outputs(task: &Task) -> HashMap<StepId, HashMap<String, Value>> {
    task.steps
        .iter()
        .filter(|s| s.status == flowrun_core::StepStatus::Done)
        .map(|s| (s.id.clone(), s.outputs.clone()))
        .collect()
}

/// Coerce resolved values whose type misses the declared schema type into
/// their textual representation.
fn coerce_to_schema(schema: &StepSchema, resolved: &mut HashMap<String, Value>) {
    for (field, spec) in &schema.fields {
        if spec.field_type == FieldType::Any {
            continue;
        }
        if let Some(value) = resolved.get_mut(field) {
            if !spec.field_type.matches(value) {
                let text = match value {
                    Value::String(s) => s.clone(),
                    ref other => other.to_string(),
                };
                *value = Value::String(text);
            }
        }
    }
}

/// Safety-net validation of fully resolved inputs.
///
/// Missing required fields are fatal; residual type mismatches (possible
/// when coercion targeted a non-string scalar) come back as warnings.
fn validate_resolved(
    step_id: &StepId,
    schema: &StepSchema,
    resolved: &HashMap<String, Value>,
) -> Result<Vec<String>, DispatchError> {
    let mut warnings = Vec::new();
    for (field, spec) in &schema.fields {
        match resolved.get(field) {
            None | Some(Value::Null) => {
                if spec.required {
                    return Err(DispatchError::Schema {
                        step_id: step_id.clone(),
                        reason: format!("required field '{field}' is missing"),
                    });
                }
            }
            Some(value) => {
                if !spec.field_type.matches(value) {
                    warnings.push(format!(
                        "field '{field}' resolved to an unexpected type; passing through as-is"
                    ));
                }
            }
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointController;
    use crate::executor::ScriptedExecutor;
    use crate::store::InMemoryTaskStore;
    use flowrun_core::{FieldSpec, StepStatus};

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        trees: Arc<ExecutionTreeManager>,
        executor: Arc<ScriptedExecutor>,
        dispatcher: Dispatcher,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryTaskStore::new();
        let trees = ExecutionTreeManager::new();
        let executor = ScriptedExecutor::new();
        let dispatcher = Dispatcher::new(
            store.clone(),
            trees.clone(),
            executor.clone(),
            CheckpointController::with_defaults(),
        );
        Fixture {
            store,
            trees,
            executor,
            dispatcher,
        }
    }

    async fn seed(fixture: &Fixture, task: Task) -> Task {
        let task = fixture.store.create_task(task).await.unwrap();
        fixture.trees.create_for_task(&task).await;
        task
    }

    fn done_step(id: &str, field: &str, value: Value) -> TaskStep {
        let mut step = TaskStep::new(id, id, "agent");
        step.status = StepStatus::Done;
        step.outputs.insert(field.to_string(), value);
        step
    }

    #[tokio::test]
    async fn test_dispatch_resolves_and_executes() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g")
                .with_step(done_step("fetch", "url", json!("https://example.com")))
                .with_step(
                    TaskStep::new("process", "process", "worker")
                        .with_input("target", json!("{{fetch.outputs.url}}")),
                ),
        )
        .await;
        f.executor
            .script_success("worker", json!({"summary": "done"}))
            .await;

        let step = task.step(&StepId::new("process")).unwrap();
        let result = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.external_job_id.is_some());

        let requests = f.executor.submitted_requests().await;
        assert_eq!(
            requests[0].resolved_inputs.get("target"),
            Some(&json!("https://example.com"))
        );
    }

    #[tokio::test]
    async fn test_bad_template_syntax_fails_validation() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g").with_step(
                TaskStep::new("process", "process", "worker")
                    .with_input("target", json!("{{fetch.output.url}}")),
            ),
        )
        .await;

        let step = task.step(&StepId::new("process")).unwrap();
        let err = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Template(_)));
    }

    #[tokio::test]
    async fn test_unresolved_reference_fails() {
        let f = fixture().await;
        // fetch exists but is not DONE.
        let task = seed(
            &f,
            Task::new("g")
                .with_step(TaskStep::new("fetch", "fetch", "agent"))
                .with_step(
                    TaskStep::new("process", "process", "worker")
                        .with_input("target", json!("{{fetch.outputs.url}}")),
                ),
        )
        .await;

        let step = task.step(&StepId::new("process")).unwrap();
        let err = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Template(TemplateError::StepNotCompleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_structured_value_coerced_to_text() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g")
                .with_step(done_step("fetch", "payload", json!({"rows": [1, 2]})))
                .with_step(
                    TaskStep::new("process", "process", "worker")
                        .with_input("summary", json!("{{fetch.outputs.payload}}"))
                        .with_input_schema(
                            StepSchema::new()
                                .with_field("summary", FieldSpec::required(FieldType::String)),
                        ),
                ),
        )
        .await;
        f.executor.script_success("worker", json!({})).await;

        let step = task.step(&StepId::new("process")).unwrap();
        let result = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert!(result.success());

        let requests = f.executor.submitted_requests().await;
        let summary = requests[0].resolved_inputs.get("summary").unwrap();
        assert!(summary.is_string());
        assert!(summary.as_str().unwrap().contains("rows"));
    }

    #[tokio::test]
    async fn test_missing_required_field_is_fatal() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g").with_step(
                TaskStep::new("process", "process", "worker").with_input_schema(
                    StepSchema::new()
                        .with_field("target", FieldSpec::required(FieldType::String)),
                ),
            ),
        )
        .await;

        let step = task.step(&StepId::new("process")).unwrap();
        let err = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Schema { .. }));
    }

    #[tokio::test]
    async fn test_context_injection_overrides_spoofed_tenant() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g")
                .with_metadata("tenant_id", json!("acme"))
                .with_step(
                    TaskStep::new("process", "process", "worker")
                        .with_input("tenant_id", json!("evil-corp")),
                ),
        )
        .await;
        f.executor.script_success("worker", json!({})).await;

        let step = task.step(&StepId::new("process")).unwrap();
        f.dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();

        let requests = f.executor.submitted_requests().await;
        assert_eq!(requests[0].resolved_inputs.get("tenant_id"), Some(&json!("acme")));
        assert_eq!(
            requests[0].resolved_inputs.get("workflow_id"),
            Some(&json!(task.id.as_str()))
        );
    }

    #[tokio::test]
    async fn test_resolved_inputs_persisted_for_audit() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g")
                .with_step(done_step("fetch", "url", json!("https://example.com")))
                .with_step(
                    TaskStep::new("process", "process", "worker")
                        .with_input("target", json!("{{fetch.outputs.url}}")),
                ),
        )
        .await;
        f.executor.script_success("worker", json!({})).await;

        let step = task.step(&StepId::new("process")).unwrap();
        f.dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();

        let tree = f.trees.get(&task.tree_id).await.unwrap();
        let node = tree.node(&StepId::new("process")).unwrap();
        let audited = node.resolved_inputs.as_ref().unwrap();
        assert_eq!(audited["target"], json!("https://example.com"));
    }

    #[tokio::test]
    async fn test_protocol_violation_is_an_error() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g").with_step(TaskStep::new("process", "process", "worker")),
        )
        .await;
        f.executor
            .script("worker", json!({"status": "maybe?"}))
            .await;

        let step = task.step(&StepId::new("process")).unwrap();
        let err = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g").with_step(
                TaskStep::new("process", "process", "worker").with_max_retries(2),
            ),
        )
        .await;
        f.executor.script_error("worker", "transient").await;
        f.executor.script_error("worker", "transient").await;
        f.executor.script_success("worker", json!({"n": 3})).await;

        let step = task.step(&StepId::new("process")).unwrap();
        let result = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(f.executor.submitted_requests().await.len(), 3);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: tokio::sync::Mutex<Vec<StepEvent>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_step(
            &self,
            _task_id: &TaskId,
            _step_name: &str,
            event: StepEvent,
            _text: &str,
            _data: Option<Value>,
        ) -> Result<(), String> {
            self.events.lock().await.push(event);
            Ok(())
        }

        async fn notify_checkpoint(
            &self,
            _task_id: &TaskId,
            _step_id: &StepId,
            _step_name: &str,
            _description: &str,
        ) -> Result<(), String> {
            Ok(())
        }

        async fn notify_completion(
            &self,
            _task_id: &TaskId,
            _status: flowrun_core::TaskStatus,
            _steps_completed: usize,
            _total_steps: usize,
            _error: Option<&str>,
        ) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_retry_attempts_reported_through_notifier() {
        let f = fixture().await;
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = Dispatcher::new(
            f.store.clone(),
            f.trees.clone(),
            f.executor.clone(),
            CheckpointController::with_defaults(),
        )
        .with_notifier(notifier.clone());

        let task = seed(
            &f,
            Task::new("g").with_step(
                TaskStep::new("process", "process", "worker").with_max_retries(2),
            ),
        )
        .await;
        f.executor.script_error("worker", "transient").await;
        f.executor.script_error("worker", "transient").await;
        f.executor.script_success("worker", json!({"n": 3})).await;

        let step = task.step(&StepId::new("process")).unwrap();
        let result = dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert!(result.success());

        let events = notifier.events.lock().await;
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == StepEvent::Retried)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_fallback_agent_tried_after_retries() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g").with_step(
                TaskStep::new("process", "process", "worker").with_fallbacks(
                    flowrun_core::FallbackConfig {
                        agent_types: vec!["backup-worker".to_string()],
                    },
                ),
            ),
        )
        .await;
        f.executor.script_error("worker", "down").await;
        f.executor
            .script_success("backup-worker", json!({"ok": true}))
            .await;

        let step = task.step(&StepId::new("process")).unwrap();
        let result = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert!(result.success());

        let requests = f.executor.submitted_requests().await;
        assert_eq!(requests[1].agent_type, "backup-worker");
    }

    #[tokio::test]
    async fn test_all_attempts_exhausted_fails_step() {
        let f = fixture().await;
        let task = seed(
            &f,
            Task::new("g").with_step(TaskStep::new("process", "process", "worker")),
        )
        .await;
        f.executor.script_error("worker", "permanently down").await;

        let step = task.step(&StepId::new("process")).unwrap();
        let result = f
            .dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert_eq!(result.error(), Some("permanently down"));
    }

    #[tokio::test]
    async fn test_checkpointed_step_gated_until_approval() {
        let f = fixture().await;
        let checkpoints = CheckpointController::with_defaults();
        let dispatcher = Dispatcher::new(
            f.store.clone(),
            f.trees.clone(),
            f.executor.clone(),
            checkpoints.clone(),
        );
        let task = seed(
            &f,
            Task::new("g").with_step(
                TaskStep::new("deploy", "deploy", "worker")
                    .with_checkpoint(Default::default()),
            ),
        )
        .await;
        f.executor.script_success("worker", json!({})).await;

        let step = task.step(&StepId::new("deploy")).unwrap();
        let result = dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert_eq!(result.status, DispatchStatus::Gated);

        checkpoints
            .approve(&task.id, &step.id, None)
            .await
            .unwrap();
        let result = dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_rejected_checkpoint_fails_step() {
        let f = fixture().await;
        let checkpoints = CheckpointController::with_defaults();
        let dispatcher = Dispatcher::new(
            f.store.clone(),
            f.trees.clone(),
            f.executor.clone(),
            checkpoints.clone(),
        );
        let task = seed(
            &f,
            Task::new("g").with_step(
                TaskStep::new("deploy", "deploy", "worker")
                    .with_checkpoint(Default::default()),
            ),
        )
        .await;

        let step = task.step(&StepId::new("deploy")).unwrap();
        dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        checkpoints
            .reject(&task.id, &step.id, "not today")
            .await
            .unwrap();

        let result = dispatcher
            .dispatch(&task.id, step, Some(&task))
            .await
            .unwrap();
        assert!(result.error().unwrap().contains("not today"));
    }

    #[tokio::test]
    async fn test_budget_metering_blocks_over_limit() {
        use crate::counter::InMemoryCounterStore;
        use flowrun_core::{BudgetConfig, BudgetId, ResourceLimit, ResourceType};

        let f = fixture().await;
        let budgets = BudgetController::new(InMemoryCounterStore::new());
        budgets
            .create_budget(
                BudgetId::new("task-budget"),
                BudgetConfig::new("task-budget")
                    .with_limit(ResourceLimit::hard(ResourceType::StepExecutions, 1.0)),
            )
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(
            f.store.clone(),
            f.trees.clone(),
            f.executor.clone(),
            CheckpointController::with_defaults(),
        )
        .with_budget_controller(budgets);

        let task = seed(
            &f,
            Task::new("g")
                .with_metadata("budget_id", json!("task-budget"))
                .with_step(TaskStep::new("a", "a", "worker"))
                .with_step(TaskStep::new("b", "b", "worker")),
        )
        .await;
        f.executor.script_success("worker", json!({})).await;
        f.executor.script_success("worker", json!({})).await;

        let a = task.step(&StepId::new("a")).unwrap();
        assert!(dispatcher
            .dispatch(&task.id, a, Some(&task))
            .await
            .unwrap()
            .success());

        let b = task.step(&StepId::new("b")).unwrap();
        let err = dispatcher
            .dispatch(&task.id, b, Some(&task))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Budget(BudgetError::Exceeded { .. })));
    }
}
