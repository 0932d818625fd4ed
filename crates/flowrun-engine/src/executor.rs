//! Step executor port and the wire contract for executor responses.
//!
//! The executor is external: it receives the agent type, fully resolved
//! inputs, and trusted execution context, and eventually reports a raw
//! JSON result. The orchestrator only accepts the two documented shapes
//! (`{"status": "success", "outputs": {...}}` and
//! `{"status": "error", "error": "..."}`); anything else is a protocol
//! violation.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use flowrun_core::{ExecutionContext, JobId};

/// Errors from the executor boundary.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Unknown agent type: {0}")]
    UnknownAgent(String),

    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    #[error("Executor transport failure: {0}")]
    Transport(String),
}

/// What the dispatcher hands to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Capability to execute.
    pub agent_type: String,

    /// Resolved inputs, context fields already injected.
    pub resolved_inputs: HashMap<String, Value>,

    /// Trusted execution context.
    pub context: ExecutionContext,
}

/// External capability executing steps.
///
/// Submission and result delivery are split so the orchestrator knows the
/// external job id while the job is in flight; pause collects those ids
/// for out-of-band cancellation.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Submit a step for execution; returns the external job id.
    async fn submit(&self, request: ExecutionRequest) -> Result<JobId, ExecutorError>;

    /// Await the raw wire-shape result of a submitted job.
    async fn await_result(&self, job_id: &JobId) -> Result<Value, ExecutorError>;
}

/// A validated executor result.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step succeeded with outputs.
    Success(HashMap<String, Value>),

    /// Step reported an error.
    Error(String),
}

/// Validate the raw executor response against the wire contract.
///
/// Returns `None` when the shape is not one of the two documented forms;
/// the caller surfaces that as a dispatch protocol error.
pub fn parse_executor_response(raw: &Value) -> Option<StepOutcome> {
    let status = raw.get("status")?.as_str()?;
    match status {
        "success" => {
            let outputs = raw.get("outputs")?.as_object()?;
            Some(StepOutcome::Success(
                outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
        }
        "error" => {
            let error = raw.get("error")?.as_str()?;
            Some(StepOutcome::Error(error.to_string()))
        }
        _ => None,
    }
}

/// Executor that succeeds immediately, echoing resolved inputs back as
/// outputs. Used by the CLI demo and smoke tests.
#[derive(Default)]
pub struct EchoExecutor {
    jobs: Mutex<HashMap<JobId, Value>>,
}

impl EchoExecutor {
    /// Create an echo executor wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn submit(&self, request: ExecutionRequest) -> Result<JobId, ExecutorError> {
        let job_id = JobId::generate();
        let outputs: Value = request
            .resolved_inputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain([("agent".to_string(), json!(request.agent_type))])
            .collect::<serde_json::Map<_, _>>()
            .into();
        self.jobs
            .lock()
            .await
            .insert(job_id.clone(), json!({"status": "success", "outputs": outputs}));
        Ok(job_id)
    }

    async fn await_result(&self, job_id: &JobId) -> Result<Value, ExecutorError> {
        self.jobs
            .lock()
            .await
            .remove(job_id)
            .ok_or_else(|| ExecutorError::UnknownJob(job_id.clone()))
    }
}

/// Test executor that replays scripted raw responses per agent type.
///
/// Each submission for an agent consumes the next scripted response; an
/// agent with no remaining script entries fails submission.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Value>>>,
    jobs: Mutex<HashMap<JobId, Value>>,
    submitted: Mutex<Vec<ExecutionRequest>>,
}

impl ScriptedExecutor {
    /// Create an empty scripted executor wrapped in Arc.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a raw response for the next submission of `agent_type`.
    pub async fn script(&self, agent_type: impl Into<String>, response: Value) {
        self.scripts
            .lock()
            .await
            .entry(agent_type.into())
            .or_default()
            .push_back(response);
    }

    /// Queue a success response with the given outputs.
    pub async fn script_success(&self, agent_type: impl Into<String>, outputs: Value) {
        self.script(agent_type, json!({"status": "success", "outputs": outputs}))
            .await;
    }

    /// Queue an error response with the given message.
    pub async fn script_error(&self, agent_type: impl Into<String>, error: &str) {
        self.script(agent_type, json!({"status": "error", "error": error}))
            .await;
    }

    /// Every request submitted so far, in order.
    pub async fn submitted_requests(&self) -> Vec<ExecutionRequest> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn submit(&self, request: ExecutionRequest) -> Result<JobId, ExecutorError> {
        let response = self
            .scripts
            .lock()
            .await
            .get_mut(&request.agent_type)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| ExecutorError::UnknownAgent(request.agent_type.clone()))?;
        self.submitted.lock().await.push(request);

        let job_id = JobId::generate();
        self.jobs.lock().await.insert(job_id.clone(), response);
        Ok(job_id)
    }

    async fn await_result(&self, job_id: &JobId) -> Result<Value, ExecutorError> {
        self.jobs
            .lock()
            .await
            .remove(job_id)
            .ok_or_else(|| ExecutorError::UnknownJob(job_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_shape() {
        let raw = json!({"status": "success", "outputs": {"url": "https://example.com"}});
        let outcome = parse_executor_response(&raw).unwrap();
        assert!(matches!(outcome, StepOutcome::Success(ref o) if o.contains_key("url")));
    }

    #[test]
    fn test_parse_error_shape() {
        let raw = json!({"status": "error", "error": "rate limited"});
        assert_eq!(
            parse_executor_response(&raw),
            Some(StepOutcome::Error("rate limited".to_string()))
        );
    }

    #[test]
    fn test_unknown_shapes_rejected() {
        assert!(parse_executor_response(&json!({"status": "done"})).is_none());
        assert!(parse_executor_response(&json!({"status": "success"})).is_none());
        assert!(parse_executor_response(&json!({"outputs": {}})).is_none());
        assert!(parse_executor_response(&json!("success")).is_none());
        assert!(parse_executor_response(&json!({"status": "error"})).is_none());
    }

    #[tokio::test]
    async fn test_echo_executor_round_trip() {
        let executor = EchoExecutor::new();
        let request = ExecutionRequest {
            agent_type: "search".to_string(),
            resolved_inputs: HashMap::from([("q".to_string(), json!("rust"))]),
            context: ExecutionContext::default(),
        };
        let job_id = executor.submit(request).await.unwrap();
        let raw = executor.await_result(&job_id).await.unwrap();
        match parse_executor_response(&raw).unwrap() {
            StepOutcome::Success(outputs) => {
                assert_eq!(outputs.get("q"), Some(&json!("rust")));
                assert_eq!(outputs.get("agent"), Some(&json!("search")));
            }
            StepOutcome::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn test_scripted_executor_replays_in_order() {
        let executor = ScriptedExecutor::new();
        executor.script_error("agent", "first fails").await;
        executor.script_success("agent", json!({"n": 2})).await;

        let request = ExecutionRequest {
            agent_type: "agent".to_string(),
            resolved_inputs: HashMap::new(),
            context: ExecutionContext::default(),
        };
        let job = executor.submit(request.clone()).await.unwrap();
        let raw = executor.await_result(&job).await.unwrap();
        assert_eq!(
            parse_executor_response(&raw),
            Some(StepOutcome::Error("first fails".to_string()))
        );

        let job = executor.submit(request).await.unwrap();
        let raw = executor.await_result(&job).await.unwrap();
        assert!(matches!(
            parse_executor_response(&raw),
            Some(StepOutcome::Success(_))
        ));
    }
}
