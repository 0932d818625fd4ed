//! Task and TaskStep types.

use crate::{FailurePolicy, StepId, StepStatus, TaskId, TaskStatus, TreeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Default cap on concurrently in-flight steps per task.
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 5;

/// A Task is a goal decomposed into a dependency-linked set of steps.
///
/// The Task document is owned by exactly one orchestrator loop at a time and
/// is only mutated through the task store's versioned update path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    #[serde(default = "TaskId::generate")]
    pub id: TaskId,

    /// The goal this task was decomposed from.
    pub goal: String,

    /// Current task status.
    #[serde(default)]
    pub status: TaskStatus,

    /// Ordered step list.
    #[serde(default)]
    pub steps: Vec<TaskStep>,

    /// Free-form constraints the planner attached to the goal.
    #[serde(default)]
    pub constraints: HashMap<String, Value>,

    /// Criteria a reviewer uses to judge the goal complete.
    #[serde(default)]
    pub success_criteria: Vec<String>,

    /// Records appended as steps complete.
    #[serde(default)]
    pub accumulated_findings: Vec<Value>,

    /// Progress cursor: index of the first step (in plan order) that has
    /// not reached a terminal state, `steps.len()` once all have.
    #[serde(default)]
    pub current_step_index: usize,

    /// Execution tree backing pause/resume and auditing for this task.
    #[serde(default = "TreeId::generate")]
    pub tree_id: TreeId,

    /// Set when this task is a re-run/clone of another.
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,

    /// Monotonic version for optimistic concurrency in the task store.
    #[serde(default)]
    pub version: u64,

    /// Cap on concurrently in-flight steps.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// Tenant/workflow/agent context and anything else the caller attached.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    /// When the task was created.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_max_parallel_steps() -> usize {
    DEFAULT_MAX_PARALLEL_STEPS
}

fn default_true() -> bool {
    true
}

impl Task {
    /// Create a new Task in PLANNING with no steps.
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            goal: goal.into(),
            status: TaskStatus::Planning,
            steps: Vec::new(),
            constraints: HashMap::new(),
            success_criteria: Vec::new(),
            accumulated_findings: Vec::new(),
            current_step_index: 0,
            tree_id: TreeId::generate(),
            parent_task_id: None,
            version: 0,
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Builder method to append a step.
    pub fn with_step(mut self, step: TaskStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Builder method to set the parallelism cap.
    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = max;
        self
    }

    /// Builder method to attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: &StepId) -> Option<&TaskStep> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Look up a step by id, mutably.
    pub fn step_mut(&mut self, step_id: &StepId) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| &s.id == step_id)
    }

    /// Ids of all steps currently DONE.
    pub fn done_step_ids(&self) -> HashSet<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when every step reached a terminal status.
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    /// True when at least one step FAILED.
    pub fn any_step_failed(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }

    /// Number of steps currently DONE.
    pub fn steps_completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .count()
    }

    /// Produce a fresh PLANNING copy of this task for a re-run.
    ///
    /// All step statuses and outputs are reset; the copy records this task
    /// as its parent and gets its own execution tree.
    pub fn clone_for_rerun(&self) -> Self {
        let mut rerun = self.clone();
        rerun.id = TaskId::generate();
        rerun.tree_id = TreeId::generate();
        rerun.parent_task_id = Some(self.id.clone());
        rerun.status = TaskStatus::Planning;
        rerun.version = 0;
        rerun.current_step_index = 0;
        rerun.accumulated_findings.clear();
        rerun.created_at = Utc::now();
        for step in &mut rerun.steps {
            step.status = StepStatus::Pending;
            step.outputs.clear();
            step.error = None;
        }
        rerun
    }
}

/// A single unit of work delegated to an external capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    /// Unique step identifier within the task.
    pub id: StepId,

    /// Short human-readable name.
    pub name: String,

    /// What this step does, for operators and checkpoint reviewers.
    #[serde(default)]
    pub description: String,

    /// Identifies the external capability executing this step.
    pub agent_type: String,

    /// Input map; string values may contain template references of the
    /// form `{{step_id.outputs.field}}`.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,

    /// Output map, populated when the step reaches DONE.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,

    /// Ids of steps that must be DONE before this one is ready.
    #[serde(default)]
    pub dependencies: HashSet<StepId>,

    /// Steps sharing a non-null group that are simultaneously ready are
    /// scheduled together.
    #[serde(default)]
    pub parallel_group: Option<String>,

    /// Current step status.
    #[serde(default)]
    pub status: StepStatus,

    /// Critical steps abort an ALL_OR_NOTHING task when they fail.
    #[serde(default = "default_true")]
    pub is_critical: bool,

    /// Executor attempts beyond the first before fallbacks are tried.
    #[serde(default)]
    pub max_retries: u32,

    /// How this step's failure affects the rest of the task.
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Gate this step on human/policy approval before execution.
    #[serde(default)]
    pub checkpoint_required: bool,

    /// Checkpoint settings, when `checkpoint_required` is set.
    #[serde(default)]
    pub checkpoint_config: Option<CheckpointConfig>,

    /// Alternate capabilities tried in order after retries are exhausted.
    #[serde(default)]
    pub fallback_config: Option<FallbackConfig>,

    /// Declared input contract, validated during dispatch.
    #[serde(default)]
    pub input_schema: Option<StepSchema>,

    /// Error text recorded when the step FAILED.
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskStep {
    /// Create a new pending step.
    pub fn new(
        id: impl Into<StepId>,
        name: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            agent_type: agent_type.into(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            dependencies: HashSet::new(),
            parallel_group: None,
            status: StepStatus::Pending,
            is_critical: true,
            max_retries: 0,
            failure_policy: FailurePolicy::default(),
            checkpoint_required: false,
            checkpoint_config: None,
            fallback_config: None,
            input_schema: None,
            error: None,
        }
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder method to add an input.
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Builder method to add a dependency.
    pub fn with_dependency(mut self, dep: impl Into<StepId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Builder method to set the parallel group.
    pub fn with_parallel_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }

    /// Builder method to set the failure policy.
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Builder method to set retries.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to mark the step non-critical.
    pub fn non_critical(mut self) -> Self {
        self.is_critical = false;
        self
    }

    /// Builder method to require a checkpoint before execution.
    pub fn with_checkpoint(mut self, config: CheckpointConfig) -> Self {
        self.checkpoint_required = true;
        self.checkpoint_config = Some(config);
        self
    }

    /// Builder method to attach fallback capabilities.
    pub fn with_fallbacks(mut self, config: FallbackConfig) -> Self {
        self.fallback_config = Some(config);
        self
    }

    /// Builder method to declare the input schema.
    pub fn with_input_schema(mut self, schema: StepSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// A step is ready iff it is PENDING and every dependency is DONE.
    pub fn is_ready(&self, done: &HashSet<StepId>) -> bool {
        self.status == StepStatus::Pending && self.dependencies.iter().all(|d| done.contains(d))
    }

    /// Mark the step DONE with its outputs.
    pub fn complete(&mut self, outputs: HashMap<String, Value>) {
        self.status = StepStatus::Done;
        self.outputs = outputs;
        self.error = None;
    }

    /// Mark the step FAILED with an error.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
    }
}

/// Settings for a step's approval gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Minutes before an unresolved approval times out.
    pub timeout_minutes: i64,

    /// Key matched against learned auto-approval rules.
    pub preference_key: Option<String>,

    /// Shown to the approver alongside the step description.
    pub description: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 60,
            preference_key: None,
            description: None,
        }
    }
}

/// Alternate capabilities tried, in order, after a step's retries are
/// exhausted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Agent types to try instead of the step's primary `agent_type`.
    pub agent_types: Vec<String>,
}

/// Declared type of a step input field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    /// No type constraint.
    #[default]
    Any,
}

impl FieldType {
    /// Whether a JSON value matches this declared type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// Declared contract for one step input field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Expected JSON type of the field.
    pub field_type: FieldType,

    /// Whether dispatch fails when the field is absent after resolution.
    pub required: bool,
}

impl FieldSpec {
    /// A required field of the given type.
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
        }
    }

    /// An optional field of the given type.
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
        }
    }
}

/// Declared input contract for a step: field name -> spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSchema {
    /// Per-field specs.
    pub fields: HashMap<String, FieldSpec>,
}

impl StepSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to add a field spec.
    pub fn with_field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.insert(name.into(), spec);
        self
    }
}

/// Trusted execution context injected into resolved step inputs.
///
/// These values come from Task fields only, never from user-supplied step
/// inputs, so a step cannot spoof another tenant's identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Tenant owning the task.
    pub tenant_id: Option<String>,

    /// Workflow (task) the step belongs to.
    pub workflow_id: String,

    /// Capability executing the step.
    pub agent_id: String,
}

impl ExecutionContext {
    /// Derive the context for one step from trusted Task fields.
    pub fn for_step(task: &Task, step: &TaskStep) -> Self {
        Self {
            tenant_id: task
                .metadata
                .get("tenant_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            workflow_id: task.id.as_str().to_string(),
            agent_id: step.agent_type.clone(),
        }
    }
}
