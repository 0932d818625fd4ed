//! FlowRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Database
//! - Runtime specifics
//!
//! All types here represent the core business domain of FlowRun: tasks
//! decomposed into dependency-linked steps, checkpoint approvals, resource
//! budgets, and the execution tree ledger.

pub mod budget;
pub mod checkpoint;
pub mod error;
pub mod ids;
pub mod status;
pub mod task;
pub mod template;
pub mod tree;

// Re-export commonly used types
pub use budget::{BudgetConfig, BudgetPeriod, ResourceLimit, ResourceType, ResourceUsage};
pub use checkpoint::{CheckpointApproval, TimeoutDisposition};
pub use error::CoreError;
pub use ids::{BudgetId, JobId, StepId, TaskId, TreeId};
pub use status::{ApprovalStatus, FailurePolicy, NodeStatus, StepStatus, TaskStatus};
pub use task::{
    CheckpointConfig, ExecutionContext, FallbackConfig, FieldSpec, FieldType, StepSchema, Task,
    TaskStep, DEFAULT_MAX_PARALLEL_STEPS,
};
pub use template::{resolve_value, validate_value, StepRef, Template, TemplateError};
pub use tree::{ExecutionTree, TreeNode};
