//! Core domain errors.

use thiserror::Error;

/// Core domain errors for FlowRun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Step not found within a task.
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// Budget not found.
    #[error("Budget not found: {0}")]
    BudgetNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Actor does not own the referenced resource.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Invalid input or configuration.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
