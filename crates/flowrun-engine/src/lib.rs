//! FlowRun Orchestration Engine
//!
//! Runtime components driving [`flowrun_core`] tasks to completion:
//!
//! - [`scheduler`]: pure readiness computation over task snapshots
//! - [`dispatcher`]: template resolution, validation, and executor handoff
//! - [`orchestrator`]: the scheduling loop, failure policies, pause/resume
//! - [`checkpoint`]: approval gates with learned auto-approval
//! - [`budget`]: hierarchical resource budgets over atomic counters
//! - [`tree`]: execution tree bookkeeping shared by pause and audit
//! - [`store`] / [`counter`]: storage ports with in-memory implementations
//! - [`executor`] / [`notify`]: outbound ports to capabilities and humans

pub mod budget;
pub mod checkpoint;
pub mod counter;
pub mod dispatcher;
pub mod executor;
pub mod notify;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod tree;

pub use budget::{BudgetController, BudgetError};
pub use checkpoint::{
    CheckpointController, CheckpointDecision, CheckpointError, CheckpointPolicy, ExpiredCheckpoint,
};
pub use counter::{CounterResult, CounterStore, InMemoryCounterStore};
pub use dispatcher::{DispatchError, DispatchResult, DispatchStatus, Dispatcher};
pub use executor::{
    parse_executor_response, EchoExecutor, ExecutionRequest, ExecutorError, ScriptedExecutor,
    StepExecutor, StepOutcome,
};
pub use notify::{LogNotifier, Notifier, StepEvent};
pub use orchestrator::{Orchestrator, OrchestratorError, RunReport};
pub use scheduler::{is_stalled, ready_groups, ready_steps};
pub use store::{InMemoryTaskStore, StepUpdate, StoreError, TaskPatch, TaskStore};
pub use tree::{ExecutionTreeManager, TreeError};
