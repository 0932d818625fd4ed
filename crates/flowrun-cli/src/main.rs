//! FlowRun CLI - run and validate task plans locally.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use flowrun_core::{validate_value, BudgetConfig, BudgetId, StepId, Task};
use flowrun_engine::{
    BudgetController, CheckpointController, Dispatcher, EchoExecutor, ExecutionTreeManager,
    InMemoryCounterStore, InMemoryTaskStore, LogNotifier, Orchestrator, TaskStore,
};

/// FlowRun - task orchestration and budget control
#[derive(Parser)]
#[command(name = "flowrun")]
#[command(about = "Run and validate FlowRun task plans", long_about = None)]
struct Cli {
    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task plan to completion with the built-in echo executor
    Run {
        /// Path to the task plan JSON
        plan: PathBuf,

        /// Optional budget config JSON applied to the run
        #[arg(short, long)]
        budget: Option<PathBuf>,
    },

    /// Validate a task plan without executing it
    Validate {
        /// Path to the task plan JSON
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { plan, budget } => run_plan(plan, budget).await,
        Commands::Validate { plan } => validate_plan(plan),
    }
}

async fn run_plan(
    plan: PathBuf,
    budget: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut task = load_task(&plan)?;

    let store = InMemoryTaskStore::new();
    let trees = ExecutionTreeManager::new();
    let checkpoints = CheckpointController::with_defaults();
    let executor = EchoExecutor::new();
    let notifier = LogNotifier::new();

    let mut dispatcher = Dispatcher::new(
        store.clone(),
        trees.clone(),
        executor,
        checkpoints.clone(),
    )
    .with_notifier(notifier.clone());

    if let Some(path) = budget {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read budget config '{}': {e}", path.display()))?;
        let config: BudgetConfig = serde_json::from_str(&raw)?;
        let budget_id = BudgetId::new(format!("run:{}", task.id));
        let budgets = BudgetController::new(InMemoryCounterStore::new());
        budgets.create_budget(budget_id.clone(), config).await?;
        task.metadata.insert(
            "budget_id".to_string(),
            serde_json::json!(budget_id.as_str()),
        );
        dispatcher = dispatcher.with_budget_controller(budgets);
    }

    let orchestrator = Orchestrator::new(
        store.clone(),
        trees,
        Arc::new(dispatcher),
        checkpoints,
        notifier,
    );

    let task = orchestrator.submit(task).await?;
    let report = orchestrator.run(&task.id).await?;

    if !report.waiting_checkpoints.is_empty() {
        println!(
            "Task is waiting on checkpoint approval for: {}",
            report
                .waiting_checkpoints
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let final_task = store
        .get_task(&task.id)
        .await
        .ok_or("task disappeared from the store")?;
    println!("{}", serde_json::to_string_pretty(&final_task)?);
    println!(
        "Status: {:?} ({}/{} steps completed, {} dispatched)",
        final_task.status,
        final_task.steps_completed(),
        final_task.steps.len(),
        report.steps_dispatched,
    );
    Ok(())
}

fn validate_plan(plan: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let task = load_task(&plan)?;
    let mut problems = Vec::new();

    let known: Vec<&StepId> = task.steps.iter().map(|s| &s.id).collect();
    for step in &task.steps {
        for dep in &step.dependencies {
            if !known.contains(&dep) {
                problems.push(format!(
                    "step '{}' depends on unknown step '{dep}'",
                    step.id
                ));
            }
        }
        for (key, value) in &step.inputs {
            if let Err(e) = validate_value(value) {
                problems.push(format!("step '{}' input '{key}': {e}", step.id));
            }
        }
    }
    let mut seen = std::collections::HashSet::new();
    for id in &known {
        if !seen.insert(*id) {
            problems.push(format!("duplicate step id '{id}'"));
        }
    }

    if problems.is_empty() {
        println!("OK: {} steps, no problems found", task.steps.len());
        Ok(())
    } else {
        for p in &problems {
            eprintln!("error: {p}");
        }
        Err(format!("{} problem(s) found", problems.len()).into())
    }
}

fn load_task(path: &PathBuf) -> Result<Task, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read task plan '{}': {e}", path.display()))?;
    let task: Task = serde_json::from_str(&raw)?;
    if task.steps.is_empty() {
        return Err("task plan has no steps".into());
    }
    Ok(task)
}
