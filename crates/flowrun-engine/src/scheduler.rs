//! Readiness scheduler.
//!
//! Pure functions over a Task snapshot: no side effects, idempotent, safe
//! to call repeatedly. A step is ready iff it is PENDING and every
//! dependency is DONE. Steps on a dependency cycle never become ready;
//! cycle validation belongs to plan validation upstream, the stall is
//! surfaced by the orchestrator loop.

use flowrun_core::{StepStatus, Task, TaskStep};

/// Ready steps of a task, in declaration order.
pub fn ready_steps(task: &Task) -> Vec<&TaskStep> {
    let done = task.done_step_ids();
    task.steps.iter().filter(|s| s.is_ready(&done)).collect()
}

/// Ready steps partitioned into independently dispatchable groups.
///
/// Steps sharing a non-null `parallel_group` that are ready at this
/// snapshot form one group; every other ready step is its own singleton
/// group. Groups preserve step declaration order. Callers may dispatch all
/// groups concurrently, throttled to `task.max_parallel_steps` in-flight
/// steps overall.
pub fn ready_groups(task: &Task) -> Vec<Vec<TaskStep>> {
    let mut groups: Vec<(Option<String>, Vec<TaskStep>)> = Vec::new();

    for step in ready_steps(task) {
        match &step.parallel_group {
            Some(key) => {
                let entry = groups
                    .iter_mut()
                    .find(|(k, _)| k.as_deref() == Some(key.as_str()));
                match entry {
                    Some((_, members)) => members.push(step.clone()),
                    None => groups.push((Some(key.clone()), vec![step.clone()])),
                }
            }
            None => groups.push((None, vec![step.clone()])),
        }
    }

    groups.into_iter().map(|(_, members)| members).collect()
}

/// True when the task can make no further progress: nothing is ready,
/// nothing is running, but pending steps remain. With no in-flight work
/// this means unsatisfiable dependencies (typically a cycle or a
/// dependency on a failed step).
pub fn is_stalled(task: &Task) -> bool {
    let any_pending = task.steps.iter().any(|s| s.status == StepStatus::Pending);
    let any_running = task.steps.iter().any(|s| s.status == StepStatus::Running);
    any_pending && !any_running && ready_steps(task).is_empty()
}
