//! Dependency-ordered execution plan.
//!
//! Iterative topological layering: each round schedules every task whose
//! dependencies are already scheduled, lowest priority value first. A round
//! with no ready task (cycle or unknown reference) schedules the single
//! lowest-priority remaining task anyway. Rounds are capped at `2 × N`;
//! anything left after that is appended by priority. The scheduler always
//! terminates and never drops a task.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::{ConversationContext, Turn};
use crate::pipeline::types::{Intent, ScheduledTask, TaskSpec};

/// Execution order over a slice of task specs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOrder {
    /// Indices into the input slice, in execution order.
    pub order: Vec<usize>,
    /// Layering rounds used.
    pub iterations: usize,
    /// Rounds that had to break a deadlock by priority.
    pub cycle_breaks: usize,
    /// Tasks appended after the round cap without dependency checks.
    pub forced: usize,
}

/// Order task specs by dependencies, then priority.
pub fn order_tasks(specs: &[TaskSpec]) -> TaskOrder {
    let max_iterations = specs.len() * 2;
    let mut order = Vec::with_capacity(specs.len());
    let mut scheduled: HashSet<&str> = HashSet::with_capacity(specs.len());
    // Stable by priority so ties keep the model's order.
    let mut remaining: Vec<usize> = (0..specs.len()).collect();
    remaining.sort_by_key(|&i| specs[i].priority);

    let mut iterations = 0;
    let mut cycle_breaks = 0;

    while !remaining.is_empty() && iterations < max_iterations {
        iterations += 1;

        let mut ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| {
                specs[i]
                    .depends_on
                    .iter()
                    .all(|dep| scheduled.contains(dep.as_str()))
            })
            .collect();

        if ready.is_empty() {
            // `remaining` is priority-sorted, so the head is the lowest.
            let pick = remaining[0];
            let stuck: Vec<&str> = remaining.iter().map(|&i| specs[i].id.as_str()).collect();
            warn!(
                task_id = %specs[pick].id,
                remaining = ?stuck,
                "Dependency cycle or unknown reference, scheduling by priority"
            );
            cycle_breaks += 1;
            ready.push(pick);
        }

        for &i in &ready {
            order.push(i);
            scheduled.insert(specs[i].id.as_str());
        }
        remaining.retain(|i| !ready.contains(i));
    }

    let forced = remaining.len();
    if forced > 0 {
        warn!(forced, "Round cap reached, appending remaining tasks by priority");
        order.extend(remaining);
    }

    TaskOrder {
        order,
        iterations,
        cycle_breaks,
        forced,
    }
}

/// Build the execution plan for an intent, attaching the shared context.
pub fn schedule(intent: &Intent, context: &ConversationContext) -> Vec<ScheduledTask> {
    let plan = order_tasks(&intent.tasks);
    let turns: Arc<[Turn]> = Arc::from(context.turns.clone());

    debug!(
        tasks = plan.order.len(),
        iterations = plan.iterations,
        cycle_breaks = plan.cycle_breaks,
        "Scheduled tasks"
    );

    plan.order
        .into_iter()
        .enumerate()
        .map(|(position, i)| {
            ScheduledTask::new(
                intent.tasks[i].clone(),
                position,
                Arc::clone(&turns),
                context.attachment.clone(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{ExecutionStrategy, IntentOrigin, TaskKind};

    fn spec(id: &str, priority: i32, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: id.into(),
            kind: TaskKind::TextGeneration,
            description: id.into(),
            input: String::new(),
            priority,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn ids(specs: &[TaskSpec], order: &TaskOrder) -> Vec<String> {
        order.order.iter().map(|&i| specs[i].id.clone()).collect()
    }

    #[test]
    fn independent_tasks_sort_by_priority() {
        let specs = vec![spec("c", 3, &[]), spec("a", 1, &[]), spec("b", 2, &[])];
        let order = order_tasks(&specs);
        assert_eq!(ids(&specs, &order), vec!["a", "b", "c"]);
        assert_eq!(order.iterations, 1);
        assert_eq!(order.cycle_breaks, 0);
    }

    #[test]
    fn equal_priorities_keep_input_order() {
        let specs = vec![spec("x", 5, &[]), spec("y", 5, &[]), spec("z", 5, &[])];
        assert_eq!(ids(&specs, &order_tasks(&specs)), vec!["x", "y", "z"]);
    }

    #[test]
    fn dependencies_override_priority() {
        let specs = vec![spec("draw", 1, &["describe"]), spec("describe", 9, &[])];
        let order = order_tasks(&specs);
        assert_eq!(ids(&specs, &order), vec!["describe", "draw"]);
        assert_eq!(order.iterations, 2);
    }

    #[test]
    fn layers_run_in_rounds() {
        let specs = vec![
            spec("a", 1, &[]),
            spec("b", 1, &["a"]),
            spec("c", 0, &["a"]),
            spec("d", 1, &["b", "c"]),
        ];
        assert_eq!(ids(&specs, &order_tasks(&specs)), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn cycle_is_broken_by_priority() {
        let specs = vec![
            spec("a", 2, &["b"]),
            spec("b", 1, &["a"]),
            spec("free", 3, &[]),
        ];
        let order = order_tasks(&specs);
        assert_eq!(ids(&specs, &order), vec!["free", "b", "a"]);
        assert_eq!(order.cycle_breaks, 1);
        assert!(order.iterations <= specs.len() * 2);
    }

    #[test]
    fn unknown_reference_is_scheduled_anyway() {
        let specs = vec![spec("a", 1, &["ghost"]), spec("b", 2, &["a"])];
        let order = order_tasks(&specs);
        assert_eq!(ids(&specs, &order), vec!["a", "b"]);
        assert_eq!(order.cycle_breaks, 1);
    }

    #[test]
    fn every_task_appears_exactly_once_in_dense_cycles() {
        // Every task depends on every other task.
        let names: Vec<String> = (0..7).map(|i| format!("t{i}")).collect();
        let specs: Vec<TaskSpec> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let deps: Vec<&str> = names
                    .iter()
                    .filter(|n| *n != name)
                    .map(String::as_str)
                    .collect();
                spec(name, (7 - i) as i32, &deps)
            })
            .collect();
        let order = order_tasks(&specs);
        let mut seen = order.order.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert!(order.iterations <= specs.len() * 2);
    }

    #[test]
    fn self_dependency_does_not_hang() {
        let specs = vec![spec("loop", 1, &["loop"])];
        let order = order_tasks(&specs);
        assert_eq!(order.order, vec![0]);
        assert_eq!(order.cycle_breaks, 1);
    }

    #[test]
    fn empty_input_is_empty_plan() {
        let order = order_tasks(&[]);
        assert!(order.order.is_empty());
        assert_eq!(order.iterations, 0);
    }

    #[test]
    fn schedule_attaches_shared_context() {
        let intent = Intent {
            summary: "s".into(),
            tasks: vec![spec("b", 2, &[]), spec("a", 1, &[])],
            strategy: ExecutionStrategy::Sequential,
            estimated_seconds: 0,
            origin: IntentOrigin::Model,
        };
        let ctx = ConversationContext {
            turns: vec![Turn::user("Minji", "hello")],
            ..ConversationContext::default()
        };
        let tasks = schedule(&intent, &ctx);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id(), "a");
        assert_eq!(tasks[0].order, 0);
        assert_eq!(tasks[1].order, 1);
        assert_eq!(tasks[1].turns.len(), 1);
        assert!(Arc::ptr_eq(&tasks[0].turns, &tasks[1].turns));
    }
}
