//! Operator interventions on a stopped workflow.
//!
//! A run settles with some tasks Failed or Blocked. These functions change
//! their status in the saved context so the next `--resume` picks the
//! change up. The caller loads and saves the context.

use crate::context::{LogKind, WorkflowContext};
use crate::error::{Result, TandemError};
use crate::graph::TaskGraph;
use crate::types::TaskStatus;
use tracing::{info, warn};

/// Apply a saved context's statuses and accepted failures to a freshly built
/// graph. Returns ids the context knows but the graph does not.
pub fn restore(graph: &mut TaskGraph, ctx: &WorkflowContext) -> Vec<String> {
    let unknown = graph.apply_statuses(&ctx.task_status);
    for id in &ctx.accepted_failures {
        if let Err(e) = graph.accept_failure(id) {
            warn!(task = %id, error = %e, "ignoring stale accepted failure");
        }
    }
    unknown
}

/// Count a failed task as done for workflow completion.
pub fn accept_failure(graph: &mut TaskGraph, ctx: &mut WorkflowContext, task_id: &str) -> Result<()> {
    graph.accept_failure(task_id)?;
    ctx.accepted_failures.insert(task_id.to_string());
    ctx.record_decision(format!("accepted failure of {task_id}"), Some(task_id));
    ctx.log_task(LogKind::Transition, task_id, "failure accepted");
    ctx.task_status = graph.statuses();
    info!(workflow = %ctx.workflow_id, task = %task_id, "failure accepted");
    Ok(())
}

/// Release a blocked task back to scheduling with a fresh rejection count.
/// Fails when the task would be blocked again by a failed dependency.
pub fn unblock(graph: &mut TaskGraph, ctx: &mut WorkflowContext, task_id: &str) -> Result<TaskStatus> {
    let before = graph.get(task_id)?.status;
    graph.unblock(task_id)?;
    let task = graph.get(task_id)?;
    if task.status == TaskStatus::Blocked {
        return Err(TandemError::InvalidTransition {
            task: task_id.to_string(),
            from: before.to_string(),
            to: TaskStatus::Pending.to_string(),
            reason: task
                .blocker
                .clone()
                .unwrap_or_else(|| "still blocked".to_string()),
        });
    }
    let status = task.status;
    ctx.log_task(LogKind::Transition, task_id, format!("unblocked: now {status}"));
    ctx.task_status = graph.statuses();
    info!(workflow = %ctx.workflow_id, task = %task_id, %status, "task unblocked");
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::types::Role;

    fn graph() -> TaskGraph {
        let mut b = Task::new("b", "task b", Role::Implementer, "core", 2);
        b.depends_on = vec!["a".into()];
        let c = Task::new("c", "task c", Role::Implementer, "side", 1);
        TaskGraph::from_tasks(vec![Task::new("a", "task a", Role::Implementer, "core", 1), b, c])
            .unwrap()
    }

    fn saved(statuses: &[(&str, TaskStatus)]) -> WorkflowContext {
        let mut ctx = WorkflowContext::new("wf-1");
        for (id, status) in statuses {
            ctx.set_task_status(id, *status);
        }
        ctx
    }

    #[test]
    fn accepted_failure_survives_restore() {
        let mut ctx = saved(&[
            ("a", TaskStatus::Failed),
            ("b", TaskStatus::Blocked),
            ("c", TaskStatus::Completed),
        ]);
        let mut g = graph();
        restore(&mut g, &ctx);
        accept_failure(&mut g, &mut ctx, "a").unwrap();
        assert!(ctx.accepted_failures.contains("a"));
        assert!(ctx.decisions[0].summary.contains("accepted failure of a"));

        let mut fresh = graph();
        restore(&mut fresh, &ctx);
        assert!(fresh.get("a").unwrap().failure_accepted);
        assert!(!fresh.is_workflow_complete());
    }

    #[test]
    fn accepting_a_task_that_did_not_fail_is_refused() {
        let mut ctx = saved(&[("c", TaskStatus::Completed)]);
        let mut g = graph();
        restore(&mut g, &ctx);
        let err = accept_failure(&mut g, &mut ctx, "c").unwrap_err();
        assert_eq!(err.kind(), "InvalidTransitionError");
        assert!(ctx.accepted_failures.is_empty());
    }

    #[test]
    fn unblock_makes_a_task_schedulable_again() {
        let mut ctx = saved(&[("a", TaskStatus::Completed), ("b", TaskStatus::Blocked)]);
        let mut g = graph();
        restore(&mut g, &ctx);
        assert_eq!(unblock(&mut g, &mut ctx, "b").unwrap(), TaskStatus::Ready);
        assert_eq!(ctx.task_status["b"], TaskStatus::Ready);
    }

    #[test]
    fn unblock_behind_a_failed_dependency_fails() {
        let mut ctx = saved(&[("a", TaskStatus::Failed), ("b", TaskStatus::Blocked)]);
        let mut g = graph();
        restore(&mut g, &ctx);
        let err = unblock(&mut g, &mut ctx, "b").unwrap_err();
        assert!(err.to_string().contains("dependency 'a' failed"));
        assert_eq!(ctx.task_status["b"], TaskStatus::Blocked);
    }
}
