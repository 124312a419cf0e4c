use crate::context::{ContextSummary, WorkflowContext};
use crate::graph::{TaskCounts, TaskGraph};
use crate::types::TaskStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One task that did not complete, with enough to resume from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub task_id: String,
    /// Error kind, e.g. `RepeatedPlanRejection` or `TaskFailed`.
    pub kind: String,
    pub message: String,
    /// Last live checkpoint when the failure was recorded.
    pub last_checkpoint: Option<String>,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(task_id: &str, kind: &str, message: impl Into<String>, ctx: &WorkflowContext) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            message: message.into(),
            last_checkpoint: ctx.last_checkpoint().map(|c| c.id.clone()),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task completed (or failed with the failure accepted).
    Completed,
    /// Some lanes finished, others failed or were blocked.
    Partial,
    /// Nothing completed.
    Failed,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub workflow_id: String,
    pub outcome: RunOutcome,
    pub counts: TaskCounts,
    pub failures: Vec<FailureRecord>,
    pub checkpoints: Vec<String>,
    pub modified_files: Vec<String>,
    pub pending_actions: Vec<String>,
    pub summary: ContextSummary,
}

impl FinalReport {
    /// Build the report from the final graph and context.
    ///
    /// `recorded` holds failures captured while the run was live. Tasks left
    /// Failed or Blocked without a record (e.g. blocked by a failed
    /// dependency) get one derived from the graph.
    pub fn build(
        graph: &TaskGraph,
        ctx: &WorkflowContext,
        recorded: &BTreeMap<String, FailureRecord>,
    ) -> Self {
        let counts = graph.counts();
        let mut failures = Vec::new();
        for task in graph.tasks() {
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::Blocked) {
                continue;
            }
            if task.status == TaskStatus::Failed && task.failure_accepted {
                continue;
            }
            let record = match recorded.get(&task.id) {
                Some(r) => r.clone(),
                None => {
                    let kind = match task.flag {
                        Some(flag) => flag_kind(flag.as_str()),
                        None if task.status == TaskStatus::Blocked => "Blocked".to_string(),
                        None => "TaskFailed".to_string(),
                    };
                    FailureRecord::new(
                        &task.id,
                        &kind,
                        task.blocker.clone().unwrap_or_default(),
                        ctx,
                    )
                }
            };
            failures.push(record);
        }

        let outcome = if graph.is_workflow_complete() {
            RunOutcome::Completed
        } else if counts.completed > 0 {
            RunOutcome::Partial
        } else {
            RunOutcome::Failed
        };

        Self {
            workflow_id: ctx.workflow_id.clone(),
            outcome,
            counts,
            failures,
            checkpoints: ctx.live_checkpoints().map(|c| c.id.clone()).collect(),
            modified_files: ctx.modified_files.iter().cloned().collect(),
            pending_actions: ctx.pending_actions.clone(),
            summary: ctx.summary(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let c = &self.counts;
        let _ = writeln!(out, "Workflow {}: {}", self.workflow_id, self.outcome.as_str());
        let _ = writeln!(
            out,
            "  tasks: {} total, {} completed, {} failed, {} blocked, {} pending",
            c.total, c.completed, c.failed, c.blocked, c.pending
        );
        let _ = writeln!(out, "  elapsed: {}s", self.summary.elapsed_secs);
        if !self.checkpoints.is_empty() {
            let _ = writeln!(out, "  checkpoints: {}", self.checkpoints.join(", "));
        }
        if !self.modified_files.is_empty() {
            let _ = writeln!(out, "  modified: {} files", self.modified_files.len());
        }
        if !self.failures.is_empty() {
            let _ = writeln!(out, "  failures:");
            for f in &self.failures {
                let _ = writeln!(
                    out,
                    "    {} [{}] {} (last checkpoint: {})",
                    f.task_id,
                    f.kind,
                    f.message,
                    f.last_checkpoint.as_deref().unwrap_or("none")
                );
            }
        }
        for action in &self.pending_actions {
            let _ = writeln!(out, "  pending: {action}");
        }
        out
    }
}

/// `failed_dependency` → `FailedDependency`
fn flag_kind(flag: &str) -> String {
    flag.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
