use crate::error::TandemError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    PlanSubmitted,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::PlanSubmitted => "plan_submitted",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Held by a worker: its ownership claim is live.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Assigned | TaskStatus::PlanSubmitted | TaskStatus::InProgress
        )
    }

    /// Legal edges of the task state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Blocked)
                | (Pending, Failed)
                | (Ready, Assigned)
                | (Ready, Blocked)
                | (Ready, Pending)
                | (Assigned, PlanSubmitted)
                | (Assigned, InProgress)
                | (Assigned, Ready)
                | (Assigned, Blocked)
                | (Assigned, Failed)
                | (PlanSubmitted, Assigned)
                | (PlanSubmitted, InProgress)
                | (PlanSubmitted, Blocked)
                | (PlanSubmitted, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Ready)
                | (InProgress, Assigned)
                | (InProgress, Blocked)
                | (Blocked, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskFlag
// ---------------------------------------------------------------------------

/// Why a task ended up Blocked or Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFlag {
    RepeatedPlanRejection,
    FailedDependency,
    OwnershipViolation,
    WorkerUnresponsive,
}

impl TaskFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskFlag::RepeatedPlanRejection => "repeated_plan_rejection",
            TaskFlag::FailedDependency => "failed_dependency",
            TaskFlag::OwnershipViolation => "ownership_violation",
            TaskFlag::WorkerUnresponsive => "worker_unresponsive",
        }
    }
}

impl fmt::Display for TaskFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkerStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Planning,
    AwaitingApproval,
    Working,
    Blocked,
    ShutdownRequested,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Planning => "planning",
            WorkerStatus::AwaitingApproval => "awaiting_approval",
            WorkerStatus::Working => "working",
            WorkerStatus::Blocked => "blocked",
            WorkerStatus::ShutdownRequested => "shutdown_requested",
            WorkerStatus::Stopped => "stopped",
        }
    }

    pub fn is_busy(self) -> bool {
        matches!(
            self,
            WorkerStatus::Planning | WorkerStatus::AwaitingApproval | WorkerStatus::Working
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// Capability tag shared by tasks and workers. A worker only accepts tasks
/// carrying its own role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    TestWriter,
    Implementer,
    Refactorer,
    Reviewer,
    Analyst,
}

impl Role {
    pub fn all() -> &'static [Role] {
        &[
            Role::TestWriter,
            Role::Implementer,
            Role::Refactorer,
            Role::Reviewer,
            Role::Analyst,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::TestWriter => "test_writer",
            Role::Implementer => "implementer",
            Role::Refactorer => "refactorer",
            Role::Reviewer => "reviewer",
            Role::Analyst => "analyst",
        }
    }

    /// Roles that must get a plan approved before executing, unless the
    /// config overrides it.
    pub fn plan_required_by_default(self) -> bool {
        matches!(
            self,
            Role::TestWriter | Role::Implementer | Role::Refactorer
        )
    }

    /// Read-only roles never declare file targets.
    pub fn is_read_only(self) -> bool {
        matches!(self, Role::Reviewer | Role::Analyst)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test_writer" | "test-writer" | "tester" => Ok(Role::TestWriter),
            "implementer" => Ok(Role::Implementer),
            "refactorer" => Ok(Role::Refactorer),
            "reviewer" => Ok(Role::Reviewer),
            "analyst" => Ok(Role::Analyst),
            _ => Err(TandemError::InvalidRole(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Ready,
            TaskStatus::Assigned,
            TaskStatus::PlanSubmitted,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Blocked,
        ];
        for from in [TaskStatus::Completed, TaskStatus::Failed] {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn rejected_plan_returns_task_to_assigned() {
        assert!(TaskStatus::PlanSubmitted.can_transition_to(TaskStatus::Assigned));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn role_parse_accepts_aliases() {
        assert_eq!("test-writer".parse::<Role>().unwrap(), Role::TestWriter);
        assert_eq!("reviewer".parse::<Role>().unwrap(), Role::Reviewer);
        assert!("wizard".parse::<Role>().is_err());
    }

    #[test]
    fn role_yaml_is_snake_case() {
        let yaml = serde_yaml::to_string(&Role::TestWriter).unwrap();
        assert_eq!(yaml.trim(), "test_writer");
        let status = serde_json::to_string(&TaskStatus::PlanSubmitted).unwrap();
        assert_eq!(status, "\"plan_submitted\"");
    }
}
