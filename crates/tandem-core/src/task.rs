use crate::types::{Role, TaskFlag, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of work in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub role: Role,
    /// Path globs the assigned worker may mutate while holding this task.
    #[serde(default)]
    pub ownership: Vec<String>,
    pub lane: String,
    /// Position within the lane (write-tests → implement → refactor → review).
    pub phase: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Higher runs first among ready tasks.
    #[serde(default)]
    pub priority: i32,
    /// Shell command run by the shell worker; ignored by other agents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<TaskFlag>,
    #[serde(default)]
    pub failure_accepted: bool,
    #[serde(default)]
    pub plan_rejections: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        role: Role,
        lane: impl Into<String>,
        phase: u32,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            role,
            ownership: Vec::new(),
            lane: lane.into(),
            phase,
            depends_on: Vec::new(),
            priority: 0,
            command: None,
            status: TaskStatus::Pending,
            assigned_to: None,
            blocker: None,
            flag: None,
            failure_accepted: false,
            plan_rejections: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_ownership<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ownership = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() || self.status == TaskStatus::Blocked
    }
}

/// Human-readable summary: "3/5 completed, 1 in progress, 1 blocked, 0 failed"
pub fn summarize(tasks: &[Task]) -> String {
    let total = tasks.len();
    let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
    let in_progress = tasks.iter().filter(|t| t.status.is_active()).count();
    format!(
        "{}/{total} completed, {in_progress} in progress, {} blocked, {} failed",
        count(TaskStatus::Completed),
        count(TaskStatus::Blocked),
        count(TaskStatus::Failed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_is_pending() {
        let t = Task::new("auth-red", "Write failing tests", Role::TestWriter, "auth", 1)
            .with_ownership(["tests/auth/**"]);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.ownership, vec!["tests/auth/**".to_string()]);
        assert!(!t.is_settled());
    }

    #[test]
    fn yaml_omits_runtime_fields() {
        let yaml = "id: a\ndescription: d\nrole: implementer\nlane: core\nphase: 2\n";
        let t: Task = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.role, Role::Implementer);
        assert!(t.depends_on.is_empty());
        assert_eq!(t.priority, 0);
    }

    #[test]
    fn summary_counts() {
        let mut a = Task::new("a", "a", Role::Implementer, "l", 1);
        a.status = TaskStatus::Completed;
        let mut b = Task::new("b", "b", Role::Implementer, "l", 2);
        b.status = TaskStatus::InProgress;
        let c = Task::new("c", "c", Role::Implementer, "l", 3);
        assert_eq!(
            summarize(&[a, b, c]),
            "1/3 completed, 1 in progress, 0 blocked, 0 failed"
        );
    }
}
