use crate::error::{Result, TandemError};
use crate::graph::TaskGraph;
use crate::ownership::Boundary;
use crate::paths;
use crate::task::Task;
use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

// ---------------------------------------------------------------------------
// Definition types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Shell,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDef {
    pub id: String,
    pub role: Role,
    /// Base boundary, used for tasks that declare no ownership of their own.
    #[serde(default)]
    pub ownership: Vec<String>,
    #[serde(default)]
    pub agent: AgentKind,
}

/// Optional shell commands for the generated lane tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaneCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub red: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub green: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refactor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<String>,
}

/// A feature decomposed into red → green → refactor → review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneDef {
    pub name: String,
    pub feature: String,
    pub tests: Vec<String>,
    pub source: Vec<String>,
    #[serde(default = "default_true")]
    pub review: bool,
    #[serde(default)]
    pub priority: i32,
    /// Task ids (from any lane) the lane's first task waits for.
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub commands: LaneCommands,
}

fn default_true() -> bool {
    true
}

/// A workflow file: workers plus explicit tasks and/or generated lanes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub workers: Vec<WorkerDef>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub lanes: Vec<LaneDef>,
}

impl WorkflowDef {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Explicit tasks followed by every lane's generated tasks.
    pub fn expand(&self) -> Vec<Task> {
        let mut tasks = self.tasks.clone();
        for lane in &self.lanes {
            tasks.extend(tdd_lane(lane));
        }
        tasks
    }

    /// Check the definition and build its task graph.
    pub fn build(&self) -> Result<TaskGraph> {
        paths::validate_workflow_id(&self.id)?;
        if self.workers.is_empty() {
            return Err(TandemError::InvalidWorkflow("no workers defined".to_string()));
        }

        let mut worker_ids = BTreeSet::new();
        for w in &self.workers {
            if !worker_ids.insert(w.id.as_str()) {
                return Err(TandemError::InvalidWorkflow(format!(
                    "duplicate worker id '{}'",
                    w.id
                )));
            }
            Boundary::new(&w.ownership)?;
        }

        let tasks = self.expand();
        if tasks.is_empty() {
            return Err(TandemError::InvalidWorkflow("no tasks defined".to_string()));
        }
        let roles: BTreeSet<Role> = self.workers.iter().map(|w| w.role).collect();
        for task in &tasks {
            if !roles.contains(&task.role) {
                return Err(TandemError::InvalidWorkflow(format!(
                    "task '{}' needs a {} but no worker has that role",
                    task.id, task.role
                )));
            }
            Boundary::new(&task.ownership)?;
        }
        TaskGraph::from_tasks(tasks)
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerDef> {
        self.workers.iter().find(|w| w.id == id)
    }
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

/// Generate the lane's tasks. Ids are `<lane>-red`, `<lane>-green`,
/// `<lane>-refactor` and `<lane>-review`, each depending on the previous.
pub fn tdd_lane(lane: &LaneDef) -> Vec<Task> {
    let name = &lane.name;
    let steps: [(&str, Role, String, &[String], &Option<String>); 4] = [
        (
            "red",
            Role::TestWriter,
            format!("Write failing tests for {}", lane.feature),
            &lane.tests,
            &lane.commands.red,
        ),
        (
            "green",
            Role::Implementer,
            format!("Implement {}", lane.feature),
            &lane.source,
            &lane.commands.green,
        ),
        (
            "refactor",
            Role::Refactorer,
            format!("Refactor {}", lane.feature),
            &lane.source,
            &lane.commands.refactor,
        ),
        (
            "review",
            Role::Reviewer,
            format!("Review {}", lane.feature),
            &[],
            &lane.commands.review,
        ),
    ];

    let mut tasks: Vec<Task> = Vec::new();
    for (phase, (step, role, description, ownership, command)) in steps.into_iter().enumerate() {
        if step == "review" && !lane.review {
            continue;
        }
        let mut task = Task::new(
            format!("{name}-{step}"),
            description,
            role,
            name.as_str(),
            phase as u32 + 1,
        )
        .with_ownership(ownership.iter().cloned())
        .with_priority(lane.priority);
        if let Some(cmd) = command {
            task = task.with_command(cmd.clone());
        }
        task.depends_on = match tasks.last() {
            Some(prev) => vec![prev.id.clone()],
            None => lane.after.clone(),
        };
        tasks.push(task);
    }
    tasks
}

/// Group tasks into waves: each wave only depends on earlier waves.
pub fn waves(graph: &TaskGraph) -> Vec<Vec<String>> {
    let mut level: HashMap<&str, usize> = HashMap::new();
    let mut remaining: Vec<&Task> = graph.tasks().iter().collect();
    while !remaining.is_empty() {
        let before = remaining.len();
        remaining.retain(|t| {
            let deps: Option<Vec<usize>> = t
                .depends_on
                .iter()
                .map(|d| level.get(d.as_str()).copied())
                .collect();
            match deps {
                Some(deps) => {
                    let lvl = deps.into_iter().map(|l| l + 1).max().unwrap_or(0);
                    level.insert(t.id.as_str(), lvl);
                    false
                }
                None => true,
            }
        });
        if remaining.len() == before {
            // A graph built through TaskGraph is acyclic; stop rather than spin.
            break;
        }
    }

    let mut grouped: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for t in graph.tasks() {
        if let Some(&lvl) = level.get(t.id.as_str()) {
            grouped.entry(lvl).or_default().push(t.id.clone());
        }
    }
    grouped.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;

    const WORKFLOW: &str = r#"
id: auth-feature
description: Login and session handling
workers:
  - id: tester
    role: test_writer
    ownership: ["tests/**"]
  - id: dev
    role: implementer
    ownership: ["src/**"]
  - id: tidy
    role: refactorer
    ownership: ["src/**"]
  - id: critic
    role: reviewer
    agent: simulated
tasks:
  - id: docs
    description: Document the auth flow
    role: implementer
    lane: docs
    phase: 1
    ownership: ["docs/auth.md"]
lanes:
  - name: auth
    feature: login validation
    tests: ["tests/auth/**"]
    source: ["src/auth/**"]
  - name: session
    feature: session expiry
    tests: ["tests/session/**"]
    source: ["src/session/**"]
    review: false
    after: ["auth-green"]
"#;

    #[test]
    fn parses_and_builds_graph() {
        let def = WorkflowDef::from_yaml(WORKFLOW).unwrap();
        assert_eq!(def.worker("critic").unwrap().agent, AgentKind::Simulated);
        assert_eq!(def.worker("dev").unwrap().agent, AgentKind::Shell);
        let graph = def.build().unwrap();
        assert_eq!(graph.len(), 1 + 4 + 3);
        let ready: Vec<&str> = graph.ready_tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["auth-red", "docs"]);
    }

    #[test]
    fn lane_tasks_chain_in_phase_order() {
        let def = WorkflowDef::from_yaml(WORKFLOW).unwrap();
        let tasks = tdd_lane(&def.lanes[0]);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["auth-red", "auth-green", "auth-refactor", "auth-review"]);
        assert_eq!(tasks[1].depends_on, vec!["auth-red".to_string()]);
        assert_eq!(tasks[2].phase, 3);
        assert_eq!(tasks[0].role, Role::TestWriter);
        assert!(tasks[3].ownership.is_empty());
        assert_eq!(tasks[0].status, TaskStatus::Pending);
    }

    #[test]
    fn lane_after_links_first_task() {
        let def = WorkflowDef::from_yaml(WORKFLOW).unwrap();
        let tasks = tdd_lane(&def.lanes[1]);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].depends_on, vec!["auth-green".to_string()]);
    }

    #[test]
    fn missing_role_is_rejected() {
        let yaml = "id: wf\nworkers:\n  - id: dev\n    role: implementer\ntasks:\n  - id: t\n    description: d\n    role: reviewer\n    lane: l\n    phase: 1\n";
        let err = WorkflowDef::from_yaml(yaml).unwrap().build().unwrap_err();
        assert_eq!(err.kind(), "InvalidWorkflow");
    }

    #[test]
    fn cyclic_tasks_are_rejected() {
        let yaml = r#"
id: wf
workers:
  - id: dev
    role: implementer
tasks:
  - { id: a, description: a, role: implementer, lane: l, phase: 1, depends_on: [b] }
  - { id: b, description: b, role: implementer, lane: l, phase: 2, depends_on: [a] }
"#;
        let err = WorkflowDef::from_yaml(yaml).unwrap().build().unwrap_err();
        assert_eq!(err.kind(), "CycleError");
    }

    #[test]
    fn waves_follow_dependencies() {
        let def = WorkflowDef::from_yaml(WORKFLOW).unwrap();
        let graph = def.build().unwrap();
        let w = waves(&graph);
        assert_eq!(w[0], vec!["docs", "auth-red"]);
        assert_eq!(w[1], vec!["auth-green"]);
        assert_eq!(w[2], vec!["auth-refactor", "session-red"]);
    }
}
