//! Worker side of the orchestrator contract.
//!
//! A worker is a tokio task wrapping an [`Agent`]. It receives [`Directive`]s
//! on its own bounded channel and answers with [`WorkerEvent`]s on the shared
//! event channel. Workers never touch the task graph or the context.

use crate::plan::PlanReview;
use crate::task::Task;
use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Orchestrator → worker.
#[derive(Debug, Clone)]
pub enum Directive {
    Assign { task: Task, plan_required: bool },
    PlanResult { task_id: String, review: PlanReview },
    /// Advisory nudge after a stall; the worker may continue or yield.
    Redirect { task_id: String, message: String },
    /// The last report was rejected; execute again within the boundary.
    Resubmit { task_id: String, reason: String },
    Cancel { task_id: String },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub task_id: String,
    pub status: Outcome,
    pub files_modified: Vec<String>,
    pub notes: String,
}

/// Worker → orchestrator. Every variant names its sender.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Ack {
        worker_id: String,
        task_id: String,
    },
    PlanSubmitted {
        worker_id: String,
        task_id: String,
        targets: Vec<String>,
        rationale: String,
    },
    Progress {
        worker_id: String,
        task_id: String,
        note: String,
    },
    Report {
        worker_id: String,
        report: Report,
    },
    SharedChange {
        worker_id: String,
        path: String,
        change: String,
    },
    Yield {
        worker_id: String,
        task_id: String,
        reason: String,
    },
    ShutdownAck {
        worker_id: String,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerEvent::Ack { worker_id, .. }
            | WorkerEvent::PlanSubmitted { worker_id, .. }
            | WorkerEvent::Progress { worker_id, .. }
            | WorkerEvent::Report { worker_id, .. }
            | WorkerEvent::SharedChange { worker_id, .. }
            | WorkerEvent::Yield { worker_id, .. }
            | WorkerEvent::ShutdownAck { worker_id } => worker_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanDraft {
    pub targets: Vec<String>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub status: Outcome,
    pub files_modified: Vec<String>,
    pub notes: String,
    /// `(path, change)` pairs the agent needs outside its boundary.
    pub shared_changes: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectResponse {
    Continue,
    Yield(String),
}

/// The capability a worker wraps. `execute` runs on the blocking pool while
/// the worker keeps answering directives, so `on_redirect` may be called
/// concurrently with it.
pub trait Agent: Send + Sync + 'static {
    /// Propose targets and a rationale. `feedback` holds the previous
    /// rejection's notes, empty on the first attempt.
    fn plan(&self, task: &Task, feedback: &[String]) -> PlanDraft;

    fn execute(&self, task: &Task) -> Execution;

    fn on_redirect(&self, _task: &Task, _message: &str) -> RedirectResponse {
        RedirectResponse::Continue
    }

    fn on_resubmit(&self, _task: &Task, _reason: &str) {}
}

/// Concrete file paths a task's ownership globs would produce, one per glob.
pub fn concrete_targets(task: &Task) -> Vec<String> {
    let slug = task.id.replace(|c: char| !c.is_ascii_alphanumeric(), "_");
    let file = if task.role == Role::TestWriter {
        format!("{slug}_test.rs")
    } else {
        format!("{slug}.rs")
    };
    task.ownership
        .iter()
        .map(|pattern| {
            match pattern.find(['*', '?', '[', '{']) {
                None => pattern.clone(),
                Some(pos) => {
                    let prefix = &pattern[..pos];
                    let dir = prefix.rfind('/').map(|i| &prefix[..=i]).unwrap_or("");
                    format!("{dir}{file}")
                }
            }
        })
        .collect()
}

/// Role-appropriate rationale for a task.
pub fn default_rationale(task: &Task) -> String {
    let what = task.description.trim_end_matches('.');
    match task.role {
        Role::TestWriter => format!(
            "Write failing tests for {what}; assert expected results and cover empty input, \
             invalid values and error paths"
        ),
        Role::Implementer => {
            format!("Implement {what} with the smallest change that makes the failing tests pass")
        }
        Role::Refactorer => format!(
            "Restructure {what} for clarity; behavior is preserved and tests stay green"
        ),
        Role::Reviewer => format!("Review {what} for correctness and ownership compliance"),
        Role::Analyst => format!("Analyze {what} and record findings as decisions"),
    }
}

fn draft_for(task: &Task) -> PlanDraft {
    PlanDraft {
        targets: if task.role.is_read_only() {
            Vec::new()
        } else {
            concrete_targets(task)
        },
        rationale: default_rationale(task),
    }
}

// ---------------------------------------------------------------------------
// SimulatedAgent
// ---------------------------------------------------------------------------

/// Deterministic agent for dry runs and tests. By default it plans within its
/// boundary and completes every task; individual tasks can be scripted to
/// misbehave. Scripted misbehavior is consumed as it happens.
#[derive(Debug, Default)]
pub struct SimulatedAgent {
    delay: Duration,
    fail: HashSet<String>,
    script: Mutex<Script>,
}

#[derive(Debug, Default)]
struct Script {
    bad_plans: HashMap<String, u32>,
    stray_writes: HashMap<String, String>,
    shared_changes: HashMap<String, (String, String)>,
    yields: HashSet<String>,
}

impl SimulatedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report `task_id` as failed.
    pub fn failing(mut self, task_id: &str) -> Self {
        self.fail.insert(task_id.to_string());
        self
    }

    /// Submit `count` plans targeting a path outside the boundary first.
    pub fn with_bad_plans(self, task_id: &str, count: u32) -> Self {
        self.script().bad_plans.insert(task_id.to_string(), count);
        self
    }

    /// Report one write to `path` on the first execution of `task_id`.
    pub fn with_stray_write(self, task_id: &str, path: &str) -> Self {
        self.script()
            .stray_writes
            .insert(task_id.to_string(), path.to_string());
        self
    }

    pub fn with_shared_change(self, task_id: &str, path: &str, change: &str) -> Self {
        self.script()
            .shared_changes
            .insert(task_id.to_string(), (path.to_string(), change.to_string()));
        self
    }

    /// Yield `task_id` on the first redirect received for it.
    pub fn yielding(self, task_id: &str) -> Self {
        self.script().yields.insert(task_id.to_string());
        self
    }
}

impl Agent for SimulatedAgent {
    fn plan(&self, task: &Task, _feedback: &[String]) -> PlanDraft {
        let mut draft = draft_for(task);
        if let Some(left) = self.script().bad_plans.get_mut(&task.id) {
            if *left > 0 {
                *left -= 1;
                draft.targets.push("outside/boundary.rs".to_string());
            }
        }
        draft
    }

    fn execute(&self, task: &Task) -> Execution {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut files_modified = if task.role.is_read_only() {
            Vec::new()
        } else {
            concrete_targets(task)
        };
        let mut script = self.script();
        if let Some(stray) = script.stray_writes.remove(&task.id) {
            files_modified.push(stray);
        }
        let shared_changes = script.shared_changes.remove(&task.id).into_iter().collect();
        let status = if self.fail.contains(&task.id) {
            Outcome::Failed
        } else {
            Outcome::Completed
        };
        Execution {
            status,
            files_modified,
            notes: format!("simulated {} of {}", task.role, task.id),
            shared_changes,
        }
    }

    fn on_redirect(&self, task: &Task, message: &str) -> RedirectResponse {
        if self.script().yields.remove(&task.id) {
            RedirectResponse::Yield(format!("yielding after redirect: {message}"))
        } else {
            RedirectResponse::Continue
        }
    }
}

// ---------------------------------------------------------------------------
// ShellAgent
// ---------------------------------------------------------------------------

/// Runs each task's `command` with `sh -c` in a working directory. Modified
/// files are taken from `git status --porcelain` when the directory is a git
/// work tree.
#[derive(Debug, Clone)]
pub struct ShellAgent {
    workdir: PathBuf,
}

impl ShellAgent {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
        }
    }

    pub fn is_available() -> bool {
        which::which("sh").is_ok()
    }

    fn dirty_files(&self) -> HashSet<String> {
        let Ok(output) = Command::new("git")
            .args(["status", "--porcelain", "--untracked-files=all"])
            .current_dir(&self.workdir)
            .output()
        else {
            return HashSet::new();
        };
        if !output.status.success() {
            return HashSet::new();
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.get(3..))
            .map(|path| path.rsplit(" -> ").next().unwrap_or(path).to_string())
            .collect()
    }
}

impl Agent for ShellAgent {
    fn plan(&self, task: &Task, _feedback: &[String]) -> PlanDraft {
        draft_for(task)
    }

    fn execute(&self, task: &Task) -> Execution {
        let Some(command) = task.command.as_deref() else {
            return Execution {
                status: Outcome::Failed,
                files_modified: Vec::new(),
                notes: format!("task {} has no command", task.id),
                shared_changes: Vec::new(),
            };
        };
        let before = self.dirty_files();
        let result = Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.workdir)
            .output();
        let after = self.dirty_files();
        let mut files_modified: Vec<String> = after.difference(&before).cloned().collect();
        files_modified.sort();

        match result {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stdout = String::from_utf8_lossy(&output.stdout);
                let notes = if output.status.success() {
                    stdout.trim().to_string()
                } else {
                    format!("exit {}: {}", output.status.code().unwrap_or(-1), stderr.trim())
                };
                Execution {
                    status: if output.status.success() {
                        Outcome::Completed
                    } else {
                        Outcome::Failed
                    },
                    files_modified,
                    notes,
                    shared_changes: Vec::new(),
                }
            }
            Err(e) => Execution {
                status: Outcome::Failed,
                files_modified,
                notes: format!("failed to spawn sh: {e}"),
                shared_changes: Vec::new(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

pub struct WorkerHandle {
    pub id: String,
    pub directives: mpsc::Sender<Directive>,
    pub join: JoinHandle<()>,
}

/// Spawn `agent` as worker `id`. Requires a tokio runtime.
pub fn spawn_worker<A: Agent>(
    id: &str,
    agent: A,
    events: mpsc::Sender<WorkerEvent>,
    capacity: usize,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let worker = Worker {
        id: id.to_string(),
        agent: Arc::new(agent),
        directives: rx,
        events,
        current: None,
    };
    let join = tokio::spawn(worker.run());
    WorkerHandle {
        id: id.to_string(),
        directives: tx,
        join,
    }
}

struct Worker<A> {
    id: String,
    agent: Arc<A>,
    directives: mpsc::Receiver<Directive>,
    events: mpsc::Sender<WorkerEvent>,
    current: Option<Task>,
}

async fn emit(events: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) -> bool {
    events.send(event).await.is_ok()
}

impl<A: Agent> Worker<A> {
    async fn run(mut self) {
        while let Some(directive) = self.directives.recv().await {
            if !self.handle(directive).await {
                break;
            }
        }
        debug!(worker = %self.id, "worker stopped");
    }

    fn is_current(&self, task_id: &str) -> bool {
        self.current.as_ref().is_some_and(|t| t.id == task_id)
    }

    /// Returns false when the loop should end.
    async fn handle(&mut self, directive: Directive) -> bool {
        match directive {
            Directive::Assign {
                task,
                plan_required,
            } => {
                let ack = WorkerEvent::Ack {
                    worker_id: self.id.clone(),
                    task_id: task.id.clone(),
                };
                self.current = Some(task);
                if !emit(&self.events, ack).await {
                    return false;
                }
                if plan_required {
                    self.submit_plan(&[]).await
                } else {
                    self.execute().await
                }
            }
            Directive::PlanResult { task_id, review } => {
                if !self.is_current(&task_id) {
                    return true;
                }
                if review.approved {
                    self.execute().await
                } else {
                    self.submit_plan(&review.feedback).await
                }
            }
            Directive::Redirect { task_id, message } => {
                if !self.is_current(&task_id) {
                    return true;
                }
                self.redirect(task_id, &message).await
            }
            Directive::Resubmit { task_id, reason } => {
                let Some(task) = self.current.as_ref().filter(|t| t.id == task_id) else {
                    return true;
                };
                self.agent.on_resubmit(task, &reason);
                self.execute().await
            }
            Directive::Cancel { task_id } => {
                if self.is_current(&task_id) {
                    self.current = None;
                }
                true
            }
            Directive::Shutdown => {
                let ack = WorkerEvent::ShutdownAck {
                    worker_id: self.id.clone(),
                };
                let _ = emit(&self.events, ack).await;
                false
            }
        }
    }

    async fn redirect(&mut self, task_id: String, message: &str) -> bool {
        let Some(task) = self.current.as_ref() else {
            return true;
        };
        let event = match self.agent.on_redirect(task, message) {
            RedirectResponse::Continue => WorkerEvent::Progress {
                worker_id: self.id.clone(),
                task_id,
                note: "continuing after redirect".to_string(),
            },
            RedirectResponse::Yield(reason) => {
                self.current = None;
                WorkerEvent::Yield {
                    worker_id: self.id.clone(),
                    task_id,
                    reason,
                }
            }
        };
        emit(&self.events, event).await
    }

    async fn submit_plan(&mut self, feedback: &[String]) -> bool {
        let Some(task) = self.current.as_ref() else {
            return true;
        };
        let draft = self.agent.plan(task, feedback);
        let event = WorkerEvent::PlanSubmitted {
            worker_id: self.id.clone(),
            task_id: task.id.clone(),
            targets: draft.targets,
            rationale: draft.rationale,
        };
        emit(&self.events, event).await
    }

    /// Run the agent on the blocking pool while still answering directives.
    /// A yield, cancel or shutdown abandons the execution; its result is
    /// discarded when it eventually finishes.
    async fn execute(&mut self) -> bool {
        let Some(task) = self.current.clone() else {
            return true;
        };
        let agent = Arc::clone(&self.agent);
        let job_task = task.clone();
        let mut job = tokio::task::spawn_blocking(move || agent.execute(&job_task));

        let execution = loop {
            tokio::select! {
                joined = &mut job => match joined {
                    Ok(execution) => break execution,
                    Err(e) => {
                        warn!(worker = %self.id, task = %task.id, error = %e, "agent panicked");
                        let event = WorkerEvent::Report {
                            worker_id: self.id.clone(),
                            report: Report {
                                task_id: task.id.clone(),
                                status: Outcome::Failed,
                                files_modified: Vec::new(),
                                notes: format!("agent panicked: {e}"),
                            },
                        };
                        self.current = None;
                        return emit(&self.events, event).await;
                    }
                },
                directive = self.directives.recv() => match directive {
                    None => return false,
                    Some(Directive::Redirect { task_id, message }) if task_id == task.id => {
                        if !self.redirect(task_id, &message).await {
                            return false;
                        }
                        if self.current.is_none() {
                            return true;
                        }
                    }
                    Some(Directive::Cancel { task_id }) if task_id == task.id => {
                        self.current = None;
                        return true;
                    }
                    Some(Directive::Shutdown) => {
                        let ack = WorkerEvent::ShutdownAck {
                            worker_id: self.id.clone(),
                        };
                        let _ = emit(&self.events, ack).await;
                        return false;
                    }
                    Some(other) => {
                        debug!(worker = %self.id, directive = ?other, "ignored while executing");
                    }
                },
            }
        };

        for (path, change) in execution.shared_changes {
            let event = WorkerEvent::SharedChange {
                worker_id: self.id.clone(),
                path,
                change,
            };
            if !emit(&self.events, event).await {
                return false;
            }
        }
        let event = WorkerEvent::Report {
            worker_id: self.id.clone(),
            report: Report {
                task_id: task.id,
                status: execution.status,
                files_modified: execution.files_modified,
                notes: execution.notes,
            },
        };
        emit(&self.events, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(role: Role, ownership: &[&str]) -> Task {
        Task::new("auth-red", "login validation", role, "auth", 1)
            .with_ownership(ownership.iter().copied())
    }

    #[test]
    fn concrete_targets_follow_globs() {
        let t = task(Role::TestWriter, &["tests/auth/**", "docs/auth.md"]);
        assert_eq!(
            concrete_targets(&t),
            vec!["tests/auth/auth_red_test.rs", "docs/auth.md"]
        );
        let t = task(Role::Implementer, &["src/**/*.rs"]);
        assert_eq!(concrete_targets(&t), vec!["src/auth_red.rs"]);
    }

    #[test]
    fn read_only_roles_plan_no_targets() {
        let agent = SimulatedAgent::new();
        let draft = agent.plan(&task(Role::Reviewer, &["src/**"]), &[]);
        assert!(draft.targets.is_empty());
    }

    #[test]
    fn scripted_bad_plans_run_out() {
        let agent = SimulatedAgent::new().with_bad_plans("auth-red", 1);
        let t = task(Role::TestWriter, &["tests/**"]);
        assert!(agent
            .plan(&t, &[])
            .targets
            .contains(&"outside/boundary.rs".to_string()));
        assert!(!agent
            .plan(&t, &[])
            .targets
            .contains(&"outside/boundary.rs".to_string()));
    }

    #[tokio::test]
    async fn worker_plans_executes_and_acks_shutdown() {
        let (events_tx, mut events) = mpsc::channel(16);
        let handle = spawn_worker("tester", SimulatedAgent::new(), events_tx, 4);
        let t = task(Role::TestWriter, &["tests/auth/**"]);

        handle
            .directives
            .send(Directive::Assign {
                task: t.clone(),
                plan_required: true,
            })
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(WorkerEvent::Ack { .. })));
        match events.recv().await {
            Some(WorkerEvent::PlanSubmitted { targets, .. }) => {
                assert_eq!(targets, vec!["tests/auth/auth_red_test.rs"])
            }
            other => panic!("expected plan, got {other:?}"),
        }

        handle
            .directives
            .send(Directive::PlanResult {
                task_id: t.id.clone(),
                review: PlanReview::approve(),
            })
            .await
            .unwrap();
        match events.recv().await {
            Some(WorkerEvent::Report { report, .. }) => {
                assert_eq!(report.status, Outcome::Completed);
                assert_eq!(report.files_modified, vec!["tests/auth/auth_red_test.rs"]);
            }
            other => panic!("expected report, got {other:?}"),
        }

        handle.directives.send(Directive::Shutdown).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(WorkerEvent::ShutdownAck { .. })
        ));
        handle.join.await.unwrap();
    }

    #[tokio::test]
    async fn yielding_worker_releases_task() {
        let (events_tx, mut events) = mpsc::channel(16);
        let handle = spawn_worker("dev", SimulatedAgent::new().yielding("auth-red"), events_tx, 4);
        let t = task(Role::Implementer, &["src/**"]);
        handle
            .directives
            .send(Directive::Assign {
                task: t.clone(),
                plan_required: true,
            })
            .await
            .unwrap();
        events.recv().await.unwrap();
        events.recv().await.unwrap();
        handle
            .directives
            .send(Directive::Redirect {
                task_id: t.id.clone(),
                message: "no progress".into(),
            })
            .await
            .unwrap();
        assert!(matches!(events.recv().await, Some(WorkerEvent::Yield { .. })));
    }
}
