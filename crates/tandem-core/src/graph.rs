//! Task graph: dependency edges, lane/phase grouping and readiness.
//!
//! The graph is the single source of truth for task status. Every mutation
//! goes through [`TaskGraph::mark_status`] (or a thin wrapper around it), which
//! enforces the state machine in [`TaskStatus::can_transition_to`] and then
//! re-derives readiness:
//!
//! - a `Pending` task whose dependencies are all `Completed` becomes `Ready`;
//! - a `Pending`/`Ready` task with a `Failed` (or failure-blocked) dependency
//!   becomes `Blocked` with [`TaskFlag::FailedDependency`].
//!
//! Unrelated lanes are never touched by a failure.

use crate::error::{Result, TandemError};
use crate::task::Task;
use crate::types::{TaskFlag, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

// ---------------------------------------------------------------------------
// TaskCounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl TaskCounts {
    pub fn from_statuses<I: IntoIterator<Item = TaskStatus>>(statuses: I) -> Self {
        let mut counts = TaskCounts::default();
        for status in statuses {
            counts.total += 1;
            match status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Assigned | TaskStatus::PlanSubmitted | TaskStatus::InProgress => {
                    counts.active += 1
                }
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Blocked => counts.blocked += 1,
            }
        }
        counts
    }
}

/// Status changes derived by the graph itself after an explicit transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Propagation {
    pub newly_ready: Vec<String>,
    pub newly_blocked: Vec<String>,
}

// ---------------------------------------------------------------------------
// TaskGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from task definitions whose `depends_on` may reference
    /// tasks declared later in the list.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = TaskGraph::new();
        let mut edges = Vec::new();
        for mut task in tasks {
            let deps = std::mem::take(&mut task.depends_on);
            edges.push((task.id.clone(), deps));
            graph.add_task(task, &[])?;
        }
        for (id, deps) in edges {
            for dep in deps {
                graph.add_dependency(&id, &dep)?;
            }
        }
        Ok(graph)
    }

    /// Insert a task with extra dependency ids (merged with `task.depends_on`).
    ///
    /// Fails without modifying the graph if the id already exists, a
    /// dependency is unknown, or an edge would close a cycle.
    pub fn add_task(&mut self, mut task: Task, dependencies: &[String]) -> Result<Propagation> {
        if self.index.contains_key(&task.id) {
            return Err(TandemError::TaskExists(task.id));
        }
        let mut deps: Vec<String> = Vec::new();
        for dep in task.depends_on.iter().chain(dependencies) {
            if dep == &task.id {
                return Err(TandemError::Cycle {
                    task: task.id.clone(),
                    depends_on: dep.clone(),
                });
            }
            if !self.index.contains_key(dep) {
                return Err(TandemError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
            if !deps.contains(dep) {
                deps.push(dep.clone());
            }
        }
        task.depends_on = deps;
        task.status = TaskStatus::Pending;
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(self.refresh())
    }

    /// Add the edge `task` depends on `depends_on`.
    pub fn add_dependency(&mut self, task: &str, depends_on: &str) -> Result<Propagation> {
        let idx = self.position(task)?;
        if !self.index.contains_key(depends_on) {
            return Err(TandemError::UnknownDependency {
                task: task.to_string(),
                dependency: depends_on.to_string(),
            });
        }
        if task == depends_on || self.reaches(depends_on, task) {
            return Err(TandemError::Cycle {
                task: task.to_string(),
                depends_on: depends_on.to_string(),
            });
        }
        let t = &mut self.tasks[idx];
        if t.status.is_active() || t.status.is_terminal() {
            return Err(TandemError::InvalidTransition {
                task: task.to_string(),
                from: t.status.to_string(),
                to: t.status.to_string(),
                reason: "dependencies cannot change once a task has started".to_string(),
            });
        }
        if !t.depends_on.iter().any(|d| d == depends_on) {
            t.depends_on.push(depends_on.to_string());
        }
        Ok(self.refresh())
    }

    /// True if `to` is reachable from `from` by following `depends_on` edges.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(&i) = self.index.get(id) {
                stack.extend(self.tasks[i].depends_on.iter().map(String::as_str));
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Result<&Task> {
        Ok(&self.tasks[self.position(id)?])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Ready tasks ordered by lane, then phase, then insertion order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<(usize, &Task)> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Ready && self.deps_completed(t))
            .collect();
        ready.sort_by(|(ia, a), (ib, b)| {
            a.lane
                .cmp(&b.lane)
                .then(a.phase.cmp(&b.phase))
                .then(ia.cmp(ib))
        });
        ready.into_iter().map(|(_, t)| t).collect()
    }

    /// Every task Completed, or Failed with the failure explicitly accepted.
    pub fn is_workflow_complete(&self) -> bool {
        self.tasks.iter().all(|t| {
            t.status == TaskStatus::Completed
                || (t.status == TaskStatus::Failed && t.failure_accepted)
        })
    }

    /// Nothing is running and nothing can start.
    pub fn is_settled(&self) -> bool {
        !self
            .tasks
            .iter()
            .any(|t| t.status.is_active() || t.status == TaskStatus::Ready)
    }

    pub fn counts(&self) -> TaskCounts {
        TaskCounts::from_statuses(self.tasks.iter().map(|t| t.status))
    }

    pub fn statuses(&self) -> BTreeMap<String, TaskStatus> {
        self.tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect()
    }

    pub fn lanes(&self) -> Vec<String> {
        let lanes: BTreeSet<&str> = self.tasks.iter().map(|t| t.lane.as_str()).collect();
        lanes.into_iter().map(String::from).collect()
    }

    pub fn lane_final_phase(&self, lane: &str) -> Option<u32> {
        self.tasks
            .iter()
            .filter(|t| t.lane == lane)
            .map(|t| t.phase)
            .max()
    }

    pub fn lane_completed(&self, lane: &str) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.lane == lane && t.status == TaskStatus::Completed)
            .count()
    }

    pub fn is_lane_complete(&self, lane: &str) -> bool {
        self.tasks
            .iter()
            .filter(|t| t.lane == lane)
            .all(|t| t.status == TaskStatus::Completed)
    }

    /// Direct and transitive dependents of `id`, in insertion order.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        let mut found: HashSet<&str> = HashSet::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for t in &self.tasks {
                if t.depends_on.iter().any(|d| d == current) && found.insert(t.id.as_str()) {
                    frontier.push(t.id.as_str());
                }
            }
        }
        self.tasks
            .iter()
            .filter(|t| found.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect()
    }

    fn deps_completed(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|d| {
            self.index
                .get(d)
                .is_some_and(|&i| self.tasks[i].status == TaskStatus::Completed)
        })
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| TandemError::TaskNotFound(id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Apply a status transition, enforcing the task state machine.
    pub fn mark_status(&mut self, id: &str, status: TaskStatus) -> Result<Propagation> {
        let idx = self.position(id)?;
        let task = &mut self.tasks[idx];
        if task.status == status {
            return Ok(Propagation::default());
        }
        if !task.status.can_transition_to(status) {
            let reason = if task.status.is_terminal() {
                "task is in a terminal state".to_string()
            } else {
                "not a legal transition".to_string()
            };
            return Err(TandemError::InvalidTransition {
                task: id.to_string(),
                from: task.status.to_string(),
                to: status.to_string(),
                reason,
            });
        }
        task.status = status;
        match status {
            TaskStatus::Assigned if task.started_at.is_none() => {
                task.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                task.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        if !status.is_active() {
            task.assigned_to = None;
        }
        if status != TaskStatus::Blocked {
            task.blocker = None;
            if status != TaskStatus::Failed {
                task.flag = None;
            }
        }
        Ok(self.refresh())
    }

    /// Ready → Assigned, recording the worker.
    pub fn assign(&mut self, id: &str, worker_id: &str) -> Result<Propagation> {
        let idx = self.position(id)?;
        if self.tasks[idx].status != TaskStatus::Ready {
            return Err(TandemError::InvalidTransition {
                task: id.to_string(),
                from: self.tasks[idx].status.to_string(),
                to: TaskStatus::Assigned.to_string(),
                reason: "only ready tasks can be assigned".to_string(),
            });
        }
        let propagation = self.mark_status(id, TaskStatus::Assigned)?;
        self.tasks[idx].assigned_to = Some(worker_id.to_string());
        Ok(propagation)
    }

    pub fn block(
        &mut self,
        id: &str,
        flag: TaskFlag,
        reason: impl Into<String>,
    ) -> Result<Propagation> {
        self.mark_status(id, TaskStatus::Blocked)?;
        let idx = self.position(id)?;
        self.tasks[idx].flag = Some(flag);
        self.tasks[idx].blocker = Some(reason.into());
        Ok(self.refresh())
    }

    pub fn fail(
        &mut self,
        id: &str,
        flag: Option<TaskFlag>,
        reason: impl Into<String>,
    ) -> Result<Propagation> {
        let propagation = self.mark_status(id, TaskStatus::Failed)?;
        let idx = self.position(id)?;
        self.tasks[idx].flag = flag;
        self.tasks[idx].blocker = Some(reason.into());
        Ok(propagation)
    }

    /// Mark a failure as acceptable for [`TaskGraph::is_workflow_complete`].
    pub fn accept_failure(&mut self, id: &str) -> Result<()> {
        let idx = self.position(id)?;
        let task = &mut self.tasks[idx];
        if task.status != TaskStatus::Failed {
            return Err(TandemError::InvalidTransition {
                task: id.to_string(),
                from: task.status.to_string(),
                to: TaskStatus::Failed.to_string(),
                reason: "only failed tasks can have their failure accepted".to_string(),
            });
        }
        task.failure_accepted = true;
        Ok(())
    }

    /// Blocked → Pending. Readiness is re-derived; a task whose dependency
    /// still failed is blocked again.
    pub fn unblock(&mut self, id: &str) -> Result<Propagation> {
        let idx = self.position(id)?;
        self.tasks[idx].plan_rejections = 0;
        self.mark_status(id, TaskStatus::Pending)
    }

    pub fn record_plan_rejection(&mut self, id: &str) -> Result<u32> {
        let idx = self.position(id)?;
        self.tasks[idx].plan_rejections += 1;
        Ok(self.tasks[idx].plan_rejections)
    }

    /// Restore statuses captured in a saved context. Work that was in flight
    /// when the context was saved has no worker any more and goes back to
    /// `Pending`; ids unknown to this graph are returned.
    pub fn apply_statuses(&mut self, statuses: &BTreeMap<String, TaskStatus>) -> Vec<String> {
        let mut unknown = Vec::new();
        for (id, status) in statuses {
            let Some(&idx) = self.index.get(id) else {
                unknown.push(id.clone());
                continue;
            };
            let task = &mut self.tasks[idx];
            task.assigned_to = None;
            task.status = match status {
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked => *status,
                _ => TaskStatus::Pending,
            };
        }
        self.refresh();
        unknown
    }

    /// Re-derive Ready/Pending/Blocked for tasks that are not yet held by a
    /// worker. Runs to a fixpoint so blocking propagates transitively.
    fn refresh(&mut self) -> Propagation {
        let mut propagation = Propagation::default();
        loop {
            let mut changed = false;
            for i in 0..self.tasks.len() {
                let status = self.tasks[i].status;
                if !matches!(status, TaskStatus::Pending | TaskStatus::Ready) {
                    continue;
                }
                let failed_dep = self.tasks[i].depends_on.iter().find(|d| {
                    self.index.get(*d).is_some_and(|&j| {
                        let dep = &self.tasks[j];
                        dep.status == TaskStatus::Failed
                            || (dep.status == TaskStatus::Blocked
                                && dep.flag == Some(TaskFlag::FailedDependency))
                    })
                });
                if let Some(dep) = failed_dep.cloned() {
                    let task = &mut self.tasks[i];
                    task.status = TaskStatus::Blocked;
                    task.flag = Some(TaskFlag::FailedDependency);
                    task.blocker = Some(format!("dependency '{dep}' failed"));
                    propagation.newly_blocked.push(task.id.clone());
                    changed = true;
                    continue;
                }
                let deps_done = self.deps_completed(&self.tasks[i]);
                let task = &mut self.tasks[i];
                if status == TaskStatus::Pending && deps_done {
                    task.status = TaskStatus::Ready;
                    propagation.newly_ready.push(task.id.clone());
                    changed = true;
                } else if status == TaskStatus::Ready && !deps_done {
                    task.status = TaskStatus::Pending;
                    propagation.newly_ready.retain(|id| id != &task.id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        propagation
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
