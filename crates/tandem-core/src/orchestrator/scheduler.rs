use super::recovery;
use super::report::{FailureRecord, FinalReport};
use crate::checkpoint::{CheckpointManager, ExternalState};
use crate::config::Config;
use crate::context::{CheckpointCategory, LogKind, WorkflowContext};
use crate::error::{Result, TandemError};
use crate::graph::TaskGraph;
use crate::ownership::{Boundary, OwnershipRegistry, SharedChangeDecision};
use crate::paths;
use crate::plan::{GateOutcome, Plan, PlanGate};
use crate::store::SnapshotStore;
use crate::task::Task;
use crate::types::{Role, TaskFlag, TaskStatus, WorkerStatus};
use crate::worker::{spawn_worker, Agent, Directive, Outcome, Report, WorkerEvent, WorkerHandle};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Worker bookkeeping
// ---------------------------------------------------------------------------

struct WorkerSlot {
    role: Role,
    status: WorkerStatus,
    current: Option<String>,
    last_activity: Instant,
    last_nudge: Option<Instant>,
    handle: WorkerHandle,
}

impl WorkerSlot {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn is_alive(&self) -> bool {
        self.status != WorkerStatus::Stopped && !self.handle.join.is_finished()
    }
}

/// Snapshot of a worker for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub role: Role,
    pub status: WorkerStatus,
    pub current: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives a workflow: the sole writer of the task graph and the context.
pub struct Orchestrator {
    config: Config,
    graph: TaskGraph,
    registry: OwnershipRegistry,
    gate: PlanGate,
    store: SnapshotStore,
    checkpoints: CheckpointManager,
    ctx: WorkflowContext,
    workers: BTreeMap<String, WorkerSlot>,
    events_tx: mpsc::Sender<WorkerEvent>,
    events: mpsc::Receiver<WorkerEvent>,
    failures: BTreeMap<String, FailureRecord>,
    lanes_checkpointed: BTreeSet<String>,
    barrier_reached: bool,
    last_checkpoint_at: Instant,
}

impl Orchestrator {
    /// Start a fresh run of `graph` under `workflow_id`.
    pub fn new(root: &Path, config: Config, workflow_id: &str, graph: TaskGraph) -> Result<Self> {
        paths::validate_workflow_id(workflow_id)?;
        let ctx = WorkflowContext::new(workflow_id);
        Self::assemble(root, config, ctx, graph)
    }

    /// Continue a saved run. Completed, failed and blocked tasks keep their
    /// status, accepted failures stay accepted, and anything that was in
    /// flight starts over.
    pub fn resume(root: &Path, config: Config, workflow_id: &str, mut graph: TaskGraph) -> Result<Self> {
        let store = SnapshotStore::new(root, config.context.clone());
        let mut ctx = store.load(workflow_id)?;
        let unknown = recovery::restore(&mut graph, &ctx);
        if !unknown.is_empty() {
            warn!(workflow = %workflow_id, unknown = ?unknown, "saved context names tasks missing from the workflow");
        }
        let counts = graph.counts();
        ctx.log(
            LogKind::Note,
            format!(
                "resumed: {} completed, {} failed, {} blocked",
                counts.completed, counts.failed, counts.blocked
            ),
        );
        info!(workflow = %workflow_id, completed = counts.completed, "resuming workflow");
        Self::assemble(root, config, ctx, graph)
    }

    fn assemble(root: &Path, config: Config, ctx: WorkflowContext, graph: TaskGraph) -> Result<Self> {
        let gate = PlanGate::new(config.plan_gate.clone(), config.scheduler.max_plan_rejections)?;
        let store = SnapshotStore::new(root, config.context.clone());
        let checkpoints = CheckpointManager::new(root, config.checkpoints.clone());
        let (events_tx, events) = mpsc::channel(config.scheduler.channel_capacity.max(1));
        let lanes_checkpointed = graph
            .lanes()
            .into_iter()
            .filter(|l| graph.is_lane_complete(l))
            .collect();
        Ok(Self {
            config,
            graph,
            registry: OwnershipRegistry::new(),
            gate,
            store,
            checkpoints,
            ctx,
            workers: BTreeMap::new(),
            events_tx,
            events,
            failures: BTreeMap::new(),
            lanes_checkpointed,
            barrier_reached: false,
            last_checkpoint_at: Instant::now(),
        })
    }

    pub fn with_external_state(mut self, external: Box<dyn ExternalState>) -> Self {
        self.checkpoints = self.checkpoints.with_external(external);
        self
    }

    /// Register a worker and spawn its task. Must be called inside a tokio
    /// runtime.
    pub fn add_worker<A: Agent>(
        &mut self,
        id: &str,
        role: Role,
        ownership: &[String],
        agent: A,
    ) -> Result<()> {
        if self.workers.contains_key(id) {
            return Err(TandemError::InvalidWorkflow(format!(
                "duplicate worker id '{id}'"
            )));
        }
        self.registry.register_worker(id, ownership)?;
        let handle = spawn_worker(
            id,
            agent,
            self.events_tx.clone(),
            self.config.scheduler.channel_capacity,
        );
        self.workers.insert(
            id.to_string(),
            WorkerSlot {
                role,
                status: WorkerStatus::Idle,
                current: None,
                last_activity: Instant::now(),
                last_nudge: None,
                handle,
            },
        );
        debug!(worker = %id, %role, "worker registered");
        Ok(())
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .iter()
            .map(|(id, w)| WorkerInfo {
                id: id.clone(),
                role: w.role,
                status: w.status,
                current: w.current.clone(),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Drive the workflow until no task can progress, shut every worker down
    /// and return the final report. Infrastructure errors abort the run.
    pub async fn run(&mut self) -> Result<FinalReport> {
        let result = self.drive().await;
        self.shutdown().await;
        match result {
            Ok(()) => self.finish(),
            Err(e) => {
                error!(workflow = %self.ctx.workflow_id, kind = e.kind(), error = %e, "run aborted");
                self.ctx.log(LogKind::Failure, format!("run aborted: {e}"));
                if let Err(save_err) = self.persist() {
                    warn!(error = %save_err, "could not save context after abort");
                }
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<()> {
        self.ctx.set_phase("running");
        self.ctx.log(
            LogKind::Note,
            format!(
                "run started: {} tasks, {} workers",
                self.graph.len(),
                self.workers.len()
            ),
        );
        self.persist()?;

        loop {
            self.resolve_shared_changes()?;
            self.assign_ready().await?;
            if self.graph.is_settled() {
                break;
            }
            let poll = self.config.scheduler.poll_interval();
            match tokio::time::timeout(poll, self.events.recv()).await {
                Ok(Some(event)) => self.dispatch(event).await?,
                Ok(None) => return Err(TandemError::ChannelClosed("worker events".to_string())),
                Err(_) => {}
            }
            self.check_stalls().await;
            self.interval_checkpoint()?;
        }
        self.resolve_shared_changes()
    }

    fn finish(&mut self) -> Result<FinalReport> {
        for request in self.registry.drain_shared_changes() {
            self.ctx.add_pending_action(format!(
                "shared change to {} requested by {}: {}",
                request.path, request.worker_id, request.change
            ));
        }
        let phase = if self.graph.is_workflow_complete() {
            "complete"
        } else {
            "settled"
        };
        self.ctx.set_phase(phase);
        self.ctx.log(LogKind::Note, format!("run {phase}: {}", crate::task::summarize(self.graph.tasks())));
        self.persist()?;
        let report = FinalReport::build(&self.graph, &self.ctx, &self.failures);
        info!(workflow = %self.ctx.workflow_id, outcome = report.outcome.as_str(), "run finished");
        Ok(report)
    }

    /// Task-local errors are logged and contained; fatal ones end the run.
    async fn dispatch(&mut self, event: WorkerEvent) -> Result<()> {
        if let Err(e) = self.handle_event(event).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(kind = e.kind(), error = %e, "event handling failed");
            self.ctx.log(LogKind::Failure, format!("{}: {e}", e.kind()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    async fn assign_ready(&mut self) -> Result<()> {
        let mut ready: Vec<Task> = self.graph.ready_tasks().into_iter().cloned().collect();
        if ready.is_empty() {
            return Ok(());
        }
        let completed: HashMap<String, usize> = self
            .graph
            .lanes()
            .into_iter()
            .map(|lane| {
                let n = self.graph.lane_completed(&lane);
                (lane, n)
            })
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| completed.get(&a.lane).cmp(&completed.get(&b.lane)))
                .then_with(|| a.id.cmp(&b.id))
        });

        for task in ready {
            let capable = self
                .workers
                .values()
                .any(|w| w.role == task.role && w.is_alive());
            if !capable {
                let err = TandemError::WorkerNotFound(format!("no live {} worker", task.role));
                self.graph
                    .block(&task.id, TaskFlag::WorkerUnresponsive, err.to_string())?;
                self.record_failure(&task.id, err.kind(), err.to_string());
                self.persist()?;
                continue;
            }
            if let Some((worker_id, boundary)) = self.pick_worker(&task)? {
                self.assign(task, &worker_id, boundary).await?;
            }
        }
        Ok(())
    }

    /// First idle worker of the task's role whose claim would not overlap an
    /// active task.
    fn pick_worker(&self, task: &Task) -> Result<Option<(String, Boundary)>> {
        for (id, slot) in &self.workers {
            if slot.role != task.role || slot.status != WorkerStatus::Idle || !slot.is_alive() {
                continue;
            }
            let boundary = self.registry.effective_boundary(id, &task.ownership)?;
            match self.registry.conflicting_claim(&task.id, &boundary) {
                Some(active) => {
                    debug!(task = %task.id, worker = %id, active, "boundary overlaps an active task; waiting")
                }
                None => return Ok(Some((id.clone(), boundary))),
            }
        }
        Ok(None)
    }

    async fn assign(&mut self, task: Task, worker_id: &str, boundary: Boundary) -> Result<()> {
        self.registry.claim(&task.id, worker_id, &task.ownership)?;
        self.graph.assign(&task.id, worker_id)?;
        let plan_required = self.config.roles.plan_required(task.role);
        let status = if plan_required {
            WorkerStatus::Planning
        } else {
            self.graph.mark_status(&task.id, TaskStatus::InProgress)?;
            WorkerStatus::Working
        };
        let slot = self.slot_mut(worker_id)?;
        slot.status = status;
        slot.current = Some(task.id.clone());
        slot.last_nudge = None;
        slot.touch();

        info!(task = %task.id, worker = %worker_id, plan_required, "task assigned");
        self.ctx
            .log_task(LogKind::Assignment, &task.id, format!("assigned to {worker_id}"));

        let task_id = task.id.clone();
        let mut outgoing = task;
        outgoing.ownership = boundary.patterns().to_vec();
        let tx = self.slot_mut(worker_id)?.handle.directives.clone();
        let directive = Directive::Assign {
            task: outgoing,
            plan_required,
        };
        if tx.send(directive).await.is_err() {
            self.return_unstarted(worker_id, &task_id)?;
        }
        self.persist()
    }

    /// The worker's channel closed before it received the task. The task
    /// never ran, so it goes back to Ready for another worker.
    fn return_unstarted(&mut self, worker_id: &str, task_id: &str) -> Result<()> {
        warn!(worker = %worker_id, task = %task_id, "worker channel closed; returning task to ready");
        self.release(worker_id, task_id);
        self.slot_mut(worker_id)?.status = WorkerStatus::Stopped;
        self.graph.mark_status(task_id, TaskStatus::Ready)?;
        self.ctx.log_task(
            LogKind::Transition,
            task_id,
            format!("returned to ready: {worker_id} is gone"),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        let worker_id = event.worker_id().to_string();
        self.slot_mut(&worker_id)?.touch();
        match event {
            WorkerEvent::Ack { task_id, .. } => {
                debug!(worker = %worker_id, task = %task_id, "assignment acknowledged");
                Ok(())
            }
            WorkerEvent::Progress { task_id, note, .. } => {
                debug!(worker = %worker_id, task = %task_id, %note, "progress");
                Ok(())
            }
            WorkerEvent::PlanSubmitted {
                task_id,
                targets,
                rationale,
                ..
            } => {
                let plan = Plan::new(task_id, worker_id.clone(), targets, rationale);
                self.on_plan(&worker_id, plan).await
            }
            WorkerEvent::Report { report, .. } => self.on_report(&worker_id, report).await,
            WorkerEvent::SharedChange { path, change, .. } => {
                let id = self
                    .registry
                    .request_shared_change(&worker_id, &path, change)?;
                info!(worker = %worker_id, %path, request = %id, "shared change requested");
                Ok(())
            }
            WorkerEvent::Yield {
                task_id, reason, ..
            } => self.on_yield(&worker_id, &task_id, &reason),
            WorkerEvent::ShutdownAck { .. } => {
                self.slot_mut(&worker_id)?.status = WorkerStatus::Stopped;
                Ok(())
            }
        }
    }

    fn holds(&self, worker_id: &str, task_id: &str) -> bool {
        self.workers
            .get(worker_id)
            .is_some_and(|w| w.current.as_deref() == Some(task_id))
    }

    async fn on_plan(&mut self, worker_id: &str, plan: Plan) -> Result<()> {
        let task_id = plan.task_id.clone();
        if !self.holds(worker_id, &task_id)
            || self.graph.get(&task_id)?.status != TaskStatus::Assigned
        {
            debug!(worker = %worker_id, task = %task_id, "ignoring stale plan");
            return Ok(());
        }
        self.graph.mark_status(&task_id, TaskStatus::PlanSubmitted)?;
        self.slot_mut(worker_id)?.status = WorkerStatus::AwaitingApproval;

        let task = self.graph.get(&task_id)?;
        let role = task.role;
        let boundary = self.registry.effective_boundary(worker_id, &task.ownership)?;
        let review = self.gate.review(&plan, role, &boundary);
        let outcome = if review.approved {
            GateOutcome::Approved
        } else {
            let rejections = self.graph.record_plan_rejection(&task_id)?;
            self.gate.decide(review.clone(), rejections)
        };

        match outcome {
            GateOutcome::Approved => {
                self.graph.mark_status(&task_id, TaskStatus::InProgress)?;
                self.slot_mut(worker_id)?.status = WorkerStatus::Working;
                info!(task = %task_id, worker = %worker_id, targets = plan.targets.len(), "plan approved");
                self.ctx.log_task(
                    LogKind::PlanReview,
                    &task_id,
                    format!("plan approved ({} targets)", plan.targets.len()),
                );
                self.ctx.record_decision(
                    format!("{task_id}: {}", plan.rationale),
                    Some(task_id.as_str()),
                );
                self.send(worker_id, Directive::PlanResult { task_id, review })
                    .await?;
            }
            GateOutcome::Revise(review) => {
                self.graph.mark_status(&task_id, TaskStatus::Assigned)?;
                self.slot_mut(worker_id)?.status = WorkerStatus::Planning;
                let rejections = self.graph.get(&task_id)?.plan_rejections;
                info!(task = %task_id, worker = %worker_id, rejections, "plan rejected");
                self.ctx.log_task(
                    LogKind::PlanReview,
                    &task_id,
                    format!(
                        "plan rejected ({rejections}/{}): {}",
                        self.gate.max_rejections(),
                        review.feedback.join("; ")
                    ),
                );
                self.send(worker_id, Directive::PlanResult { task_id, review })
                    .await?;
            }
            GateOutcome::Escalate(review) => {
                let rejections = self.graph.get(&task_id)?.plan_rejections;
                let err = self.gate.escalation_error(&task_id, rejections);
                warn!(task = %task_id, worker = %worker_id, rejections, "plan rejected too often; blocking task");
                self.graph.block(
                    &task_id,
                    TaskFlag::RepeatedPlanRejection,
                    review.feedback.join("; "),
                )?;
                self.record_failure(&task_id, err.kind(), err.to_string());
                self.release(worker_id, &task_id);
                self.send(worker_id, Directive::Cancel { task_id }).await?;
            }
        }
        self.persist()
    }

    async fn on_report(&mut self, worker_id: &str, report: Report) -> Result<()> {
        let task_id = report.task_id.clone();
        if !self.holds(worker_id, &task_id)
            || self.graph.get(&task_id)?.status != TaskStatus::InProgress
        {
            debug!(worker = %worker_id, task = %task_id, "ignoring stale report");
            return Ok(());
        }

        match report.status {
            Outcome::Failed => {
                warn!(task = %task_id, worker = %worker_id, notes = %report.notes, "task failed");
                let propagation = self.graph.fail(&task_id, None, report.notes.clone())?;
                self.record_failure(&task_id, "TaskFailed", report.notes.clone());
                for blocked in &propagation.newly_blocked {
                    self.ctx.log_task(
                        LogKind::Transition,
                        blocked,
                        format!("blocked: dependency '{task_id}' failed"),
                    );
                }
                self.release(worker_id, &task_id);
            }
            Outcome::Completed => {
                match self.registry.check_report(worker_id, &report.files_modified) {
                    Ok(()) => {}
                    Err(violation @ TandemError::OwnershipViolation { .. }) => {
                        return self.on_violation(worker_id, &task_id, violation).await;
                    }
                    Err(e) => return Err(e),
                }
                self.graph.mark_status(&task_id, TaskStatus::Completed)?;
                self.ctx.record_modified(report.files_modified.iter().cloned());
                info!(task = %task_id, worker = %worker_id, files = report.files_modified.len(), "task completed");
                self.ctx.log_task(
                    LogKind::Report,
                    &task_id,
                    format!(
                        "completed by {worker_id} ({} files): {}",
                        report.files_modified.len(),
                        report.notes
                    ),
                );
                self.release(worker_id, &task_id);
                self.after_completion(&task_id)?;
            }
        }
        self.persist()
    }

    /// A completed report touched files outside the boundary: reject it and
    /// ask for a resubmission, or block the task once the rejection limit is
    /// reached.
    async fn on_violation(
        &mut self,
        worker_id: &str,
        task_id: &str,
        violation: TandemError,
    ) -> Result<()> {
        let rejections = self.graph.record_plan_rejection(task_id)?;
        warn!(task = %task_id, worker = %worker_id, rejections, error = %violation, "result rejected");
        self.ctx.log_task(
            LogKind::Failure,
            task_id,
            format!("result rejected: {violation}"),
        );
        if rejections >= self.gate.max_rejections() {
            self.graph
                .block(task_id, TaskFlag::OwnershipViolation, violation.to_string())?;
            self.record_failure(task_id, violation.kind(), violation.to_string());
            self.release(worker_id, task_id);
            self.send(
                worker_id,
                Directive::Cancel {
                    task_id: task_id.to_string(),
                },
            )
            .await?;
        } else {
            self.send(
                worker_id,
                Directive::Resubmit {
                    task_id: task_id.to_string(),
                    reason: violation.to_string(),
                },
            )
            .await?;
        }
        self.persist()
    }

    fn on_yield(&mut self, worker_id: &str, task_id: &str, reason: &str) -> Result<()> {
        if !self.holds(worker_id, task_id) {
            return Ok(());
        }
        let status = self.graph.get(task_id)?.status;
        if !status.is_active() {
            return Ok(());
        }
        if status == TaskStatus::PlanSubmitted {
            self.graph.mark_status(task_id, TaskStatus::Assigned)?;
        }
        self.graph.mark_status(task_id, TaskStatus::Ready)?;
        self.release(worker_id, task_id);
        info!(task = %task_id, worker = %worker_id, %reason, "task yielded");
        self.ctx.log_task(
            LogKind::Transition,
            task_id,
            format!("yielded by {worker_id}: {reason}"),
        );
        self.persist()
    }

    fn release(&mut self, worker_id: &str, task_id: &str) {
        self.registry.release(task_id);
        if let Some(slot) = self.workers.get_mut(worker_id) {
            if slot.current.as_deref() == Some(task_id) {
                slot.current = None;
            }
            if slot.status != WorkerStatus::Stopped {
                slot.status = WorkerStatus::Idle;
            }
        }
    }

    fn record_failure(&mut self, task_id: &str, kind: &str, message: impl Into<String>) {
        let record = FailureRecord::new(task_id, kind, message, &self.ctx);
        self.ctx.log_task(
            LogKind::Failure,
            task_id,
            format!("{}: {}", record.kind, record.message),
        );
        self.failures.insert(task_id.to_string(), record);
    }

    // -----------------------------------------------------------------------
    // Shared changes
    // -----------------------------------------------------------------------

    /// Resolve queued shared-change requests serially. Requests touching a
    /// path claimed by another worker's active task wait for the next round.
    fn resolve_shared_changes(&mut self) -> Result<()> {
        let requests = self.registry.drain_shared_changes();
        if requests.is_empty() {
            return Ok(());
        }
        let mut deferred = Vec::new();
        for request in requests {
            match self.registry.decide(&request) {
                SharedChangeDecision::Approved => {
                    info!(worker = %request.worker_id, path = %request.path, "shared change approved");
                    self.ctx.record_decision(
                        format!(
                            "approved shared change to {} for {}: {}",
                            request.path, request.worker_id, request.change
                        ),
                        None,
                    );
                    self.ctx.record_modified([request.path.clone()]);
                    self.ctx.log(
                        LogKind::SharedChange,
                        format!("approved {} for {}", request.path, request.worker_id),
                    );
                }
                SharedChangeDecision::Deferred { held_by } => {
                    debug!(path = %request.path, %held_by, "shared change deferred");
                    deferred.push(request);
                }
            }
        }
        for request in deferred {
            self.registry.requeue(request);
        }
        self.persist()
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    fn after_completion(&mut self, task_id: &str) -> Result<()> {
        let task = self.graph.get(task_id)?;
        let lane = task.lane.clone();
        let phase = task.phase;
        if self.graph.lane_final_phase(&lane) == Some(phase)
            && self.graph.is_lane_complete(&lane)
            && self.lanes_checkpointed.insert(lane.clone())
        {
            self.checkpoint(&format!("lane {lane} complete"), CheckpointCategory::PhaseComplete)?;
        }
        if !self.barrier_reached
            && self
                .graph
                .lanes()
                .iter()
                .all(|l| self.graph.is_lane_complete(l))
        {
            self.barrier_reached = true;
            self.ctx.set_phase("integration");
            self.checkpoint(
                "integration barrier: all lanes complete",
                CheckpointCategory::IntegrationBarrier,
            )?;
        }
        Ok(())
    }

    fn interval_checkpoint(&mut self) -> Result<()> {
        let Some(secs) = self.config.scheduler.checkpoint_interval_secs else {
            return Ok(());
        };
        if self.last_checkpoint_at.elapsed() < Duration::from_secs(secs) {
            return Ok(());
        }
        self.checkpoint("interval", CheckpointCategory::Interval)?;
        self.persist()
    }

    fn checkpoint(&mut self, label: &str, category: CheckpointCategory) -> Result<()> {
        self.ctx.task_status = self.graph.statuses();
        self.last_checkpoint_at = Instant::now();
        match self.checkpoints.checkpoint(&mut self.ctx, label, category) {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(%label, error = %e, "checkpoint failed");
                self.ctx
                    .log(LogKind::Failure, format!("checkpoint '{label}' failed: {e}"));
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Stalls
    // -----------------------------------------------------------------------

    /// Send an advisory redirect to busy workers without progress for longer
    /// than the stall window. A worker is nudged at most once per window, and
    /// never more often than the poll interval.
    async fn check_stalls(&mut self) {
        let window = self.config.scheduler.stall_window();
        let spacing = window.max(self.config.scheduler.poll_interval());
        let stalled: Vec<(String, String)> = self
            .workers
            .iter()
            .filter(|(_, w)| {
                w.status.is_busy()
                    && w.last_activity.elapsed() > window
                    && w.last_nudge.map_or(true, |n| n.elapsed() > spacing)
            })
            .filter_map(|(id, w)| w.current.clone().map(|t| (id.clone(), t)))
            .collect();

        for (worker_id, task_id) in stalled {
            if let Some(slot) = self.workers.get_mut(&worker_id) {
                slot.last_nudge = Some(Instant::now());
            }
            info!(worker = %worker_id, task = %task_id, "worker stalled; sending redirect");
            self.ctx.log_task(
                LogKind::Note,
                &task_id,
                format!("redirected {worker_id} after {}s without progress", window.as_secs()),
            );
            let message = format!(
                "no progress for {}s on {task_id}; continue or yield it",
                window.as_secs()
            );
            if let Err(e) = self
                .send(&worker_id, Directive::Redirect { task_id, message })
                .await
            {
                warn!(worker = %worker_id, error = %e, "redirect failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Messaging and shutdown
    // -----------------------------------------------------------------------

    fn slot_mut(&mut self, worker_id: &str) -> Result<&mut WorkerSlot> {
        self.workers
            .get_mut(worker_id)
            .ok_or_else(|| TandemError::WorkerNotFound(worker_id.to_string()))
    }

    /// Send a directive. A closed channel means the worker is gone: it is
    /// marked stopped and its task failed.
    async fn send(&mut self, worker_id: &str, directive: Directive) -> Result<()> {
        let tx = self.slot_mut(worker_id)?.handle.directives.clone();
        if tx.send(directive).await.is_ok() {
            return Ok(());
        }
        warn!(worker = %worker_id, "worker channel closed");
        self.worker_lost(worker_id, "worker channel closed")
    }

    fn worker_lost(&mut self, worker_id: &str, reason: &str) -> Result<()> {
        let slot = self.slot_mut(worker_id)?;
        slot.status = WorkerStatus::Stopped;
        let Some(task_id) = slot.current.take() else {
            return Ok(());
        };
        self.registry.release(&task_id);
        if self.graph.get(&task_id)?.status.is_active() {
            self.graph
                .fail(&task_id, Some(TaskFlag::WorkerUnresponsive), reason)?;
            self.record_failure(&task_id, "WorkerUnresponsive", format!("{worker_id}: {reason}"));
        }
        Ok(())
    }

    /// Ask every worker to stop and wait for acknowledgements up to the
    /// shutdown timeout. Workers that do not answer are aborted.
    async fn shutdown(&mut self) {
        let ids: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.status != WorkerStatus::Stopped)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(slot) = self.workers.get_mut(id) {
                slot.status = WorkerStatus::ShutdownRequested;
            }
            if let Err(e) = self.send(id, Directive::Shutdown).await {
                warn!(worker = %id, error = %e, "shutdown directive failed");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.scheduler.shutdown_timeout();
        while self
            .workers
            .values()
            .any(|w| w.status == WorkerStatus::ShutdownRequested)
        {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(WorkerEvent::ShutdownAck { worker_id })) => {
                    if let Some(slot) = self.workers.get_mut(&worker_id) {
                        slot.status = WorkerStatus::Stopped;
                    }
                    debug!(worker = %worker_id, "shutdown acknowledged");
                }
                Ok(Some(other)) => {
                    debug!(worker = %other.worker_id(), "discarding event during shutdown");
                }
                Ok(None) | Err(_) => break,
            }
        }

        let unresponsive: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.status == WorkerStatus::ShutdownRequested)
            .map(|(id, _)| id.clone())
            .collect();
        for id in unresponsive {
            warn!(worker = %id, "worker did not acknowledge shutdown; aborting");
            if let Err(e) = self.worker_lost(&id, "did not acknowledge shutdown") {
                warn!(worker = %id, error = %e, "could not fail in-flight task");
            }
        }
        for slot in self.workers.values() {
            slot.handle.join.abort();
        }
    }

    fn persist(&mut self) -> Result<()> {
        self.ctx.task_status = self.graph.statuses();
        self.store
            .save_with_retries(&mut self.ctx, self.config.scheduler.save_retries)
            .map(|_| ())
    }
}
