use crate::config::ContextConfig;
use crate::paths;
use crate::types::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Current on-disk schema version of [`WorkflowContext`].
pub const SCHEMA_VERSION: u32 = 3;

// ---------------------------------------------------------------------------
// Decision / LogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub at: DateTime<Utc>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Assignment,
    Transition,
    PlanReview,
    Report,
    SharedChange,
    Checkpoint,
    Rollback,
    Failure,
    Note,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Assignment => "assignment",
            LogKind::Transition => "transition",
            LogKind::PlanReview => "plan_review",
            LogKind::Report => "report",
            LogKind::SharedChange => "shared_change",
            LogKind::Checkpoint => "checkpoint",
            LogKind::Rollback => "rollback",
            LogKind::Failure => "failure",
            LogKind::Note => "note",
        }
    }

    /// Essential entries are pruned only after every other old entry is gone.
    pub fn is_essential(self) -> bool {
        matches!(self, LogKind::Checkpoint | LogKind::Rollback | LogKind::Failure)
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub kind: LogKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Checkpoint references
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointCategory {
    PhaseComplete,
    IntegrationBarrier,
    PreRollback,
    Interval,
    Manual,
}

impl CheckpointCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointCategory::PhaseComplete => "phase_complete",
            CheckpointCategory::IntegrationBarrier => "integration_barrier",
            CheckpointCategory::PreRollback => "pre_rollback",
            CheckpointCategory::Interval => "interval",
            CheckpointCategory::Manual => "manual",
        }
    }
}

impl fmt::Display for CheckpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckpointCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase_complete" => Ok(CheckpointCategory::PhaseComplete),
            "integration_barrier" => Ok(CheckpointCategory::IntegrationBarrier),
            "pre_rollback" => Ok(CheckpointCategory::PreRollback),
            "interval" => Ok(CheckpointCategory::Interval),
            "manual" => Ok(CheckpointCategory::Manual),
            other => Err(format!("unknown checkpoint category '{other}'")),
        }
    }
}

/// Pointer from the live context to an immutable checkpoint file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub id: String,
    pub label: String,
    pub category: CheckpointCategory,
    pub created_at: DateTime<Utc>,
    /// External state captured with the checkpoint, e.g. a commit id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    /// Set when retention deleted the checkpoint file. The reference stays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pruned_at: Option<DateTime<Utc>>,
}

impl CheckpointRef {
    pub fn is_live(&self) -> bool {
        self.pruned_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Durable record of one workflow run: the single document the store saves,
/// checkpoints copy and the migrator upgrades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub version: u32,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub phase: String,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub pending_actions: Vec<String>,
    #[serde(default)]
    pub modified_files: BTreeSet<String>,
    #[serde(default)]
    pub checkpoints: Vec<CheckpointRef>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub task_status: BTreeMap<String, TaskStatus>,
    #[serde(default)]
    pub archived_log_entries: u64,
    /// Failed tasks an operator accepted as done.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub accepted_failures: BTreeSet<String>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: SCHEMA_VERSION,
            workflow_id: workflow_id.into(),
            timestamp: now,
            phase: "planning".to_string(),
            decisions: Vec::new(),
            pending_actions: Vec::new(),
            modified_files: BTreeSet::new(),
            checkpoints: Vec::new(),
            log: Vec::new(),
            started_at: now,
            task_status: BTreeMap::new(),
            archived_log_entries: 0,
            accepted_failures: BTreeSet::new(),
        }
    }

    pub fn touch(&mut self) {
        self.timestamp = Utc::now();
    }

    pub fn set_phase(&mut self, phase: impl Into<String>) {
        self.phase = phase.into();
    }

    pub fn log(&mut self, kind: LogKind, message: impl Into<String>) {
        self.push_log(kind, None, message.into());
    }

    pub fn log_task(&mut self, kind: LogKind, task_id: &str, message: impl Into<String>) {
        self.push_log(kind, Some(task_id.to_string()), message.into());
    }

    fn push_log(&mut self, kind: LogKind, task_id: Option<String>, message: String) {
        self.log.push(LogEntry {
            at: Utc::now(),
            kind,
            message,
            task_id,
        });
    }

    pub fn record_decision(&mut self, summary: impl Into<String>, task_id: Option<&str>) {
        self.decisions.push(Decision {
            at: Utc::now(),
            summary: summary.into(),
            task_id: task_id.map(str::to_string),
        });
    }

    /// Queue a follow-up action. Duplicates are ignored.
    pub fn add_pending_action(&mut self, action: impl Into<String>) {
        let action = action.into();
        if !self.pending_actions.contains(&action) {
            self.pending_actions.push(action);
        }
    }

    pub fn record_modified<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modified_files.extend(files.into_iter().map(Into::into));
    }

    pub fn set_task_status(&mut self, task_id: &str, status: TaskStatus) {
        self.task_status.insert(task_id.to_string(), status);
    }

    pub fn checkpoint(&self, id: &str) -> Option<&CheckpointRef> {
        self.checkpoints.iter().find(|c| c.id == id)
    }

    pub fn live_checkpoints(&self) -> impl Iterator<Item = &CheckpointRef> {
        self.checkpoints.iter().filter(|c| c.is_live())
    }

    /// Most recent checkpoint whose file still exists.
    pub fn last_checkpoint(&self) -> Option<&CheckpointRef> {
        self.live_checkpoints().max_by_key(|c| c.created_at)
    }

    /// Check the invariants a loaded document must satisfy.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version != SCHEMA_VERSION {
            return Err(format!(
                "schema version {} does not match current {SCHEMA_VERSION}",
                self.version
            ));
        }
        paths::validate_workflow_id(&self.workflow_id).map_err(|e| e.to_string())?;
        let mut seen = BTreeSet::new();
        for cp in &self.checkpoints {
            if !seen.insert(cp.id.as_str()) {
                return Err(format!("duplicate checkpoint reference '{}'", cp.id));
            }
        }
        Ok(())
    }

    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Size optimization
    // -----------------------------------------------------------------------

    /// Remove old log entries until the serialized document fits `target_bytes`
    /// and the log holds at most `max_log_entries`.
    ///
    /// The newest `keep_recent_log` entries and every checkpoint reference are
    /// always kept. Non-essential entries go first, oldest first. The removed
    /// entries are returned in their original order so the caller can archive
    /// them.
    pub fn prune(&mut self, config: &ContextConfig, target_bytes: usize) -> Vec<LogEntry> {
        let keep_from = self.log.len().saturating_sub(config.keep_recent_log);
        let entry_size = |e: &LogEntry| serde_json::to_vec(e).map(|v| v.len() + 1).unwrap_or(0);

        let mut size = self.serialized_size();
        let mut over_count = self.log.len().saturating_sub(config.max_log_entries);
        let mut remove = vec![false; self.log.len()];

        for essential in [false, true] {
            for (i, entry) in self.log[..keep_from].iter().enumerate() {
                if size <= target_bytes && over_count == 0 {
                    break;
                }
                if remove[i] || entry.kind.is_essential() != essential {
                    continue;
                }
                remove[i] = true;
                size = size.saturating_sub(entry_size(entry));
                over_count = over_count.saturating_sub(1);
            }
        }

        let mut pruned = Vec::new();
        let mut kept = Vec::with_capacity(self.log.len());
        for (entry, gone) in std::mem::take(&mut self.log).into_iter().zip(remove) {
            if gone {
                pruned.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.log = kept;
        self.archived_log_entries += pruned.len() as u64;
        pruned
    }

    // -----------------------------------------------------------------------
    // Display
    // -----------------------------------------------------------------------

    pub fn summary(&self) -> ContextSummary {
        let count = |s: TaskStatus| self.task_status.values().filter(|v| **v == s).count();
        ContextSummary {
            workflow_id: self.workflow_id.clone(),
            phase: self.phase.clone(),
            version: self.version,
            total: self.task_status.len(),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            blocked: count(TaskStatus::Blocked),
            in_progress: self.task_status.values().filter(|s| s.is_active()).count(),
            checkpoints: self.live_checkpoints().count(),
            last_checkpoint: self.last_checkpoint().map(|c| c.id.clone()),
            elapsed_secs: (self.timestamp - self.started_at).num_seconds().max(0),
            updated_at: self.timestamp,
        }
    }
}

/// Read-only view for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSummary {
    pub workflow_id: String,
    pub phase: String,
    pub version: u32,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub in_progress: usize,
    pub checkpoints: usize,
    pub last_checkpoint: Option<String>,
    pub elapsed_secs: i64,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for ContextSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}/{} completed, {} failed, {} blocked, {} in progress, elapsed {}s",
            self.workflow_id,
            self.phase,
            self.completed,
            self.total,
            self.failed,
            self.blocked,
            self.in_progress,
            self.elapsed_secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(n: usize) -> WorkflowContext {
        let mut ctx = WorkflowContext::new("wf-1");
        for i in 0..n {
            let kind = if i % 10 == 0 {
                LogKind::Checkpoint
            } else {
                LogKind::Transition
            };
            ctx.log(kind, format!("entry {i} {}", "x".repeat(200)));
        }
        ctx
    }

    #[test]
    fn new_context_is_current_and_valid() {
        let ctx = WorkflowContext::new("wf-1");
        assert_eq!(ctx.version, SCHEMA_VERSION);
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_checkpoint_refs() {
        let mut ctx = WorkflowContext::new("wf-1");
        let r = CheckpointRef {
            id: "cp-0001".into(),
            label: "x".into(),
            category: CheckpointCategory::Manual,
            created_at: Utc::now(),
            external_ref: None,
            pruned_at: None,
        };
        ctx.checkpoints.push(r.clone());
        ctx.checkpoints.push(r);
        assert!(ctx.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn pending_actions_deduplicate() {
        let mut ctx = WorkflowContext::new("wf-1");
        ctx.add_pending_action("review auth");
        ctx.add_pending_action("review auth");
        ctx.add_pending_action("merge Cargo.toml change");
        assert_eq!(ctx.pending_actions, vec!["review auth", "merge Cargo.toml change"]);
    }

    #[test]
    fn prune_fits_target_and_keeps_recent() {
        let mut ctx = filled(600);
        let config = ContextConfig::default();
        let last: Vec<String> = ctx.log[550..].iter().map(|e| e.message.clone()).collect();
        let target = 40 * 1024;

        let pruned = ctx.prune(&config, target);

        assert!(ctx.serialized_size() <= target);
        assert!(ctx.log.len() >= config.keep_recent_log);
        let tail: Vec<String> = ctx.log[ctx.log.len() - 50..]
            .iter()
            .map(|e| e.message.clone())
            .collect();
        assert_eq!(tail, last);
        assert_eq!(ctx.archived_log_entries, pruned.len() as u64);
        assert_eq!(ctx.log.len() + pruned.len(), 600);
    }

    #[test]
    fn prune_drops_non_essential_first() {
        let mut ctx = filled(200);
        let config = ContextConfig {
            keep_recent_log: 10,
            ..ContextConfig::default()
        };
        let target = ctx.serialized_size() - 20 * 230;
        let pruned = ctx.prune(&config, target);
        assert!(!pruned.is_empty());
        assert!(pruned.iter().all(|e| !e.kind.is_essential()));
    }

    #[test]
    fn prune_enforces_max_entries() {
        let mut ctx = filled(30);
        let config = ContextConfig {
            keep_recent_log: 5,
            max_log_entries: 20,
            ..ContextConfig::default()
        };
        let pruned = ctx.prune(&config, usize::MAX);
        assert_eq!(pruned.len(), 10);
        assert_eq!(ctx.log.len(), 20);
    }

    #[test]
    fn summary_counts_task_statuses() {
        let mut ctx = WorkflowContext::new("wf-1");
        ctx.set_task_status("a", TaskStatus::Completed);
        ctx.set_task_status("b", TaskStatus::Failed);
        ctx.set_task_status("c", TaskStatus::InProgress);
        let s = ctx.summary();
        assert_eq!((s.total, s.completed, s.failed, s.in_progress), (3, 1, 1, 1));
        assert!(s.to_string().starts_with("wf-1 [planning] 1/3 completed"));
    }
}
