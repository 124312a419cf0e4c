use crate::config::CheckpointConfig;
use crate::context::{CheckpointCategory, CheckpointRef, LogKind, WorkflowContext};
use crate::error::{Result, TandemError};
use crate::store::{self, Envelope};
use crate::{io, paths};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// External state
// ---------------------------------------------------------------------------

/// State outside the context that a checkpoint can pin, such as the working
/// tree's commit.
pub trait ExternalState: Send + Sync {
    fn capture(&self) -> Result<String>;
    fn restore(&self, reference: &str) -> Result<()>;
}

/// Pins `git rev-parse HEAD`; restores with `git checkout <rev> -- .`.
pub struct GitHead {
    repo: PathBuf,
}

impl GitHead {
    pub fn new(repo: &Path) -> Self {
        Self {
            repo: repo.to_path_buf(),
        }
    }

    /// `None` when `repo` is not inside a git work tree or git is missing.
    pub fn detect(repo: &Path) -> Option<Self> {
        which::which("git").ok()?;
        let output = Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(repo)
            .output()
            .ok()?;
        output.status.success().then(|| Self::new(repo))
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .map_err(|e| TandemError::ExternalState(format!("running git: {e}")))?;
        if !output.status.success() {
            return Err(TandemError::ExternalState(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ExternalState for GitHead {
    fn capture(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    fn restore(&self, reference: &str) -> Result<()> {
        self.git(&["checkout", reference, "--", "."]).map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Checkpoint files
// ---------------------------------------------------------------------------

/// Contents of `checkpoints/<id>.json`. Written once, never modified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    pub checkpoint: CheckpointRef,
    pub snapshot: Envelope,
}

pub struct CheckpointManager {
    root: PathBuf,
    config: CheckpointConfig,
    external: Option<Box<dyn ExternalState>>,
}

impl CheckpointManager {
    pub fn new(root: &Path, config: CheckpointConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            external: None,
        }
    }

    pub fn with_external(mut self, external: Box<dyn ExternalState>) -> Self {
        self.external = Some(external);
        self
    }

    fn next_id(&self, ctx: &WorkflowContext) -> String {
        let mut max = ctx
            .checkpoints
            .iter()
            .filter_map(|c| parse_seq(&c.id))
            .max()
            .unwrap_or(0);
        let dir = paths::checkpoints_dir(&self.root, &ctx.workflow_id);
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let stem = name.to_string_lossy();
                if let Some(n) = stem.strip_suffix(".json").and_then(parse_seq) {
                    max = max.max(n);
                }
            }
        }
        format!("cp-{:04}", max + 1)
    }

    /// Write an immutable checkpoint of `ctx` and record its reference in
    /// `ctx`. The stored copy already contains its own reference.
    ///
    /// The caller is responsible for saving `ctx` afterwards.
    pub fn checkpoint(
        &self,
        ctx: &mut WorkflowContext,
        label: &str,
        category: CheckpointCategory,
    ) -> Result<CheckpointRef> {
        let id = self.next_id(ctx);
        let path = paths::checkpoint_path(&self.root, &ctx.workflow_id, &id);
        if path.exists() {
            return Err(TandemError::CheckpointExists(id));
        }
        let external_ref = match &self.external {
            Some(ext) => match ext.capture() {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(checkpoint = %id, error = %e, "external state not captured");
                    None
                }
            },
            None => None,
        };

        let reference = CheckpointRef {
            id: id.clone(),
            label: label.to_string(),
            category,
            created_at: Utc::now(),
            external_ref,
            pruned_at: None,
        };
        ctx.checkpoints.push(reference.clone());
        ctx.log(LogKind::Checkpoint, format!("checkpoint {id} ({category}): {label}"));
        ctx.touch();

        let file = CheckpointFile {
            checkpoint: reference.clone(),
            snapshot: store::seal(ctx)?,
        };
        let data = serde_json::to_vec_pretty(&file)?;
        if !io::write_if_missing(&path, &data)? {
            ctx.checkpoints.pop();
            ctx.log.pop();
            return Err(TandemError::CheckpointExists(id));
        }
        info!(workflow = %ctx.workflow_id, checkpoint = %id, %category, "checkpoint created");

        self.apply_retention(ctx, Utc::now())?;
        Ok(reference)
    }

    pub fn get(&self, workflow_id: &str, checkpoint_id: &str) -> Result<CheckpointFile> {
        let path = paths::checkpoint_path(&self.root, workflow_id, checkpoint_id);
        if !path.exists() {
            return Err(TandemError::CheckpointNotFound(checkpoint_id.to_string()));
        }
        let data = std::fs::read(&path)?;
        let file: CheckpointFile =
            serde_json::from_slice(&data).map_err(|e| TandemError::CorruptedContext {
                workflow_id: workflow_id.to_string(),
                reason: format!("checkpoint {checkpoint_id}: {e}"),
            })?;
        Ok(file)
    }

    /// References recorded in `ctx`, including pruned ones, oldest first.
    pub fn list<'a>(&self, ctx: &'a WorkflowContext) -> Vec<&'a CheckpointRef> {
        let mut refs: Vec<&CheckpointRef> = ctx.checkpoints.iter().collect();
        refs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        refs
    }

    // -----------------------------------------------------------------------
    // Retention
    // -----------------------------------------------------------------------

    /// Prune checkpoints beyond `max_count` or older than `max_age_hours`.
    ///
    /// The newest live checkpoint of each category always survives. Pruned
    /// files are deleted but their references stay in `ctx`, marked with
    /// `pruned_at`. Returns the pruned ids.
    pub fn apply_retention(&self, ctx: &mut WorkflowContext, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut live: Vec<(usize, DateTime<Utc>, CheckpointCategory)> = ctx
            .checkpoints
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_live())
            .map(|(i, c)| (i, c.created_at, c.category))
            .collect();
        live.sort_by_key(|(i, at, _)| (*at, *i));

        let mut protected = BTreeSet::new();
        let mut seen = BTreeSet::new();
        for (i, _, category) in live.iter().rev() {
            if seen.insert(*category) {
                protected.insert(*i);
            }
        }

        let cutoff = self
            .config
            .max_age_hours
            .map(|h| now - Duration::hours(h as i64));
        let mut remaining = live.len();
        let mut doomed = Vec::new();
        for (i, at, _) in &live {
            if protected.contains(i) {
                continue;
            }
            let too_many = remaining > self.config.max_count;
            let too_old = cutoff.is_some_and(|c| *at < c);
            if too_many || too_old {
                doomed.push(*i);
                remaining -= 1;
            }
        }

        let mut pruned = Vec::new();
        for i in doomed {
            let cp = &mut ctx.checkpoints[i];
            let path = paths::checkpoint_path(&self.root, &ctx.workflow_id, &cp.id);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            cp.pruned_at = Some(now);
            pruned.push(cp.id.clone());
        }
        if !pruned.is_empty() {
            info!(workflow = %ctx.workflow_id, pruned = ?pruned, "checkpoints pruned by retention");
        }
        Ok(pruned)
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    /// Restore the context stored in `checkpoint_id`.
    ///
    /// `live` is checkpointed first (category `pre_rollback`). The restored
    /// context keeps every checkpoint reference `live` knows about, so no
    /// history is lost by going back.
    pub fn rollback(
        &self,
        live: &mut WorkflowContext,
        checkpoint_id: &str,
        restore_external: bool,
    ) -> Result<WorkflowContext> {
        if live.checkpoint(checkpoint_id).is_some_and(|c| !c.is_live()) {
            return Err(TandemError::CheckpointNotFound(format!(
                "{checkpoint_id} (pruned)"
            )));
        }
        let file = self.get(&live.workflow_id, checkpoint_id)?;
        let mut restored = store::unseal(
            serde_json::to_value(&file.snapshot)?,
            &live.workflow_id,
        )?;

        let pre = self.checkpoint(
            live,
            &format!("before rollback to {checkpoint_id}"),
            CheckpointCategory::PreRollback,
        )?;

        if restore_external {
            match (&self.external, &file.checkpoint.external_ref) {
                (Some(ext), Some(reference)) => ext.restore(reference)?,
                (None, Some(_)) => {
                    warn!(checkpoint = %checkpoint_id, "no external state handler; skipping restore")
                }
                _ => {}
            }
        }

        for reference in &live.checkpoints {
            match restored.checkpoints.iter_mut().find(|c| c.id == reference.id) {
                Some(existing) => existing.pruned_at = reference.pruned_at,
                None => restored.checkpoints.push(reference.clone()),
            }
        }
        restored
            .checkpoints
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        restored.log(
            LogKind::Rollback,
            format!("rolled back to {checkpoint_id}; live state saved as {}", pre.id),
        );
        restored.touch();
        info!(workflow = %live.workflow_id, checkpoint = %checkpoint_id, pre_rollback = %pre.id, "rolled back");
        Ok(restored)
    }
}

fn parse_seq(id: &str) -> Option<u32> {
    id.strip_prefix("cp-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeHead {
        restored: Arc<Mutex<Vec<String>>>,
        counter: Mutex<u32>,
    }

    impl ExternalState for FakeHead {
        fn capture(&self) -> Result<String> {
            let mut n = self.counter.lock().unwrap();
            *n += 1;
            Ok(format!("rev{n}"))
        }

        fn restore(&self, reference: &str) -> Result<()> {
            self.restored.lock().unwrap().push(reference.to_string());
            Ok(())
        }
    }

    fn manager(dir: &TempDir, max_count: usize) -> CheckpointManager {
        CheckpointManager::new(
            dir.path(),
            CheckpointConfig {
                max_count,
                max_age_hours: None,
            },
        )
    }

    #[test]
    fn checkpoint_ids_are_sequential_and_files_immutable() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        let mut ctx = WorkflowContext::new("wf-1");
        let a = m.checkpoint(&mut ctx, "first", CheckpointCategory::Manual).unwrap();
        let b = m.checkpoint(&mut ctx, "second", CheckpointCategory::Manual).unwrap();
        assert_eq!(a.id, "cp-0001");
        assert_eq!(b.id, "cp-0002");

        let stored = m.get("wf-1", "cp-0001").unwrap();
        assert_eq!(stored.checkpoint.label, "first");
        assert!(io::write_if_missing(
            &paths::checkpoint_path(dir.path(), "wf-1", "cp-0001"),
            b"{}"
        )
        .map(|written| !written)
        .unwrap());
    }

    #[test]
    fn rollback_keeps_every_checkpoint_reference() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        let mut live = WorkflowContext::new("wf-1");
        live.set_phase("red");
        m.checkpoint(&mut live, "tests written", CheckpointCategory::PhaseComplete)
            .unwrap();
        live.set_phase("green");
        m.checkpoint(&mut live, "implemented", CheckpointCategory::PhaseComplete)
            .unwrap();
        live.set_phase("refactor");
        m.checkpoint(&mut live, "refactored", CheckpointCategory::PhaseComplete)
            .unwrap();

        let restored = m.rollback(&mut live, "cp-0001", false).unwrap();

        assert_eq!(restored.phase, "red");
        let ids: Vec<&str> = restored.checkpoints.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cp-0001", "cp-0002", "cp-0003", "cp-0004"]);
        assert_eq!(
            restored.checkpoint("cp-0004").unwrap().category,
            CheckpointCategory::PreRollback
        );
        assert_eq!(restored.log.last().unwrap().kind, LogKind::Rollback);
        assert!(restored.validate().is_ok());
    }

    #[test]
    fn rollback_restores_external_state_on_request() {
        let dir = TempDir::new().unwrap();
        let head = FakeHead::default();
        let restored_refs = head.restored.clone();
        let m = manager(&dir, 10).with_external(Box::new(head));
        let mut live = WorkflowContext::new("wf-1");
        let cp = m.checkpoint(&mut live, "base", CheckpointCategory::Manual).unwrap();
        assert_eq!(cp.external_ref.as_deref(), Some("rev1"));

        m.rollback(&mut live, &cp.id, false).unwrap();
        assert!(restored_refs.lock().unwrap().is_empty());
        m.rollback(&mut live, &cp.id, true).unwrap();
        assert_eq!(*restored_refs.lock().unwrap(), vec!["rev1".to_string()]);
    }

    #[test]
    fn rollback_to_unknown_checkpoint_fails() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 10);
        let mut live = WorkflowContext::new("wf-1");
        let err = m.rollback(&mut live, "cp-0042", false).unwrap_err();
        assert_eq!(err.kind(), "CheckpointNotFound");
        assert!(live.checkpoints.is_empty());
    }

    #[test]
    fn retention_keeps_newest_per_category() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir, 2);
        let mut ctx = WorkflowContext::new("wf-1");
        m.checkpoint(&mut ctx, "barrier", CheckpointCategory::IntegrationBarrier)
            .unwrap();
        for i in 0..4 {
            m.checkpoint(&mut ctx, &format!("tick {i}"), CheckpointCategory::Interval)
                .unwrap();
        }

        let live: Vec<&str> = ctx.live_checkpoints().map(|c| c.id.as_str()).collect();
        assert_eq!(live, vec!["cp-0001", "cp-0005"]);
        assert_eq!(ctx.checkpoints.len(), 5);
        assert!(ctx.checkpoint("cp-0002").unwrap().pruned_at.is_some());
        assert!(m.get("wf-1", "cp-0002").is_err());
        assert!(m.rollback(&mut ctx, "cp-0002", false).is_err());
    }

    #[test]
    fn retention_by_age() {
        let dir = TempDir::new().unwrap();
        let m = CheckpointManager::new(
            dir.path(),
            CheckpointConfig {
                max_count: 10,
                max_age_hours: Some(1),
            },
        );
        let mut ctx = WorkflowContext::new("wf-1");
        m.checkpoint(&mut ctx, "a", CheckpointCategory::Manual).unwrap();
        m.checkpoint(&mut ctx, "b", CheckpointCategory::Manual).unwrap();
        let later = Utc::now() + Duration::hours(3);
        let pruned = m.apply_retention(&mut ctx, later).unwrap();
        assert_eq!(pruned, vec!["cp-0001".to_string()]);
    }
}
