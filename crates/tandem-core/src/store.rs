use crate::config::ContextConfig;
use crate::context::{LogEntry, WorkflowContext};
use crate::error::{Result, TandemError};
use crate::{io, migrations, paths};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// On-disk wrapper around a serialized context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
    pub context: Value,
}

fn checksum_of(body: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(body)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Wrap a context with its checksum.
pub fn seal(ctx: &WorkflowContext) -> Result<Envelope> {
    let context = serde_json::to_value(ctx)?;
    Ok(Envelope {
        checksum: checksum_of(&context)?,
        saved_at: Utc::now(),
        context,
    })
}

/// Verify, migrate and validate a raw snapshot document.
///
/// Accepts either an [`Envelope`] or a bare legacy context without checksum.
pub fn unseal(doc: Value, workflow_id: &str) -> Result<WorkflowContext> {
    let corrupt = |reason: String| TandemError::CorruptedContext {
        workflow_id: workflow_id.to_string(),
        reason,
    };

    let body = match doc {
        Value::Object(mut obj) if obj.contains_key("context") && obj.contains_key("checksum") => {
            let body = obj.remove("context").unwrap_or(Value::Null);
            let expected = obj
                .get("checksum")
                .and_then(Value::as_str)
                .ok_or_else(|| corrupt("checksum is not a string".to_string()))?;
            let actual = checksum_of(&body)?;
            if actual != expected {
                return Err(corrupt(format!(
                    "checksum mismatch (expected {expected}, found {actual})"
                )));
            }
            body
        }
        other => other,
    };

    let (ctx, from) = match migrations::migrate(body) {
        Ok(done) => done,
        Err(TandemError::Json(e)) => return Err(corrupt(e.to_string())),
        Err(e) => return Err(e),
    };
    if from != ctx.version {
        info!(workflow = %workflow_id, from, to = ctx.version, "context migrated");
    }
    ctx.validate().map_err(corrupt)?;
    if ctx.workflow_id != workflow_id {
        return Err(corrupt(format!(
            "snapshot belongs to workflow '{}'",
            ctx.workflow_id
        )));
    }
    Ok(ctx)
}

fn decode(bytes: &[u8], workflow_id: &str) -> Result<WorkflowContext> {
    let doc: Value = serde_json::from_slice(bytes).map_err(|e| TandemError::CorruptedContext {
        workflow_id: workflow_id.to_string(),
        reason: e.to_string(),
    })?;
    unseal(doc, workflow_id)
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// Which file a context was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Primary,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub bytes: usize,
    pub pruned: usize,
}

/// Durable storage of workflow contexts under `.tandem/contexts/<id>/`.
pub struct SnapshotStore {
    root: PathBuf,
    config: ContextConfig,
    /// Number of upcoming saves to abort right before the rename.
    #[cfg(test)]
    interrupt_saves: std::sync::atomic::AtomicU32,
}

impl SnapshotStore {
    pub fn new(root: &Path, config: ContextConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            #[cfg(test)]
            interrupt_saves: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self, workflow_id: &str) -> bool {
        paths::context_path(&self.root, workflow_id).exists()
            || paths::backup_path(&self.root, workflow_id).exists()
    }

    /// Persist `ctx`, pruning it first if it exceeds the soft limit or holds
    /// more than `max_log_entries` log entries.
    ///
    /// The new snapshot is staged in a tempfile, re-read and verified before
    /// the previous snapshot is copied to the backup and replaced. Any failure
    /// leaves the previous snapshot untouched and yields `SaveFailed`.
    pub fn save(&self, ctx: &mut WorkflowContext) -> Result<SaveOutcome> {
        let id = ctx.workflow_id.clone();
        let failed = |reason: String| TandemError::SaveFailed {
            workflow_id: id.clone(),
            reason,
        };
        paths::validate_workflow_id(&id)?;
        ctx.touch();

        let mut data = encode(ctx).map_err(|e| failed(e.to_string()))?;
        let mut pruned = 0;
        if data.len() > self.config.soft_limit_bytes || ctx.log.len() > self.config.max_log_entries {
            let overhead = data.len().saturating_sub(ctx.serialized_size());
            let target = self.config.soft_limit_bytes.saturating_sub(overhead);
            let entries = ctx.prune(&self.config, target);
            pruned = entries.len();
            self.archive(&id, &entries)
                .map_err(|e| failed(format!("archiving pruned log: {e}")))?;
            data = encode(ctx).map_err(|e| failed(e.to_string()))?;
            info!(workflow = %id, pruned, bytes = data.len(), "context pruned");
        }
        if data.len() > self.config.hard_limit_bytes {
            return Err(failed(format!(
                "context is {} bytes after pruning, above the {} byte cap",
                data.len(),
                self.config.hard_limit_bytes
            )));
        }

        let path = paths::context_path(&self.root, &id);
        let staged = io::stage(&path, &data).map_err(|e| failed(e.to_string()))?;
        let reread = std::fs::read(staged.path()).map_err(|e| failed(e.to_string()))?;
        decode(&reread, &id).map_err(|e| failed(format!("verification failed: {e}")))?;

        #[cfg(test)]
        if self
            .interrupt_saves
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok()
        {
            return Err(failed("interrupted before persist".to_string()));
        }

        self.backup_current(&id)
            .map_err(|e| failed(format!("backing up previous snapshot: {e}")))?;
        staged
            .persist(&path)
            .map_err(|e| failed(e.error.to_string()))?;

        debug!(workflow = %id, bytes = data.len(), "context saved");
        Ok(SaveOutcome {
            bytes: data.len(),
            pruned,
        })
    }

    /// Save with up to `retries` additional attempts.
    pub fn save_with_retries(&self, ctx: &mut WorkflowContext, retries: u32) -> Result<SaveOutcome> {
        let mut attempt = 0;
        loop {
            match self.save(ctx) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(workflow = %ctx.workflow_id, attempt, error = %e, "save failed; retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Copy the current snapshot to the backup, but only when it verifies.
    /// A corrupt primary must never overwrite a good backup.
    fn backup_current(&self, workflow_id: &str) -> Result<()> {
        let path = paths::context_path(&self.root, workflow_id);
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&path)?;
        match decode(&bytes, workflow_id) {
            Ok(_) => io::atomic_write(&paths::backup_path(&self.root, workflow_id), &bytes),
            Err(e) => {
                warn!(workflow = %workflow_id, error = %e, "current snapshot invalid; keeping backup");
                Ok(())
            }
        }
    }

    pub fn load(&self, workflow_id: &str) -> Result<WorkflowContext> {
        self.load_with_source(workflow_id).map(|(ctx, _)| ctx)
    }

    /// Load the primary snapshot, falling back to the backup when the primary
    /// is missing or fails verification.
    pub fn load_with_source(&self, workflow_id: &str) -> Result<(WorkflowContext, SnapshotSource)> {
        paths::validate_workflow_id(workflow_id)?;
        let primary = paths::context_path(&self.root, workflow_id);
        let backup = paths::backup_path(&self.root, workflow_id);
        if !primary.exists() && !backup.exists() {
            return Err(TandemError::ContextNotFound(workflow_id.to_string()));
        }

        let primary_err = if primary.exists() {
            match decode(&std::fs::read(&primary)?, workflow_id) {
                Ok(ctx) => return Ok((ctx, SnapshotSource::Primary)),
                Err(e @ TandemError::MigrationGap { .. }) => return Err(e),
                Err(e) => {
                    warn!(workflow = %workflow_id, error = %e, "primary snapshot invalid; trying backup");
                    e.to_string()
                }
            }
        } else {
            "primary snapshot missing".to_string()
        };

        if !backup.exists() {
            return Err(TandemError::CorruptedContext {
                workflow_id: workflow_id.to_string(),
                reason: format!("{primary_err}; no backup"),
            });
        }
        match decode(&std::fs::read(&backup)?, workflow_id) {
            Ok(ctx) => {
                info!(workflow = %workflow_id, "recovered context from backup");
                Ok((ctx, SnapshotSource::Backup))
            }
            Err(e @ TandemError::MigrationGap { .. }) => Err(e),
            Err(e) => Err(TandemError::CorruptedContext {
                workflow_id: workflow_id.to_string(),
                reason: format!("{primary_err}; backup: {e}"),
            }),
        }
    }

    /// Workflow ids with a stored context, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = paths::contexts_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.exists(name) {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Log archive
    // -----------------------------------------------------------------------

    fn archive(&self, workflow_id: &str, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut text = String::new();
        for entry in entries {
            text.push_str(&serde_json::to_string(entry)?);
            text.push('\n');
        }
        io::append_text(&paths::log_archive_path(&self.root, workflow_id), &text)
    }

    /// Entries externalized from the context log, oldest first.
    pub fn read_archive(&self, workflow_id: &str) -> Result<Vec<LogEntry>> {
        let path = paths::log_archive_path(&self.root, workflow_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(TandemError::from))
            .collect()
    }
}

fn encode(ctx: &WorkflowContext) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(&seal(ctx)?)?)
}
