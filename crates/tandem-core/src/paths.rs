use crate::error::{Result, TandemError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TANDEM_DIR: &str = ".tandem";
pub const CONTEXTS_DIR: &str = ".tandem/contexts";
pub const CONFIG_FILE: &str = ".tandem/config.yaml";

pub const CONTEXT_FILE: &str = "context.json";
pub const BACKUP_FILE: &str = "context.json.bak";
pub const LOG_ARCHIVE_FILE: &str = "log-archive.jsonl";
pub const CHECKPOINTS_DIR: &str = "checkpoints";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn tandem_dir(root: &Path) -> PathBuf {
    root.join(TANDEM_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn contexts_dir(root: &Path) -> PathBuf {
    root.join(CONTEXTS_DIR)
}

pub fn workflow_dir(root: &Path, workflow_id: &str) -> PathBuf {
    contexts_dir(root).join(workflow_id)
}

pub fn context_path(root: &Path, workflow_id: &str) -> PathBuf {
    workflow_dir(root, workflow_id).join(CONTEXT_FILE)
}

pub fn backup_path(root: &Path, workflow_id: &str) -> PathBuf {
    workflow_dir(root, workflow_id).join(BACKUP_FILE)
}

pub fn log_archive_path(root: &Path, workflow_id: &str) -> PathBuf {
    workflow_dir(root, workflow_id).join(LOG_ARCHIVE_FILE)
}

pub fn checkpoints_dir(root: &Path, workflow_id: &str) -> PathBuf {
    workflow_dir(root, workflow_id).join(CHECKPOINTS_DIR)
}

pub fn checkpoint_path(root: &Path, workflow_id: &str, checkpoint_id: &str) -> PathBuf {
    checkpoints_dir(root, workflow_id).join(format!("{checkpoint_id}.json"))
}

// ---------------------------------------------------------------------------
// Workflow id validation
// ---------------------------------------------------------------------------

static WORKFLOW_ID_RE: OnceLock<Regex> = OnceLock::new();

fn workflow_id_re() -> &'static Regex {
    WORKFLOW_ID_RE
        .get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Workflow ids become directory names, so they are restricted to slugs.
pub fn validate_workflow_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 || !workflow_id_re().is_match(id) {
        return Err(TandemError::InvalidWorkflowId(id.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_workflow_ids() {
        for id in ["auth-login", "a", "tdd-run-42", "x1"] {
            validate_workflow_id(id).unwrap_or_else(|_| panic!("expected valid: {id}"));
        }
    }

    #[test]
    fn invalid_workflow_ids() {
        for id in ["", "-lead", "trail-", "has spaces", "UPPER", "../escape"] {
            assert!(validate_workflow_id(id).is_err(), "expected invalid: {id}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.tandem/config.yaml")
        );
        assert_eq!(
            context_path(root, "wf"),
            PathBuf::from("/tmp/proj/.tandem/contexts/wf/context.json")
        );
        assert_eq!(
            checkpoint_path(root, "wf", "cp-0001"),
            PathBuf::from("/tmp/proj/.tandem/contexts/wf/checkpoints/cp-0001.json")
        );
    }
}
