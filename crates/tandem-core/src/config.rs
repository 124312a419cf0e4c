use crate::error::{Result, TandemError};
use crate::paths;
use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// A worker silent for longer than this gets an advisory redirect.
    #[serde(default = "default_stall_window")]
    pub stall_window_secs: u64,
    #[serde(default = "default_max_plan_rejections")]
    pub max_plan_rejections: u32,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// `None` disables interval checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: Option<u64>,
    #[serde(default = "default_save_retries")]
    pub save_retries: u32,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_stall_window() -> u64 {
    600
}

fn default_max_plan_rejections() -> u32 {
    3
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_checkpoint_interval() -> Option<u64> {
    Some(1800)
}

fn default_save_retries() -> u32 {
    3
}

fn default_channel_capacity() -> usize {
    32
}

fn default_poll_interval() -> u64 {
    200
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stall_window_secs: default_stall_window(),
            max_plan_rejections: default_max_plan_rejections(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            save_retries: default_save_retries(),
            channel_capacity: default_channel_capacity(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn stall_window(&self) -> Duration {
        Duration::from_secs(self.stall_window_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// ContextConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Pruning kicks in once the serialized context exceeds this size.
    #[serde(default = "default_soft_limit")]
    pub soft_limit_bytes: usize,
    /// A save that is still larger than this after pruning fails.
    #[serde(default = "default_hard_limit")]
    pub hard_limit_bytes: usize,
    /// Newest log entries that pruning never touches.
    #[serde(default = "default_keep_recent_log")]
    pub keep_recent_log: usize,
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_soft_limit() -> usize {
    100 * 1024
}

fn default_hard_limit() -> usize {
    500 * 1024
}

fn default_keep_recent_log() -> usize {
    50
}

fn default_max_log_entries() -> usize {
    500
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            soft_limit_bytes: default_soft_limit(),
            hard_limit_bytes: default_hard_limit(),
            keep_recent_log: default_keep_recent_log(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_max_checkpoints")]
    pub max_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_hours: Option<u64>,
}

fn default_max_checkpoints() -> usize {
    5
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_checkpoints(),
            max_age_hours: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PlanGateConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGateConfig {
    /// Globs identifying test-owned files.
    #[serde(default = "default_test_patterns")]
    pub test_patterns: Vec<String>,
    #[serde(default = "default_max_targets")]
    pub max_implementation_targets: usize,
    #[serde(default = "default_min_rationale")]
    pub min_rationale_chars: usize,
}

fn default_test_patterns() -> Vec<String> {
    vec![
        "tests/**".to_string(),
        "**/tests/**".to_string(),
        "**/*_test.*".to_string(),
        "**/test_*".to_string(),
        "**/*.test.*".to_string(),
        "**/*.spec.*".to_string(),
    ]
}

fn default_max_targets() -> usize {
    5
}

fn default_min_rationale() -> usize {
    20
}

impl Default for PlanGateConfig {
    fn default() -> Self {
        Self {
            test_patterns: default_test_patterns(),
            max_implementation_targets: default_max_targets(),
            min_rationale_chars: default_min_rationale(),
        }
    }
}

// ---------------------------------------------------------------------------
// RolesConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolesConfig {
    /// Roles whose workers must pass the plan gate before executing.
    #[serde(default = "default_plan_required")]
    pub plan_required: Vec<Role>,
}

fn default_plan_required() -> Vec<Role> {
    Role::all()
        .iter()
        .copied()
        .filter(|r| r.plan_required_by_default())
        .collect()
}

impl Default for RolesConfig {
    fn default() -> Self {
        Self {
            plan_required: default_plan_required(),
        }
    }
}

impl RolesConfig {
    pub fn plan_required(&self, role: Role) -> bool {
        self.plan_required.contains(&role)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    #[serde(default)]
    pub plan_gate: PlanGateConfig,
    #[serde(default)]
    pub roles: RolesConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            scheduler: SchedulerConfig::default(),
            context: ContextConfig::default(),
            checkpoints: CheckpointConfig::default(),
            plan_gate: PlanGateConfig::default(),
            roles: RolesConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(TandemError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Like [`Config::load`], but an uninitialized root yields the defaults.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        match Self::load(root) {
            Err(TandemError::NotInitialized) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.context.soft_limit_bytes >= self.context.hard_limit_bytes {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: format!(
                    "context.soft_limit_bytes ({}) must be below hard_limit_bytes ({})",
                    self.context.soft_limit_bytes, self.context.hard_limit_bytes
                ),
            });
        }

        if self.context.keep_recent_log > self.context.max_log_entries {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "context.keep_recent_log ({}) exceeds max_log_entries ({}); \
                     the log will never be trimmed below keep_recent_log",
                    self.context.keep_recent_log, self.context.max_log_entries
                ),
            });
        }

        if self.scheduler.max_plan_rejections == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "scheduler.max_plan_rejections must be at least 1".to_string(),
            });
        } else if self.scheduler.max_plan_rejections > 10 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "scheduler.max_plan_rejections={} (>10 is unusual)",
                    self.scheduler.max_plan_rejections
                ),
            });
        }

        if self.scheduler.channel_capacity == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "scheduler.channel_capacity must be at least 1".to_string(),
            });
        }

        if self.checkpoints.max_count == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "checkpoints.max_count=0 keeps only the latest checkpoint per category"
                    .to_string(),
            });
        }

        for pattern in &self.plan_gate.test_patterns {
            if let Err(e) = globset::Glob::new(pattern) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("plan_gate.test_patterns: invalid glob '{pattern}': {e}"),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
