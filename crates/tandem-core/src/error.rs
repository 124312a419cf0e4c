use thiserror::Error;

#[derive(Debug, Error)]
pub enum TandemError {
    #[error("not initialized: run 'tandem init'")]
    NotInitialized,

    #[error("adding dependency {task} -> {depends_on} would create a cycle")]
    Cycle { task: String, depends_on: String },

    #[error("invalid transition for task {task} from {from} to {to}: {reason}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("worker '{worker}' reported a change outside its ownership boundary: {path}")]
    OwnershipViolation { worker: String, path: String },

    #[error("ownership boundary of task '{task}' overlaps active task '{active}'")]
    OwnershipOverlap { task: String, active: String },

    #[error("plan for task '{task}' rejected {rejections} times; escalated to blocked")]
    RepeatedPlanRejection { task: String, rejections: u32 },

    #[error("failed to save context '{workflow_id}': {reason}")]
    SaveFailed { workflow_id: String, reason: String },

    #[error("context '{workflow_id}' is corrupted: {reason}")]
    CorruptedContext { workflow_id: String, reason: String },

    #[error("no migration path from context schema v{found} (current is v{current})")]
    MigrationGap { found: u32, current: u32 },

    #[error("context not found: {0}")]
    ContextNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    TaskExists(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("checkpoint already exists and is immutable: {0}")]
    CheckpointExists(String),

    #[error("invalid glob pattern '{pattern}': {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("unknown role '{0}'")]
    InvalidRole(String),

    #[error("invalid workflow id '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidWorkflowId(String),

    #[error("invalid workflow definition: {0}")]
    InvalidWorkflow(String),

    #[error("external state error: {0}")]
    ExternalState(String),

    #[error("worker channel closed: {0}")]
    ChannelClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TandemError {
    /// Stable kind name used in failure reports and the activity log.
    pub fn kind(&self) -> &'static str {
        match self {
            TandemError::NotInitialized => "NotInitialized",
            TandemError::Cycle { .. } => "CycleError",
            TandemError::InvalidTransition { .. } => "InvalidTransitionError",
            TandemError::OwnershipViolation { .. } => "OwnershipViolation",
            TandemError::OwnershipOverlap { .. } => "OwnershipOverlap",
            TandemError::RepeatedPlanRejection { .. } => "RepeatedPlanRejection",
            TandemError::SaveFailed { .. } => "SaveFailed",
            TandemError::CorruptedContext { .. } => "CorruptedContext",
            TandemError::MigrationGap { .. } => "MigrationGapError",
            TandemError::ContextNotFound(_) => "ContextNotFound",
            TandemError::TaskNotFound(_) => "TaskNotFound",
            TandemError::TaskExists(_) => "TaskExists",
            TandemError::UnknownDependency { .. } => "UnknownDependency",
            TandemError::WorkerNotFound(_) => "WorkerNotFound",
            TandemError::CheckpointNotFound(_) => "CheckpointNotFound",
            TandemError::CheckpointExists(_) => "CheckpointExists",
            TandemError::InvalidGlob { .. } => "InvalidGlob",
            TandemError::InvalidRole(_) => "InvalidRole",
            TandemError::InvalidWorkflowId(_) => "InvalidWorkflowId",
            TandemError::InvalidWorkflow(_) => "InvalidWorkflow",
            TandemError::ExternalState(_) => "ExternalState",
            TandemError::ChannelClosed(_) => "ChannelClosed",
            TandemError::Io(_) => "Io",
            TandemError::Yaml(_) => "Yaml",
            TandemError::Json(_) => "Json",
        }
    }

    /// Errors in shared infrastructure abort the whole workflow; everything
    /// else is contained to a single task or lane.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TandemError::SaveFailed { .. }
                | TandemError::CorruptedContext { .. }
                | TandemError::MigrationGap { .. }
                | TandemError::InvalidTransition { .. }
                | TandemError::Cycle { .. }
                | TandemError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TandemError>;
