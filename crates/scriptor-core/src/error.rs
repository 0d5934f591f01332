use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`ScriptorError`].
pub type ScriptorResult<T> = Result<T, ScriptorError>;

/// Top-level error type for the Scriptor framework.
///
/// Validation errors (`UnknownProfile`, `InvalidParams`) are returned
/// synchronously on submission. Stage errors are produced by agents and are
/// handled by the stage runner's retry policy; only the last one is ever
/// surfaced on a failed job.
#[derive(Error, Debug)]
pub enum ScriptorError {
    /// No workflow profile is registered under this name.
    #[error("Unknown profile: {0}")]
    UnknownProfile(String),

    /// The creation parameters were rejected.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// No job with this id exists (or it has been purged).
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// No artifact is stored under this handle.
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// An agent failed while executing a stage.
    #[error("Stage '{stage}' failed: {message}")]
    Stage {
        /// Stage that produced the error.
        stage: String,
        /// Agent-supplied failure detail.
        message: String,
    },

    /// An agent neither reported progress nor completed within the stage timeout.
    #[error("Stage '{stage}' timed out after {timeout_ms}ms without progress")]
    StageTimeout {
        /// Stage that timed out.
        stage: String,
        /// Configured inactivity timeout.
        timeout_ms: u64,
    },

    /// The operation is not allowed in the job's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An artifact store failure other than a missing handle.
    #[error("Artifact error: {0}")]
    Artifact(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScriptorError {
    /// Shorthand for an agent failure on `stage`.
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// True for every lookup miss: unknown job, artifact handle or profile.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_) | Self::ArtifactNotFound(_) | Self::UnknownProfile(_)
        )
    }

    /// True for errors rejected at submission time.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::UnknownProfile(_) | Self::InvalidParams(_))
    }

    /// True for errors that enter the stage retry path.
    pub fn is_stage_failure(&self) -> bool {
        matches!(self, Self::Stage { .. } | Self::StageTimeout { .. })
    }
}
