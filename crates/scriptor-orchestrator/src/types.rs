use crate::profiles::{StageTemplate, WorkflowProfile};
use chrono::{DateTime, Utc};
use scriptor_core::{Artifact, ScriptorError, ScriptorResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identity.
pub type JobId = Uuid;

/// Overall status of a job, derived from its stages (see [`Job::status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a single stage.
///
/// `Pending → Running → {Succeeded | Skipped | Failed}`; `Running` may loop
/// into itself across retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
}

impl StageStatus {
    /// Succeeded or skipped: the stage contributes its full weight.
    pub fn is_done(self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Skipped)
    }

    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Skipped | StageStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (StageStatus::Pending, StageStatus::Running)
                | (StageStatus::Running, StageStatus::Running)
                | (StageStatus::Running, StageStatus::Succeeded)
                | (StageStatus::Running, StageStatus::Skipped)
                | (StageStatus::Running, StageStatus::Failed)
        )
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Succeeded => write!(f, "succeeded"),
            StageStatus::Skipped => write!(f, "skipped"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of pipeline work inside a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Fixed at job creation.
    pub position: usize,
    /// Agent kind that executes this stage.
    pub agent: String,
    pub weight: u32,
    pub optional: bool,
    pub status: StageStatus,
    /// Stage-local progress, 0–100, never decreasing.
    pub percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Retry attempts made after the first one.
    pub retries: u32,
}

impl Stage {
    pub fn from_template(template: &StageTemplate, position: usize) -> Self {
        Self {
            name: template.name.clone(),
            position,
            agent: template.agent_kind().to_string(),
            weight: template.weight,
            optional: template.optional,
            status: StageStatus::Pending,
            percent: 0.0,
            started_at: None,
            finished_at: None,
            error: None,
            retries: 0,
        }
    }

    fn transition(&mut self, next: StageStatus) -> ScriptorResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ScriptorError::InvalidState(format!(
                "stage '{}' cannot move from {} to {}",
                self.name, self.status, next
            )));
        }
        self.status = next;
        match next {
            StageStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
            }
            StageStatus::Pending => {}
            _ => self.finished_at = Some(Utc::now()),
        }
        Ok(())
    }

    /// Raise local progress. Lower, equal and non-finite values are ignored.
    fn advance(&mut self, percent: f64) -> bool {
        if self.status != StageStatus::Running || !percent.is_finite() {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent > self.percent {
            self.percent = percent;
            true
        } else {
            false
        }
    }
}

/// One end-to-end request to produce an artifact via a profile's stage sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub profile: String,
    /// Opaque creation parameters forwarded to the first stage.
    pub params: serde_json::Value,
    /// Format tag of the final artifact.
    pub artifact_format: String,
    pub stages: Vec<Stage>,
    /// Index of the stage most recently started.
    pub current_stage: Option<usize>,
    /// Aggregate progress, 0–100, never decreasing.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Last stage error of a failed job.
    pub error: Option<String>,
    pub artifacts: Vec<Artifact>,
    /// Set by a cancel request; observed at the next stage boundary.
    pub cancel_requested: bool,
    #[serde(default)]
    admitted: bool,
    #[serde(default)]
    cancelled: bool,
}

impl Job {
    pub fn new(profile: &WorkflowProfile, params: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile: profile.name.clone(),
            params,
            artifact_format: profile.artifact_format.clone(),
            stages: profile
                .stages
                .iter()
                .enumerate()
                .map(|(position, template)| Stage::from_template(template, position))
                .collect(),
            current_stage: None,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            artifacts: Vec::new(),
            cancel_requested: false,
            admitted: false,
            cancelled: false,
        }
    }

    /// Status as a function of stage statuses plus admission and observed cancellation.
    pub fn status(&self) -> JobStatus {
        if self.cancelled {
            JobStatus::Cancelled
        } else if self.stages.iter().any(|s| s.status == StageStatus::Failed) {
            JobStatus::Failed
        } else if !self.stages.is_empty() && self.stages.iter().all(|s| s.status.is_done()) {
            JobStatus::Completed
        } else if self.admitted {
            JobStatus::Running
        } else {
            JobStatus::Queued
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    pub fn running_stage(&self) -> Option<&Stage> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Running)
    }

    pub fn running_stage_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Running)
            .count()
    }

    /// The artifact produced by the last stage, once the job has completed.
    pub fn final_artifact(&self) -> Option<&Artifact> {
        let last = self.stages.last()?;
        self.artifacts
            .iter()
            .rev()
            .find(|a| a.stage.as_deref() == Some(last.name.as_str()))
    }

    fn ensure_active(&self) -> ScriptorResult<()> {
        if self.is_terminal() {
            return Err(ScriptorError::InvalidState(format!(
                "job {} is already {}",
                self.id,
                self.status()
            )));
        }
        Ok(())
    }

    fn stage_mut(&mut self, idx: usize) -> ScriptorResult<&mut Stage> {
        self.ensure_active()?;
        let id = self.id;
        self.stages
            .get_mut(idx)
            .ok_or_else(|| ScriptorError::InvalidState(format!("job {id} has no stage {idx}")))
    }

    pub(crate) fn admit(&mut self) -> ScriptorResult<()> {
        self.ensure_active()?;
        self.admitted = true;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn mark_cancelled(&mut self) -> ScriptorResult<()> {
        self.ensure_active()?;
        self.cancelled = true;
        Ok(())
    }

    /// Start stage `idx`. Every earlier stage must be resolved and no other stage running.
    pub(crate) fn begin_stage(&mut self, idx: usize) -> ScriptorResult<()> {
        if !self.admitted {
            return Err(ScriptorError::InvalidState(format!(
                "job {} has not been admitted",
                self.id
            )));
        }
        if self.stages.iter().take(idx).any(|s| !s.status.is_resolved()) {
            return Err(ScriptorError::InvalidState(format!(
                "job {} cannot start stage {idx} before earlier stages resolve",
                self.id
            )));
        }
        if self.running_stage().is_some() {
            return Err(ScriptorError::InvalidState(format!(
                "job {} already has a running stage",
                self.id
            )));
        }
        let stage = self.stage_mut(idx)?;
        if stage.status != StageStatus::Pending {
            return Err(ScriptorError::InvalidState(format!(
                "stage '{}' is {}, not pending",
                stage.name, stage.status
            )));
        }
        stage.transition(StageStatus::Running)?;
        self.current_stage = Some(idx);
        Ok(())
    }

    /// Returns true when the stage's local percent moved forward.
    pub(crate) fn stage_progress(&mut self, idx: usize, percent: f64) -> bool {
        match self.stage_mut(idx) {
            Ok(stage) => stage.advance(percent),
            Err(_) => false,
        }
    }

    pub(crate) fn note_retry(&mut self, idx: usize, error: &str) -> ScriptorResult<()> {
        let stage = self.stage_mut(idx)?;
        stage.transition(StageStatus::Running)?;
        stage.retries += 1;
        stage.error = Some(error.to_string());
        Ok(())
    }

    pub(crate) fn succeed_stage(&mut self, idx: usize) -> ScriptorResult<()> {
        let stage = self.stage_mut(idx)?;
        stage.transition(StageStatus::Succeeded)?;
        stage.percent = 100.0;
        stage.error = None;
        Ok(())
    }

    pub(crate) fn skip_stage(&mut self, idx: usize, error: &str) -> ScriptorResult<()> {
        let stage = self.stage_mut(idx)?;
        stage.transition(StageStatus::Skipped)?;
        stage.error = Some(error.to_string());
        Ok(())
    }

    /// Fail stage `idx`, which fails the job with the same error detail.
    pub(crate) fn fail_stage(&mut self, idx: usize, error: &str) -> ScriptorResult<()> {
        let stage = self.stage_mut(idx)?;
        stage.transition(StageStatus::Failed)?;
        stage.error = Some(error.to_string());
        self.error = Some(error.to_string());
        Ok(())
    }

    /// Resolve a stage whose last attempt ended after cancellation was requested,
    /// then mark the job cancelled. No job-level error is recorded.
    ///
    /// The stage ends `Failed` even when optional: it keeps only the progress it
    /// actually made.
    pub(crate) fn interrupt_stage(&mut self, idx: usize, error: &str) -> ScriptorResult<()> {
        let stage = self.stage_mut(idx)?;
        stage.transition(StageStatus::Failed)?;
        stage.error = Some(error.to_string());
        self.cancelled = true;
        Ok(())
    }

    /// Record stage `idx` as succeeded and the job as cancelled in one step,
    /// used when cancellation is observed as the final stage hands off.
    pub(crate) fn cancel_after_stage(&mut self, idx: usize) -> ScriptorResult<()> {
        self.succeed_stage(idx)?;
        self.cancelled = true;
        Ok(())
    }

    /// Fail whatever stage is current (or the first unresolved one) with `reason`.
    pub(crate) fn abort(&mut self, reason: &str) -> ScriptorResult<()> {
        self.ensure_active()?;
        let idx = self
            .stages
            .iter()
            .position(|s| s.status == StageStatus::Running)
            .or_else(|| self.stages.iter().position(|s| !s.status.is_resolved()));
        let Some(idx) = idx else {
            return Err(ScriptorError::InvalidState(format!(
                "job {} has no stage left to abort",
                self.id
            )));
        };
        if self.stages[idx].status == StageStatus::Pending {
            self.stages[idx].transition(StageStatus::Running)?;
        }
        self.fail_stage(idx, reason)
    }
}

/// Real-time progress event for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Strictly increasing per job, starting at 1.
    pub seq: u64,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub stage_status: Option<StageStatus>,
    pub stage_percent: f64,
    pub aggregate_percent: f64,
    pub message: String,
    /// Error detail carried by the final event of a failed job.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-stage line of a [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    pub percent: f64,
}

/// Answer to a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub job_id: JobId,
    pub profile: String,
    pub status: JobStatus,
    pub stages: Vec<StageReport>,
    pub aggregate_percent: f64,
    pub artifacts: Vec<Artifact>,
    pub error: Option<String>,
}

impl From<&Job> for StatusReport {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            profile: job.profile.clone(),
            status: job.status(),
            stages: job
                .stages
                .iter()
                .map(|s| StageReport {
                    name: s.name.clone(),
                    status: s.status,
                    percent: s.percent,
                })
                .collect(),
            aggregate_percent: job.progress,
            artifacts: job.artifacts.clone(),
            error: job.error.clone(),
        }
    }
}

/// Compact listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub profile: String,
    pub status: JobStatus,
    pub progress: f64,
    pub current_stage: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            profile: job.profile.clone(),
            status: job.status(),
            progress: job.progress,
            current_stage: job
                .current_stage
                .and_then(|idx| job.stages.get(idx))
                .map(|s| s.name.clone()),
            created_at: job.created_at,
        }
    }
}

/// Point-in-time counts across all known jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub capacity: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl EngineStats {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.failed + self.cancelled
    }

    pub(crate) fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

/// How the title of the generated document is phrased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleStyle {
    #[default]
    Descriptive,
    Question,
    HowTo,
    Listicle,
}

/// How much research the pipeline should do before drafting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDepth {
    Light,
    #[default]
    Standard,
    Deep,
}

/// Typed creation parameters for document jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub theme: String,
    #[serde(default)]
    pub title_style: TitleStyle,
    #[serde(default)]
    pub research_depth: ResearchDepth,
}

impl DocumentRequest {
    pub fn new(theme: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            title_style: TitleStyle::default(),
            research_depth: ResearchDepth::default(),
        }
    }

    pub fn with_title_style(mut self, style: TitleStyle) -> Self {
        self.title_style = style;
        self
    }

    pub fn with_research_depth(mut self, depth: ResearchDepth) -> Self {
        self.research_depth = depth;
        self
    }

    /// Built-in profile matching the requested depth.
    pub fn suggested_profile(&self) -> &'static str {
        match self.research_depth {
            ResearchDepth::Deep => "thorough",
            ResearchDepth::Light | ResearchDepth::Standard => "express",
        }
    }

    /// The opaque params payload submitted with a job.
    pub fn to_params(&self) -> ScriptorResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
