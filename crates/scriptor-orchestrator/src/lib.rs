//! Job orchestration engine for staged document-generation pipelines.
//!
//! A job runs the stages of a [`WorkflowProfile`] strictly in order, each
//! stage executed by an [`Agent`]. At most `max_concurrent_jobs` jobs run at
//! once; the rest wait in FIFO order. Progress is aggregated by stage weight
//! into a monotonic percentage and fanned out to subscribers as
//! [`ProgressEvent`]s, with the last event replayed to late subscribers.
//!
//! # Main types
//!
//! - [`JobManager`] — Submission, admission, queries, cancellation and purge.
//! - [`ProfileRegistry`] — Immutable catalogue of workflow profiles.
//! - [`AgentRegistry`] — Agent implementations by kind.
//! - [`EventBroadcaster`] — Per-job event fan-out with replay.
//! - [`EngineConfig`] — TOML-backed engine settings.

/// FIFO admission control.
pub mod admission;
/// Agent capability trait, stage I/O and the agent registry.
pub mod agent;
/// Per-job progress event fan-out.
pub mod broadcaster;
/// Engine configuration.
pub mod config;
/// Job lifecycle management.
pub mod manager;
/// Workflow profiles and their registry.
pub mod profiles;
/// Weighted progress aggregation and event sequencing.
pub mod progress;
mod runner;
/// Job, stage and event data model.
pub mod types;

pub use admission::AdmissionQueue;
pub use agent::{
    agent_fn, Agent, AgentRegistry, CancelSignal, FnAgent, ProgressReporter, ProgressUpdate,
    StageContext, StageInput, StageOutput,
};
pub use broadcaster::{EventBroadcaster, EventStream};
pub use config::EngineConfig;
pub use manager::JobManager;
pub use profiles::{default_profiles, ProfileRegistry, RetryPolicy, StageTemplate, WorkflowProfile};
pub use progress::{aggregate_percent, ProgressTracker};
pub use types::{
    DocumentRequest, EngineStats, Job, JobId, JobStatus, JobSummary, ProgressEvent, ResearchDepth,
    Stage, StageReport, StageStatus, StatusReport, TitleStyle,
};
