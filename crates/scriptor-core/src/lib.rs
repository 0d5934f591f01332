//! Core types and error definitions for the Scriptor framework.
//!
//! This crate provides the foundational types shared across all Scriptor crates:
//! the error taxonomy, the artifact model and the storage capability that the
//! orchestration engine hands finished output to.
//!
//! # Main types
//!
//! - [`ScriptorError`] — Unified error enum for all Scriptor subsystems.
//! - [`ScriptorResult`] — Convenience alias for `Result<T, ScriptorError>`.
//! - [`Artifact`] — Metadata for a persisted stage or job output.
//! - [`ArtifactHandle`] — Opaque handle used to fetch stored content.
//! - [`ArtifactStore`] — Storage capability consumed by the orchestrator.

/// Artifact model and the storage capability trait.
pub mod artifact;
/// Error taxonomy.
pub mod error;
/// Tracing subscriber initialisation.
pub mod telemetry;

pub use artifact::{content_digest, Artifact, ArtifactHandle, ArtifactStore};
pub use error::{ScriptorError, ScriptorResult};
pub use telemetry::{init_tracing, LogFormat};
