use crate::ScriptorResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Opaque handle returned by an [`ArtifactStore`]; the only way to fetch content back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactHandle(String);

impl ArtifactHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// A fresh random handle.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for a persisted stage or job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub job_id: Uuid,
    pub handle: ArtifactHandle,
    /// Format tag, e.g. `markdown` or `json`.
    pub format: String,
    /// Content length in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the content.
    pub digest: String,
    /// Stage that produced the content, filled in by the orchestrator.
    #[serde(default)]
    pub stage: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Describe `payload` as stored under `handle`.
    pub fn describe(
        job_id: Uuid,
        handle: ArtifactHandle,
        format: impl Into<String>,
        payload: &[u8],
    ) -> Self {
        Self {
            job_id,
            handle,
            format: format.into(),
            size: payload.len() as u64,
            digest: content_digest(payload),
            stage: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// True when `payload` matches the recorded size and digest.
    pub fn verify(&self, payload: &[u8]) -> bool {
        payload.len() as u64 == self.size && content_digest(payload) == self.digest
    }
}

/// Lowercase hex SHA-256 of `payload`.
pub fn content_digest(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Storage capability for stage and job output.
///
/// The orchestrator never assumes a backing format: in-memory and file-backed
/// implementations live in `scriptor-builtins`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `payload` for `job_id` and return its metadata, including the handle.
    async fn store(&self, job_id: Uuid, payload: Vec<u8>, format: &str)
        -> ScriptorResult<Artifact>;

    /// Fetch the content stored under `handle`.
    ///
    /// Fails with [`ScriptorError::ArtifactNotFound`](crate::ScriptorError::ArtifactNotFound)
    /// for unknown handles.
    async fn fetch(&self, handle: &ArtifactHandle) -> ScriptorResult<Vec<u8>>;
}
