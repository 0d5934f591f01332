use async_trait::async_trait;
use scriptor_core::{Artifact, ArtifactHandle, ArtifactStore, ScriptorError, ScriptorResult};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File-based artifact store: one content file plus a JSON metadata sidecar
/// per artifact, flat under a single directory.
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    pub async fn new(dir: impl Into<PathBuf>) -> ScriptorResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn content_path(&self, handle: &ArtifactHandle) -> PathBuf {
        self.dir.join(format!("{handle}.bin"))
    }

    fn meta_path(&self, handle: &ArtifactHandle) -> PathBuf {
        self.dir.join(format!("{handle}.json"))
    }

    /// Handles are generated UUIDs; anything else cannot name a file we wrote.
    fn check_handle(handle: &ArtifactHandle) -> ScriptorResult<()> {
        Uuid::parse_str(handle.as_str())
            .map(|_| ())
            .map_err(|_| ScriptorError::ArtifactNotFound(handle.to_string()))
    }

    /// Read back the metadata sidecar for `handle`.
    pub async fn metadata(&self, handle: &ArtifactHandle) -> ScriptorResult<Artifact> {
        Self::check_handle(handle)?;
        let path = self.meta_path(handle);
        if !path.exists() {
            return Err(ScriptorError::ArtifactNotFound(handle.to_string()));
        }
        let data = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&data)
            .map_err(|e| ScriptorError::Artifact(format!("Failed to parse artifact metadata: {e}")))
    }

    /// Metadata of every artifact in the directory, oldest first.
    pub async fn list(&self) -> ScriptorResult<Vec<Artifact>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            match self.metadata(&ArtifactHandle::new(stem)).await {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => tracing::warn!(file = %name, error = %e, "Skipping unreadable artifact metadata"),
            }
        }
        artifacts.sort_by_key(|a| a.created_at);
        Ok(artifacts)
    }

    /// Remove an artifact's content and metadata. Missing files are not an error.
    pub async fn delete(&self, handle: &ArtifactHandle) -> ScriptorResult<()> {
        Self::check_handle(handle)?;
        for path in [self.content_path(handle), self.meta_path(handle)] {
            if path.exists() {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn store(
        &self,
        job_id: Uuid,
        payload: Vec<u8>,
        format: &str,
    ) -> ScriptorResult<Artifact> {
        let handle = ArtifactHandle::generate();
        let artifact = Artifact::describe(job_id, handle.clone(), format, &payload);

        // Sidecar last: its presence implies the content file exists.
        tokio::fs::write(self.content_path(&handle), &payload).await?;
        let meta = serde_json::to_string_pretty(&artifact)?;
        tokio::fs::write(self.meta_path(&handle), meta).await?;

        tracing::debug!(
            job_id = %job_id,
            handle = %handle,
            size = artifact.size,
            dir = %self.dir.display(),
            "Artifact written"
        );
        Ok(artifact)
    }

    async fn fetch(&self, handle: &ArtifactHandle) -> ScriptorResult<Vec<u8>> {
        Self::check_handle(handle)?;
        let path = self.content_path(handle);
        if !path.exists() {
            return Err(ScriptorError::ArtifactNotFound(handle.to_string()));
        }
        Ok(tokio::fs::read(path).await?)
    }
}
