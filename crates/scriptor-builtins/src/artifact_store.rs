use async_trait::async_trait;
use scriptor_core::{Artifact, ArtifactHandle, ArtifactStore, ScriptorError, ScriptorResult};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory artifact store for testing and short-lived orchestration runs.
pub struct InMemoryArtifactStore {
    store: RwLock<HashMap<ArtifactHandle, (Artifact, Vec<u8>)>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
        }
    }

    /// Metadata of every stored artifact, oldest first.
    pub async fn list(&self) -> Vec<Artifact> {
        let store = self.store.read().await;
        let mut entries: Vec<Artifact> = store.values().map(|(meta, _)| meta.clone()).collect();
        entries.sort_by_key(|a| a.created_at);
        entries
    }

    /// Metadata of the artifacts stored for one job.
    pub async fn list_for_job(&self, job_id: Uuid) -> Vec<Artifact> {
        self.list()
            .await
            .into_iter()
            .filter(|a| a.job_id == job_id)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn store(
        &self,
        job_id: Uuid,
        payload: Vec<u8>,
        format: &str,
    ) -> ScriptorResult<Artifact> {
        let handle = ArtifactHandle::generate();
        let artifact = Artifact::describe(job_id, handle.clone(), format, &payload);
        let mut store = self.store.write().await;
        store.insert(handle, (artifact.clone(), payload));
        tracing::debug!(job_id = %job_id, handle = %artifact.handle, size = artifact.size, "Artifact stored in memory");
        Ok(artifact)
    }

    async fn fetch(&self, handle: &ArtifactHandle) -> ScriptorResult<Vec<u8>> {
        let store = self.store.read().await;
        store
            .get(handle)
            .map(|(_, content)| content.clone())
            .ok_or_else(|| ScriptorError::ArtifactNotFound(handle.to_string()))
    }
}
