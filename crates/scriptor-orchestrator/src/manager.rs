use crate::admission::AdmissionQueue;
use crate::agent::AgentRegistry;
use crate::broadcaster::{EventBroadcaster, EventStream};
use crate::config::EngineConfig;
use crate::profiles::ProfileRegistry;
use crate::runner::{JobEntry, SharedJob, StageRunner};
use crate::types::{DocumentRequest, EngineStats, Job, JobId, JobSummary, StatusReport};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use scriptor_core::{Artifact, ArtifactHandle, ArtifactStore, ScriptorError, ScriptorResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns the job lifecycle: submission, capacity-gated admission, queries,
/// cancellation and purge.
///
/// Cheap to clone; clones share the same registry and workers. Methods that
/// may admit a job (`submit`, and slot release when a job ends) spawn onto
/// the current Tokio runtime.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

struct Inner {
    profiles: ProfileRegistry,
    runner: StageRunner,
    broadcaster: Arc<EventBroadcaster>,
    store: Arc<dyn ArtifactStore>,
    jobs: RwLock<HashMap<JobId, SharedJob>>,
    // Lock order: admission, then jobs, then a single job entry.
    admission: Mutex<AdmissionQueue>,
    progress_min_delta: f64,
}

impl JobManager {
    /// Build a manager over an explicit profile registry.
    ///
    /// Fails with a config error if the settings are invalid or a stage names
    /// an agent kind that `agents` does not provide.
    pub fn new(
        config: &EngineConfig,
        profiles: ProfileRegistry,
        agents: AgentRegistry,
        store: Arc<dyn ArtifactStore>,
    ) -> ScriptorResult<Self> {
        config.validate()?;
        if profiles.is_empty() {
            return Err(ScriptorError::Config("no workflow profiles registered".into()));
        }
        agents.ensure_covers(&profiles)?;

        let broadcaster = Arc::new(EventBroadcaster::new());
        let runner = StageRunner::new(Arc::new(agents), Arc::clone(&store), Arc::clone(&broadcaster));

        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            profiles = ?profiles.names(),
            "Job manager ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                profiles,
                runner,
                broadcaster,
                store,
                jobs: RwLock::new(HashMap::new()),
                admission: Mutex::new(AdmissionQueue::new(config.max_concurrent_jobs)),
                progress_min_delta: config.progress_min_delta,
            }),
        })
    }

    /// Build a manager whose profiles come from `config` (built-ins merged with configured ones).
    pub fn from_config(
        config: &EngineConfig,
        agents: AgentRegistry,
        store: Arc<dyn ArtifactStore>,
    ) -> ScriptorResult<Self> {
        let profiles = config.profile_registry()?;
        Self::new(config, profiles, agents, store)
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.inner.profiles
    }

    /// Create a `Queued` job and try to admit it.
    ///
    /// Unknown profiles and invalid params are rejected before any job exists.
    pub fn submit(&self, profile: &str, params: serde_json::Value) -> ScriptorResult<JobId> {
        let profile = self.inner.profiles.resolve(profile)?;
        profile.validate_params(&params)?;

        let job = Job::new(&profile, params);
        let job_id = job.id;
        let mut entry = JobEntry::new(job, Arc::clone(&profile), self.inner.progress_min_delta);
        self.inner.broadcaster.register(job_id);
        entry.emit_transition(&self.inner.broadcaster, None, "Job queued");

        {
            let mut queue = self.inner.admission.lock();
            self.inner
                .jobs
                .write()
                .insert(job_id, Arc::new(Mutex::new(entry)));
            queue.enqueue(job_id);
        }
        info!(job_id = %job_id, profile = %profile.name, "Job submitted");

        self.inner.pump();
        Ok(job_id)
    }

    /// Submit a document job from typed params.
    pub fn submit_document(&self, profile: &str, request: &DocumentRequest) -> ScriptorResult<JobId> {
        self.submit(profile, request.to_params()?)
    }

    /// Full snapshot of a job.
    pub fn get(&self, job_id: JobId) -> ScriptorResult<Job> {
        let shared = self.entry(job_id)?;
        let entry = shared.lock();
        Ok(entry.job.clone())
    }

    pub fn status(&self, job_id: JobId) -> ScriptorResult<StatusReport> {
        let shared = self.entry(job_id)?;
        let entry = shared.lock();
        Ok(StatusReport::from(&entry.job))
    }

    /// Live progress stream: the last event first, then every later one,
    /// ending after the terminal event.
    pub fn subscribe(&self, job_id: JobId) -> ScriptorResult<EventStream> {
        self.entry(job_id)?;
        self.inner
            .broadcaster
            .subscribe(job_id)
            .ok_or(ScriptorError::JobNotFound(job_id))
    }

    /// Request cancellation. Idempotent; a no-op for terminal jobs.
    ///
    /// A queued job is cancelled on the spot and never runs. A running job
    /// stops at its next stage boundary.
    pub fn cancel(&self, job_id: JobId) -> ScriptorResult<()> {
        let shared = self.entry(job_id)?;
        let mut queue = self.inner.admission.lock();
        let mut entry = shared.lock();

        if entry.job.is_terminal() {
            debug!(job_id = %job_id, status = %entry.job.status(), "Cancel ignored for finished job");
            return Ok(());
        }
        if queue.withdraw(job_id) {
            drop(queue);
            if entry.job.mark_cancelled().is_ok() {
                entry.emit_transition(&self.inner.broadcaster, None, "Job cancelled before start");
            }
            info!(job_id = %job_id, "Queued job cancelled");
            return Ok(());
        }
        drop(queue);
        if entry.request_cancel() {
            info!(job_id = %job_id, "Cancellation requested");
        }
        Ok(())
    }

    /// Queued and running jobs, oldest first, as of the call.
    pub fn list_active(&self) -> impl Iterator<Item = JobSummary> {
        self.summaries()
            .into_iter()
            .filter(|summary| !summary.status.is_terminal())
    }

    /// Every known job, oldest first, as of the call.
    pub fn list_all(&self) -> impl Iterator<Item = JobSummary> {
        self.summaries().into_iter()
    }

    pub async fn download(&self, handle: &ArtifactHandle) -> ScriptorResult<Vec<u8>> {
        self.inner.store.fetch(handle).await
    }

    /// The final artifact of a completed job.
    pub fn final_artifact(&self, job_id: JobId) -> ScriptorResult<Artifact> {
        let job = self.get(job_id)?;
        job.final_artifact().cloned().ok_or_else(|| {
            ScriptorError::InvalidState(format!(
                "job {job_id} has no final artifact (status {})",
                job.status()
            ))
        })
    }

    /// Resolve once the job is terminal and return its final snapshot.
    pub async fn wait(&self, job_id: JobId) -> ScriptorResult<Job> {
        let mut events = self.subscribe(job_id)?;
        while let Some(event) = events.next().await {
            if event.is_terminal() {
                break;
            }
        }
        self.get(job_id)
    }

    /// Forget a terminal job and its event channel. Stored artifacts are left to the store.
    pub fn purge(&self, job_id: JobId) -> ScriptorResult<Job> {
        let shared = self.entry(job_id)?;
        let job = {
            let entry = shared.lock();
            if !entry.job.is_terminal() {
                return Err(ScriptorError::InvalidState(format!(
                    "job {job_id} is still {}",
                    entry.job.status()
                )));
            }
            entry.job.clone()
        };
        self.inner.jobs.write().remove(&job_id);
        self.inner.broadcaster.remove(job_id);
        info!(job_id = %job_id, "Job purged");
        Ok(job)
    }

    /// 0-based place of a queued job in the admission line.
    pub fn queue_position(&self, job_id: JobId) -> Option<usize> {
        self.inner.admission.lock().position(job_id)
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            capacity: self.inner.admission.lock().capacity(),
            ..EngineStats::default()
        };
        for shared in self.snapshot() {
            let status = shared.lock().job.status();
            stats.count(status);
        }
        stats
    }

    fn entry(&self, job_id: JobId) -> ScriptorResult<SharedJob> {
        self.inner
            .jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(ScriptorError::JobNotFound(job_id))
    }

    fn snapshot(&self) -> Vec<SharedJob> {
        self.inner.jobs.read().values().cloned().collect()
    }

    fn summaries(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .snapshot()
            .iter()
            .map(|shared| JobSummary::from(&shared.lock().job))
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Admit queued jobs while slots are free, one worker task per admitted job.
    fn pump(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime available, queued jobs stay queued");
            return;
        };
        loop {
            let (job_id, shared) = {
                let mut queue = self.admission.lock();
                let Some(job_id) = queue.admit_next() else {
                    break;
                };
                let Some(shared) = self.jobs.read().get(&job_id).cloned() else {
                    queue.release(job_id);
                    continue;
                };
                let mut entry = shared.lock();
                if let Err(e) = entry.job.admit() {
                    warn!(job_id = %job_id, error = %e, "Job not admitted");
                    drop(entry);
                    queue.release(job_id);
                    continue;
                }
                entry.emit_transition(&self.broadcaster, None, "Job admitted");
                drop(entry);
                info!(
                    job_id = %job_id,
                    running = queue.running_count(),
                    waiting = queue.waiting_count(),
                    "Job admitted"
                );
                (job_id, shared)
            };

            // Owned by the task from the start, so a task dropped before its
            // first poll still frees the slot.
            let slot = SlotGuard {
                inner: Arc::clone(self),
                job_id,
                shared,
            };
            runtime.spawn(async move {
                slot.inner.runner.run(&slot.shared).await;
            });
        }
    }
}

/// Holds a job's execution slot; dropping it frees the slot and admits the next job.
struct SlotGuard {
    inner: Arc<Inner>,
    job_id: JobId,
    shared: SharedJob,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut entry = self.shared.lock();
            if !entry.job.is_terminal() {
                warn!(job_id = %self.job_id, "Worker ended before the job finished");
                if entry.job.abort("worker terminated unexpectedly").is_ok() {
                    entry.emit_transition(&self.inner.broadcaster, None, "Job failed");
                }
            }
        }
        self.inner.admission.lock().release(self.job_id);
        self.inner.pump();
    }
}
