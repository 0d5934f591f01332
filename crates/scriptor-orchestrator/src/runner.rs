use crate::agent::{
    AgentRegistry, CancelSignal, ProgressReporter, ProgressUpdate, StageContext, StageInput,
    StageOutput,
};
use crate::broadcaster::EventBroadcaster;
use crate::profiles::{StageTemplate, WorkflowProfile};
use crate::progress::ProgressTracker;
use crate::types::{Job, JobId};
use chrono::Utc;
use parking_lot::Mutex;
use scriptor_core::{Artifact, ArtifactStore, ScriptorError, ScriptorResult};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// A job plus everything needed to drive and observe it. Guarded by one lock.
pub(crate) struct JobEntry {
    pub(crate) job: Job,
    pub(crate) profile: Arc<WorkflowProfile>,
    pub(crate) tracker: ProgressTracker,
    pub(crate) cancel: watch::Sender<bool>,
}

pub(crate) type SharedJob = Arc<Mutex<JobEntry>>;

impl JobEntry {
    pub(crate) fn new(job: Job, profile: Arc<WorkflowProfile>, min_delta: f64) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            job,
            profile,
            tracker: ProgressTracker::new(min_delta),
            cancel,
        }
    }

    /// Publish the current state after a status change.
    pub(crate) fn emit_transition(
        &mut self,
        bus: &EventBroadcaster,
        stage: Option<usize>,
        message: impl Into<String>,
    ) {
        if self.job.is_terminal() && self.job.finished_at.is_none() {
            self.job.finished_at = Some(Utc::now());
        }
        if let Some(event) = self.tracker.on_transition(&mut self.job, stage, message) {
            bus.publish(event);
        }
    }

    fn emit_progress(&mut self, bus: &EventBroadcaster, stage: usize, message: String) {
        if let Some(event) = self.tracker.on_progress(&mut self.job, stage, message) {
            bus.publish(event);
        }
    }

    /// Request cooperative cancellation of a running job.
    pub(crate) fn request_cancel(&mut self) -> bool {
        if self.job.cancel_requested {
            return false;
        }
        self.job.cancel_requested = true;
        self.cancel.send_replace(true);
        true
    }
}

enum StageOutcome {
    Succeeded(StageOutput),
    /// Every attempt failed; carries the last error.
    Exhausted(ScriptorError),
    /// Cancellation was observed after a failed attempt.
    Interrupted(ScriptorError),
}

/// Executes a job's stages strictly in order, one at a time.
pub(crate) struct StageRunner {
    agents: Arc<AgentRegistry>,
    store: Arc<dyn ArtifactStore>,
    broadcaster: Arc<EventBroadcaster>,
}

impl StageRunner {
    pub(crate) fn new(
        agents: Arc<AgentRegistry>,
        store: Arc<dyn ArtifactStore>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            agents,
            store,
            broadcaster,
        }
    }

    /// Drive an admitted job until it reaches a terminal status.
    pub(crate) async fn run(&self, shared: &SharedJob) {
        let start = Instant::now();
        let (job_id, profile, params, cancel) = {
            let entry = shared.lock();
            (
                entry.job.id,
                Arc::clone(&entry.profile),
                entry.job.params.clone(),
                CancelSignal::new(entry.cancel.subscribe()),
            )
        };
        let stage_count = profile.stages.len();
        let mut payload = params.clone();

        info!(job_id = %job_id, profile = %profile.name, stages = stage_count, "Job started");

        for (idx, template) in profile.stages.iter().enumerate() {
            {
                let mut entry = shared.lock();
                if entry.job.cancel_requested {
                    if entry.job.mark_cancelled().is_ok() {
                        entry.emit_transition(&self.broadcaster, None, "Job cancelled");
                    }
                    info!(job_id = %job_id, stage = %template.name, "Cancellation observed at stage boundary");
                    break;
                }
                if let Err(e) = entry.job.begin_stage(idx) {
                    error!(job_id = %job_id, stage = %template.name, error = %e, "Cannot start stage");
                    break;
                }
                entry.emit_transition(
                    &self.broadcaster,
                    Some(idx),
                    format!("Stage '{}' started", template.name),
                );
            }
            info!(job_id = %job_id, stage = %template.name, position = idx, "Stage started");

            let input = StageInput {
                job_id,
                stage: template.name.clone(),
                position: idx,
                attempt: 0,
                params: params.clone(),
                payload: payload.clone(),
            };
            let stage_start = Instant::now();

            match self.run_stage(shared, idx, template, input, &cancel).await {
                StageOutcome::Succeeded(output) => {
                    let is_final = idx + 1 == stage_count;
                    match self
                        .complete_stage(shared, &profile, idx, is_final, output)
                        .await
                    {
                        Some(next) => payload = next,
                        None => break,
                    }
                    info!(
                        job_id = %job_id,
                        stage = %template.name,
                        duration_ms = stage_start.elapsed().as_millis() as u64,
                        "Stage succeeded"
                    );
                }
                StageOutcome::Exhausted(err) if template.optional => {
                    warn!(job_id = %job_id, stage = %template.name, error = %err, "Optional stage skipped");
                    let mut entry = shared.lock();
                    if let Err(e) = entry.job.skip_stage(idx, &err.to_string()) {
                        error!(job_id = %job_id, stage = %template.name, error = %e, "Cannot skip stage");
                        break;
                    }
                    entry.emit_transition(
                        &self.broadcaster,
                        Some(idx),
                        format!("Stage '{}' skipped", template.name),
                    );
                }
                StageOutcome::Exhausted(err) => {
                    error!(job_id = %job_id, stage = %template.name, error = %err, "Stage failed");
                    let mut entry = shared.lock();
                    if entry.job.fail_stage(idx, &err.to_string()).is_ok() {
                        entry.emit_transition(
                            &self.broadcaster,
                            Some(idx),
                            format!("Stage '{}' failed", template.name),
                        );
                    }
                    break;
                }
                StageOutcome::Interrupted(err) => {
                    let mut entry = shared.lock();
                    if entry.job.interrupt_stage(idx, &err.to_string()).is_ok() {
                        entry.emit_transition(&self.broadcaster, Some(idx), "Job cancelled");
                    }
                    info!(job_id = %job_id, stage = %template.name, "Cancellation observed during stage");
                    break;
                }
            }
        }

        let status = shared.lock().job.status();
        info!(
            job_id = %job_id,
            status = %status,
            duration_ms = start.elapsed().as_millis() as u64,
            "Job finished"
        );
    }

    /// Attempt a stage until it succeeds, runs out of retries or is cancelled.
    async fn run_stage(
        &self,
        shared: &SharedJob,
        idx: usize,
        template: &StageTemplate,
        mut input: StageInput,
        cancel: &CancelSignal,
    ) -> StageOutcome {
        loop {
            let attempt = input.attempt;
            let err = match self
                .attempt(shared, idx, template, input.clone(), cancel.clone())
                .await
            {
                Ok(output) => return StageOutcome::Succeeded(output),
                Err(err) => err,
            };

            if cancel.is_cancelled() {
                return StageOutcome::Interrupted(err);
            }
            if attempt >= template.retry.max_retries {
                return StageOutcome::Exhausted(err);
            }

            let delay = template.retry.backoff(attempt);
            warn!(
                job_id = %input.job_id,
                stage = %template.name,
                attempt = attempt + 1,
                max_retries = template.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Stage attempt failed, retrying after backoff"
            );
            if let Err(e) = shared.lock().job.note_retry(idx, &err.to_string()) {
                warn!(job_id = %input.job_id, error = %e, "Cannot record retry");
            }

            let mut signal = cancel.clone();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = signal.cancelled() => return StageOutcome::Interrupted(err),
            }
            input.attempt += 1;
        }
    }

    /// One agent invocation, bounded by an inactivity timeout that resets
    /// whenever the stage's percent moves forward.
    async fn attempt(
        &self,
        shared: &SharedJob,
        idx: usize,
        template: &StageTemplate,
        input: StageInput,
        cancel: CancelSignal,
    ) -> ScriptorResult<StageOutput> {
        let agent = self.agents.get(template.agent_kind()).ok_or_else(|| {
            ScriptorError::Config(format!(
                "no agent registered for '{}'",
                template.agent_kind()
            ))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = StageContext::new(ProgressReporter::new(tx), cancel);
        let timeout = template.timeout();

        let run = agent.run(input, ctx);
        tokio::pin!(run);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(update) = rx.recv() => {
                    // Repeated or lower values are not progress.
                    if self.apply_progress(shared, idx, update) {
                        deadline.as_mut().reset(tokio::time::Instant::now() + timeout);
                    }
                }
                () = &mut deadline => {
                    break Err(ScriptorError::StageTimeout {
                        stage: template.name.clone(),
                        timeout_ms: template.timeout_ms,
                    });
                }
            }
        };

        // Updates sent before the attempt ended still count.
        rx.close();
        while let Ok(update) = rx.try_recv() {
            let _ = self.apply_progress(shared, idx, update);
        }
        result
    }

    /// Returns true when the update raised the stage's percent.
    fn apply_progress(&self, shared: &SharedJob, idx: usize, update: ProgressUpdate) -> bool {
        let mut entry = shared.lock();
        if !entry.job.stage_progress(idx, update.percent) {
            return false;
        }
        let message = match update.message {
            Some(message) => message,
            None => {
                let stage = &entry.job.stages[idx];
                format!("Stage '{}' at {:.0}%", stage.name, stage.percent)
            }
        };
        entry.emit_progress(&self.broadcaster, idx, message);
        true
    }

    /// Persist output where required and mark the stage succeeded.
    ///
    /// Returns the payload for the next stage, or `None` once the job is terminal
    /// for a reason other than normal completion.
    async fn complete_stage(
        &self,
        shared: &SharedJob,
        profile: &WorkflowProfile,
        idx: usize,
        is_final: bool,
        output: StageOutput,
    ) -> Option<serde_json::Value> {
        let template = &profile.stages[idx];
        let (job_id, cancel_requested) = {
            let entry = shared.lock();
            (entry.job.id, entry.job.cancel_requested)
        };
        // A cancelled job never hands over its final artifact.
        let discard = is_final && cancel_requested;

        let mut artifact = None;
        if (is_final || template.persist_output) && !discard {
            let format = output.format.clone().unwrap_or_else(|| {
                if is_final {
                    profile.artifact_format.clone()
                } else {
                    output.default_format().to_string()
                }
            });
            match self.persist(job_id, &output, &format).await {
                Ok(stored) => artifact = Some(stored.with_stage(&template.name)),
                Err(err) if is_final => {
                    error!(job_id = %job_id, stage = %template.name, error = %err, "Final artifact not stored");
                    let mut entry = shared.lock();
                    let detail = format!("artifact store failed: {err}");
                    if entry.job.fail_stage(idx, &detail).is_ok() {
                        entry.emit_transition(
                            &self.broadcaster,
                            Some(idx),
                            format!("Stage '{}' failed", template.name),
                        );
                    }
                    return None;
                }
                Err(err) => {
                    warn!(job_id = %job_id, stage = %template.name, error = %err, "Intermediate artifact not stored");
                }
            }
        }

        let mut entry = shared.lock();
        if let Some(artifact) = artifact {
            debug!(job_id = %job_id, handle = %artifact.handle, stage = %template.name, "Artifact attached");
            entry.job.artifacts.push(artifact);
        }

        if discard {
            if entry.job.cancel_after_stage(idx).is_ok() {
                entry.emit_transition(&self.broadcaster, Some(idx), "Job cancelled");
            }
            info!(job_id = %job_id, "Cancellation observed at final hand-off, output discarded");
            return None;
        }

        if let Err(e) = entry.job.succeed_stage(idx) {
            error!(job_id = %job_id, stage = %template.name, error = %e, "Cannot complete stage");
            return None;
        }
        let message = if is_final {
            "Job completed".to_string()
        } else {
            format!("Stage '{}' succeeded", template.name)
        };
        entry.emit_transition(&self.broadcaster, Some(idx), message);
        Some(output.payload)
    }

    async fn persist(
        &self,
        job_id: JobId,
        output: &StageOutput,
        format: &str,
    ) -> ScriptorResult<Artifact> {
        let bytes = output.to_bytes()?;
        self.store.store(job_id, bytes, format).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::agent_fn;
    use crate::profiles::RetryPolicy;
    use crate::types::{JobStatus, StageStatus};
    use futures_util::StreamExt;
    use scriptor_builtins::InMemoryArtifactStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn quick() -> RetryPolicy {
        RetryPolicy::new(2, 1, 5)
    }

    fn setup(
        stages: Vec<StageTemplate>,
        agents: AgentRegistry,
    ) -> (StageRunner, SharedJob, Arc<EventBroadcaster>, Arc<InMemoryArtifactStore>) {
        let profile = Arc::new(WorkflowProfile::new("test", stages));
        let mut job = Job::new(&profile, json!({"theme": "lighthouses"}));
        job.admit().unwrap();
        let bus = Arc::new(EventBroadcaster::new());
        bus.register(job.id);
        let store = Arc::new(InMemoryArtifactStore::new());
        let runner = StageRunner::new(Arc::new(agents), store.clone(), bus.clone());
        let shared = Arc::new(Mutex::new(JobEntry::new(job, profile, 1.0)));
        (runner, shared, bus, store)
    }

    fn echo(tag: &'static str) -> Arc<dyn crate::agent::Agent> {
        agent_fn(move |input: StageInput, _ctx| async move {
            Ok(StageOutput::new(json!({ "from": tag, "prev": input.payload })))
        })
    }

    #[tokio::test]
    async fn test_runs_stages_in_order_and_stores_artifact() {
        let agents = AgentRegistry::new()
            .with("research", echo("research"))
            .with("write", agent_fn(|_, _| async { Ok(StageOutput::text("# Lighthouses")) }));
        let (runner, shared, _bus, store) = setup(
            vec![StageTemplate::new("research", 50), StageTemplate::new("write", 50)],
            agents,
        );

        runner.run(&shared).await;

        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Completed);
        assert_eq!(entry.job.progress, 100.0);
        let artifact = entry.job.final_artifact().unwrap().clone();
        assert_eq!(artifact.format, "markdown");
        assert!(entry.job.finished_at.is_some());
        drop(entry);
        assert_eq!(store.fetch(&artifact.handle).await.unwrap(), b"# Lighthouses");
    }

    #[tokio::test]
    async fn test_output_feeds_next_stage() {
        let agents = AgentRegistry::new()
            .with("first", echo("first"))
            .with(
                "second",
                agent_fn(|input: StageInput, _| async move {
                    assert_eq!(input.payload["from"], "first");
                    assert_eq!(input.payload["prev"]["theme"], "lighthouses");
                    Ok(StageOutput::text("done"))
                }),
            );
        let (runner, shared, _bus, _store) = setup(
            vec![StageTemplate::new("first", 1), StageTemplate::new("second", 1)],
            agents,
        );
        runner.run(&shared).await;
        assert_eq!(shared.lock().job.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = agent_fn(move |input: StageInput, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if input.attempt < 2 {
                    Err(ScriptorError::stage(&input.stage, "rate limited"))
                } else {
                    Ok(StageOutput::text("ok"))
                }
            }
        });
        let (runner, shared, _bus, _store) = setup(
            vec![StageTemplate::new("only", 1).with_retry(quick())],
            AgentRegistry::new().with("only", flaky),
        );
        runner.run(&shared).await;

        let entry = shared.lock();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(entry.job.status(), JobStatus::Completed);
        assert_eq!(entry.job.stages[0].retries, 2);
    }

    #[tokio::test]
    async fn test_required_stage_fails_job_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let broken = agent_fn(move |input: StageInput, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ScriptorError::stage(&input.stage, format!("attempt {}", input.attempt)))
            }
        });
        let (runner, shared, bus, _store) = setup(
            vec![
                StageTemplate::new("only", 1).with_retry(quick()),
                StageTemplate::new("never", 1),
            ],
            AgentRegistry::new().with("only", broken).with("never", echo("never")),
        );
        runner.run(&shared).await;

        let entry = shared.lock();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(entry.job.status(), JobStatus::Failed);
        assert!(entry.job.error.as_deref().unwrap().contains("attempt 2"));
        assert_eq!(entry.job.stages[1].status, StageStatus::Pending);
        let last = bus.last_event(entry.job.id).unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert!(last.error.is_some());
    }

    #[tokio::test]
    async fn test_optional_stage_passes_input_through() {
        let broken = agent_fn(|input: StageInput, _| async move {
            Err(ScriptorError::stage(&input.stage, "unavailable"))
        });
        let last = agent_fn(|input: StageInput, _| async move {
            assert_eq!(input.payload["from"], "first");
            Ok(StageOutput::text("final"))
        });
        let (runner, shared, _bus, _store) = setup(
            vec![
                StageTemplate::new("first", 1),
                StageTemplate::new("review", 1).optional().with_retry(RetryPolicy::none()),
                StageTemplate::new("build", 1),
            ],
            AgentRegistry::new()
                .with("first", echo("first"))
                .with("review", broken)
                .with("build", last),
        );
        runner.run(&shared).await;

        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Completed);
        assert_eq!(entry.job.stages[1].status, StageStatus::Skipped);
        assert!(entry.job.stages[1].error.is_some());
    }

    #[tokio::test]
    async fn test_inactivity_timeout() {
        let stuck = agent_fn(|_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(StageOutput::text("late"))
        });
        let (runner, shared, _bus, _store) = setup(
            vec![StageTemplate::new("slow", 1)
                .with_timeout(Duration::from_millis(30))
                .with_retry(RetryPolicy::none())],
            AgentRegistry::new().with("slow", stuck),
        );
        runner.run(&shared).await;

        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Failed);
        assert!(entry.job.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_progress_resets_timeout() {
        let chatty = agent_fn(|_, ctx: StageContext| async move {
            for step in 1..=6 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.progress.report(f64::from(step) * 15.0);
            }
            Ok(StageOutput::text("made it"))
        });
        let (runner, shared, _bus, _store) = setup(
            vec![StageTemplate::new("steady", 1)
                .with_timeout(Duration::from_millis(80))
                .with_retry(RetryPolicy::none())],
            AgentRegistry::new().with("steady", chatty),
        );
        runner.run(&shared).await;
        assert_eq!(shared.lock().job.status(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_repeated_progress_does_not_reset_timeout() {
        let stuck = agent_fn(|_, ctx: StageContext| async move {
            for _ in 0..200 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.progress.report(10.0);
            }
            Ok(StageOutput::text("never"))
        });
        let (runner, shared, _bus, _store) = setup(
            vec![StageTemplate::new("stuck", 1)
                .with_timeout(Duration::from_millis(80))
                .with_retry(RetryPolicy::none())],
            AgentRegistry::new().with("stuck", stuck),
        );

        tokio::time::timeout(Duration::from_secs(2), runner.run(&shared))
            .await
            .unwrap();
        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Failed);
        assert!(entry.job.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(entry.job.stages[0].percent, 10.0);
    }

    #[tokio::test]
    async fn test_final_store_failure_fails_job() {
        struct BrokenStore;
        #[async_trait::async_trait]
        impl ArtifactStore for BrokenStore {
            async fn store(
                &self,
                _job_id: JobId,
                _payload: Vec<u8>,
                _format: &str,
            ) -> ScriptorResult<Artifact> {
                Err(ScriptorError::Artifact("disk full".into()))
            }
            async fn fetch(
                &self,
                handle: &scriptor_core::ArtifactHandle,
            ) -> ScriptorResult<Vec<u8>> {
                Err(ScriptorError::ArtifactNotFound(handle.to_string()))
            }
        }

        let profile = Arc::new(WorkflowProfile::new("test", vec![StageTemplate::new("build", 1)]));
        let mut job = Job::new(&profile, json!({}));
        job.admit().unwrap();
        let bus = Arc::new(EventBroadcaster::new());
        let agents = AgentRegistry::new().with("build", echo("build"));
        let runner = StageRunner::new(Arc::new(agents), Arc::new(BrokenStore), bus);
        let shared = Arc::new(Mutex::new(JobEntry::new(job, profile, 1.0)));

        runner.run(&shared).await;
        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Failed);
        assert!(entry.job.error.as_deref().unwrap().contains("disk full"));
        assert!(entry.job.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_intermediate_output() {
        let (runner, shared, _bus, store) = setup(
            vec![
                StageTemplate::new("outline", 1).persisted(),
                StageTemplate::new("build", 1),
            ],
            AgentRegistry::new()
                .with("outline", echo("outline"))
                .with("build", agent_fn(|_, _| async { Ok(StageOutput::text("doc")) })),
        );
        runner.run(&shared).await;

        let entry = shared.lock();
        assert_eq!(entry.job.artifacts.len(), 2);
        assert_eq!(entry.job.artifacts[0].stage.as_deref(), Some("outline"));
        assert_eq!(entry.job.artifacts[0].format, "json");
        drop(entry);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_cancel_at_boundary() {
        let (runner, shared, bus, _store) = setup(
            vec![StageTemplate::new("first", 1), StageTemplate::new("second", 1)],
            AgentRegistry::new().with("first", echo("first")).with("second", echo("second")),
        );
        let job_id = shared.lock().job.id;
        let events = bus.subscribe(job_id).unwrap();
        shared.lock().request_cancel();

        runner.run(&shared).await;

        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Cancelled);
        assert!(entry.job.stages.iter().all(|s| s.status == StageStatus::Pending));
        drop(entry);
        let events: Vec<_> = events.collect().await;
        assert_eq!(events.last().unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let broken = agent_fn(|input: StageInput, _| async move {
            Err(ScriptorError::stage(&input.stage, "down"))
        });
        let (runner, shared, _bus, _store) = setup(
            vec![StageTemplate::new("only", 1).with_retry(RetryPolicy::new(5, 10_000, 10_000))],
            AgentRegistry::new().with("only", broken),
        );
        let canceller = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.lock().request_cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), runner.run(&shared))
            .await
            .unwrap();
        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Cancelled);
        assert!(entry.job.error.is_none());
    }

    /// Agent that signals `entered`, then waits for `release` before returning `result`.
    fn gated(
        entered: Arc<Notify>,
        release: Arc<Notify>,
        calls: Arc<AtomicU32>,
        fail: bool,
    ) -> Arc<dyn crate::agent::Agent> {
        agent_fn(move |input: StageInput, _| {
            let entered = entered.clone();
            let release = release.clone();
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                entered.notify_one();
                release.notified().await;
                if fail {
                    Err(ScriptorError::stage(&input.stage, "lost connection"))
                } else {
                    Ok(StageOutput::text("# Finished"))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_cancel_observed_at_final_handoff() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        let (runner, shared, bus, store) = setup(
            vec![StageTemplate::new("build", 1)],
            AgentRegistry::new().with(
                "build",
                gated(entered.clone(), release.clone(), calls.clone(), false),
            ),
        );
        let job_id = shared.lock().job.id;
        let events = bus.subscribe(job_id).unwrap();

        let control = async {
            entered.notified().await;
            shared.lock().request_cancel();
            release.notify_one();
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(runner.run(&shared), control)
        })
        .await
        .unwrap();

        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Cancelled);
        assert_eq!(entry.job.stages[0].status, StageStatus::Succeeded);
        assert!(entry.job.artifacts.is_empty());
        assert!(entry.job.error.is_none());
        drop(entry);
        assert!(store.is_empty().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events: Vec<_> = events.collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.status, JobStatus::Cancelled);
        assert!(last.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_after_mid_attempt_cancel() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        let (runner, shared, _bus, _store) = setup(
            vec![
                StageTemplate::new("research", 1).with_retry(RetryPolicy::new(3, 1, 1)),
                StageTemplate::new("build", 1),
            ],
            AgentRegistry::new()
                .with(
                    "research",
                    gated(entered.clone(), release.clone(), calls.clone(), true),
                )
                .with("build", echo("build")),
        );

        let control = async {
            entered.notified().await;
            shared.lock().request_cancel();
            release.notify_one();
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(runner.run(&shared), control)
        })
        .await
        .unwrap();

        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Cancelled);
        assert!(entry.job.error.is_none());
        assert_eq!(entry.job.stages[0].status, StageStatus::Failed);
        assert_eq!(entry.job.stages[0].retries, 0);
        assert!(entry.job.stages[0].error.as_deref().unwrap().contains("lost connection"));
        assert_eq!(entry.job.stages[1].status, StageStatus::Pending);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_optional_stage_is_not_skipped() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        let (runner, shared, _bus, _store) = setup(
            vec![
                StageTemplate::new("review", 50).optional(),
                StageTemplate::new("build", 50),
            ],
            AgentRegistry::new()
                .with("review", gated(entered.clone(), release.clone(), calls.clone(), true))
                .with("build", echo("build")),
        );

        let control = async {
            entered.notified().await;
            shared.lock().request_cancel();
            release.notify_one();
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(runner.run(&shared), control)
        })
        .await
        .unwrap();

        let entry = shared.lock();
        assert_eq!(entry.job.status(), JobStatus::Cancelled);
        assert_eq!(entry.job.stages[0].status, StageStatus::Failed);
        assert_eq!(entry.job.progress, 0.0);
    }
}
