use crate::profiles::ProfileRegistry;
use crate::types::JobId;
use async_trait::async_trait;
use scriptor_core::{ScriptorError, ScriptorResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// What a stage agent receives for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageInput {
    pub job_id: JobId,
    pub stage: String,
    pub position: usize,
    /// 0 for the first attempt, incremented on each retry.
    pub attempt: u32,
    /// The job's creation params, unchanged.
    pub params: serde_json::Value,
    /// Output of the previous resolved stage, or the params for the first stage.
    pub payload: serde_json::Value,
}

/// What a stage agent returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub payload: serde_json::Value,
    /// Format tag for the stored artifact; defaults to the profile's format.
    pub format: Option<String>,
}

impl StageOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            format: None,
        }
    }

    /// Plain text output; stored as raw UTF-8 bytes.
    pub fn text(content: impl Into<String>) -> Self {
        Self::new(serde_json::Value::String(content.into()))
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Bytes handed to the artifact store. Strings are written raw, anything else as JSON.
    pub fn to_bytes(&self) -> ScriptorResult<Vec<u8>> {
        match &self.payload {
            serde_json::Value::String(s) => Ok(s.clone().into_bytes()),
            other => Ok(serde_json::to_vec_pretty(other)?),
        }
    }

    pub(crate) fn default_format(&self) -> &'static str {
        if self.payload.is_string() {
            "text"
        } else {
            "json"
        }
    }
}

/// A stage-local progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub message: Option<String>,
}

/// Channel an agent uses to report progress within its current stage.
///
/// Reports after the attempt has ended are dropped.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressReporter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    /// A reporter whose updates go nowhere.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Report stage-local progress in 0–100. Returns false once the attempt is over.
    pub fn report(&self, percent: f64) -> bool {
        self.tx
            .send(ProgressUpdate {
                percent,
                message: None,
            })
            .is_ok()
    }

    pub fn report_with(&self, percent: f64, message: impl Into<String>) -> bool {
        self.tx
            .send(ProgressUpdate {
                percent,
                message: Some(message.into()),
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Cooperative cancellation flag for one job.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation has been requested. Never resolves otherwise.
    pub async fn cancelled(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }
}

/// Capabilities handed to an agent for one attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub progress: ProgressReporter,
    pub cancel: CancelSignal,
}

impl StageContext {
    pub fn new(progress: ProgressReporter, cancel: CancelSignal) -> Self {
        Self { progress, cancel }
    }

    /// Context with no listener and no cancellation, for driving agents directly.
    pub fn detached() -> Self {
        Self::new(ProgressReporter::detached(), CancelSignal::never())
    }
}

/// The capability that performs one stage's work.
///
/// Agents are shared across jobs and must be safe to call concurrently.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, input: StageInput, ctx: StageContext) -> ScriptorResult<StageOutput>;
}

/// Adapter turning an async closure into an [`Agent`].
pub struct FnAgent<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(StageInput, StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ScriptorResult<StageOutput>> + Send + 'static,
{
    async fn run(&self, input: StageInput, ctx: StageContext) -> ScriptorResult<StageOutput> {
        (self.f)(input, ctx).await
    }
}

/// Wrap an async closure as a shareable agent.
pub fn agent_fn<F, Fut>(f: F) -> Arc<dyn Agent>
where
    F: Fn(StageInput, StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ScriptorResult<StageOutput>> + Send + 'static,
{
    Arc::new(FnAgent { f })
}

/// Agents by kind.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: impl Into<String>, agent: Arc<dyn Agent>) {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "Agent registered");
        self.agents.insert(kind, agent);
    }

    pub fn with(mut self, kind: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.register(kind, agent);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.agents.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Fails with a config error naming every agent kind the profiles need but nobody provides.
    pub fn ensure_covers(&self, profiles: &ProfileRegistry) -> ScriptorResult<()> {
        let missing: Vec<String> = profiles
            .agent_kinds()
            .into_iter()
            .filter(|kind| !self.agents.contains_key(kind))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ScriptorError::Config(format!(
                "no agent registered for: {}",
                missing.join(", ")
            )))
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
