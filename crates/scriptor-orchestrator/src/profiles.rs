use scriptor_core::{ScriptorError, ScriptorResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Retry behaviour of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `N` allows `N + 1` attempts in total.
    pub max_retries: u32,
    /// Wait before the stage's first retry, in ms. Doubles on each later retry.
    pub backoff_base_ms: u64,
    /// Longest wait between two attempts of the stage, in ms.
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// No retries: a single attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn new(max_retries: u32, backoff_base_ms: u64, backoff_max_ms: u64) -> Self {
        Self {
            max_retries,
            backoff_base_ms,
            backoff_max_ms,
        }
    }

    /// Wait after failed attempt `attempt` (0-based): `base << attempt`, at most `max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

fn default_weight() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_artifact_format() -> String {
    "markdown".to_string()
}

/// Declaration of one stage inside a [`WorkflowProfile`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTemplate {
    pub name: String,
    /// Agent kind; empty means "same as the stage name".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub optional: bool,
    /// Inactivity limit for one attempt; reset by every progress report.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Store this stage's output as an intermediate artifact.
    #[serde(default)]
    pub persist_output: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StageTemplate {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            agent: String::new(),
            weight,
            optional: false,
            timeout_ms: default_timeout_ms(),
            persist_output: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_agent(mut self, kind: impl Into<String>) -> Self {
        self.agent = kind.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn persisted(mut self) -> Self {
        self.persist_output = true;
        self
    }

    pub fn agent_kind(&self) -> &str {
        if self.agent.is_empty() {
            &self.name
        } else {
            &self.agent
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Named, ordered stage sequence with per-stage weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Format tag of the final artifact.
    #[serde(default = "default_artifact_format")]
    pub artifact_format: String,
    /// Keys that must be present (non-null, non-blank) in job params.
    #[serde(default)]
    pub required_params: Vec<String>,
    pub stages: Vec<StageTemplate>,
}

impl WorkflowProfile {
    pub fn new(name: impl Into<String>, stages: Vec<StageTemplate>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            artifact_format: default_artifact_format(),
            required_params: Vec::new(),
            stages,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.artifact_format = format.into();
        self
    }

    pub fn with_required_params<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_params = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn total_weight(&self) -> u64 {
        self.stages.iter().map(|s| u64::from(s.weight)).sum()
    }

    /// Structural checks applied before a profile is registered.
    pub fn validate(&self) -> ScriptorResult<()> {
        let invalid = |msg: String| ScriptorError::Config(format!("profile '{}': {msg}", self.name));

        if self.name.trim().is_empty() {
            return Err(ScriptorError::Config("profile name must not be empty".into()));
        }
        if self.stages.is_empty() {
            return Err(invalid("must declare at least one stage".into()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(invalid("stage name must not be empty".into()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage '{}'", stage.name)));
            }
            if stage.weight == 0 {
                return Err(invalid(format!("stage '{}' must have a positive weight", stage.name)));
            }
            if stage.timeout_ms == 0 {
                return Err(invalid(format!("stage '{}' must have a positive timeout", stage.name)));
            }
        }
        if self.stages.last().is_some_and(|s| s.optional) {
            return Err(invalid("the final stage produces the artifact and cannot be optional".into()));
        }
        Ok(())
    }

    /// Check job params: a JSON object carrying every required key.
    pub fn validate_params(&self, params: &serde_json::Value) -> ScriptorResult<()> {
        let Some(object) = params.as_object() else {
            return Err(ScriptorError::InvalidParams(
                "params must be a JSON object".into(),
            ));
        };
        for key in &self.required_params {
            let present = match object.get(key) {
                None | Some(serde_json::Value::Null) => false,
                Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
            };
            if !present {
                return Err(ScriptorError::InvalidParams(format!(
                    "profile '{}' requires parameter '{key}'",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Built-in profiles: `express` (fast, four stages) and `thorough` (deep research, eight stages).
pub fn default_profiles() -> Vec<WorkflowProfile> {
    vec![
        WorkflowProfile::new(
            "express",
            vec![
                StageTemplate::new("discovery", 25).with_timeout(Duration::from_secs(120)),
                StageTemplate::new("curation", 20).with_timeout(Duration::from_secs(120)),
                StageTemplate::new("drafting", 35),
                StageTemplate::new("build", 20).with_timeout(Duration::from_secs(120)),
            ],
        )
        .with_description("Quick discovery and a single drafting pass")
        .with_required_params(["theme"]),
        WorkflowProfile::new(
            "thorough",
            vec![
                StageTemplate::new("discovery", 10).with_timeout(Duration::from_secs(120)),
                StageTemplate::new("deep_research", 15)
                    .with_timeout(Duration::from_secs(600))
                    .persisted(),
                StageTemplate::new("curation", 10),
                StageTemplate::new("outline", 10).persisted(),
                StageTemplate::new("drafting", 25).with_timeout(Duration::from_secs(600)),
                StageTemplate::new("review", 10).optional(),
                StageTemplate::new("polish", 10).optional(),
                StageTemplate::new("build", 10).with_timeout(Duration::from_secs(120)),
            ],
        )
        .with_description("Deep research, outlining, review and polish before building")
        .with_required_params(["theme"]),
    ]
}

/// Fixed set of profiles, addressable by case-insensitive name.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<WorkflowProfile>>,
}

impl ProfileRegistry {
    /// Validate and register `profiles`. Names must be unique (ignoring case).
    pub fn new(profiles: Vec<WorkflowProfile>) -> ScriptorResult<Self> {
        let mut registry = Self::default();
        for profile in profiles {
            profile.validate()?;
            let key = profile.name.to_lowercase();
            if registry.profiles.contains_key(&key) {
                return Err(ScriptorError::Config(format!(
                    "duplicate profile '{}'",
                    profile.name
                )));
            }
            registry.profiles.insert(key, Arc::new(profile));
        }
        Ok(registry)
    }

    /// Registry holding the built-in profiles.
    pub fn builtin() -> ScriptorResult<Self> {
        Self::new(default_profiles())
    }

    pub fn resolve(&self, name: &str) -> ScriptorResult<Arc<WorkflowProfile>> {
        self.profiles
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| ScriptorError::UnknownProfile(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(&name.trim().to_lowercase())
    }

    /// Profile names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.values().map(|p| p.name.clone()).collect();
        names.sort();
        names
    }

    /// Every agent kind referenced by any stage of any profile.
    pub fn agent_kinds(&self) -> BTreeSet<String> {
        self.profiles
            .values()
            .flat_map(|p| p.stages.iter().map(|s| s.agent_kind().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
