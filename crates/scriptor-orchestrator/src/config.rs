use crate::profiles::{default_profiles, ProfileRegistry, WorkflowProfile};
use scriptor_core::{LogFormat, ScriptorError, ScriptorResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_progress_min_delta() -> f64 {
    1.0
}

/// Engine settings, usually loaded from a TOML file.
///
/// ```toml
/// max_concurrent_jobs = 4
/// progress_min_delta = 2.5
///
/// [[profiles]]
/// name = "brief"
/// required_params = ["theme"]
///
/// [[profiles.stages]]
/// name = "drafting"
/// weight = 70
///
/// [[profiles.stages]]
/// name = "build"
/// weight = 30
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Jobs allowed in `Running` at once; later submissions wait in FIFO order.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Minimum aggregate movement, in percentage points, between progress events.
    #[serde(default = "default_progress_min_delta")]
    pub progress_min_delta: f64,
    /// Drop the built-in profiles instead of merging with them.
    #[serde(default)]
    pub replace_default_profiles: bool,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Extra profiles; a name matching a built-in one overrides it.
    #[serde(default)]
    pub profiles: Vec<WorkflowProfile>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            progress_min_delta: default_progress_min_delta(),
            replace_default_profiles: false,
            log_format: LogFormat::default(),
            profiles: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> ScriptorResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| ScriptorError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML config file.
    pub async fn load(path: impl AsRef<Path>) -> ScriptorResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ScriptorError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            max_concurrent_jobs = config.max_concurrent_jobs,
            profiles = config.profiles.len(),
            "Engine config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> ScriptorResult<()> {
        if self.max_concurrent_jobs == 0 {
            return Err(ScriptorError::Config(
                "max_concurrent_jobs must be at least 1".into(),
            ));
        }
        if !self.progress_min_delta.is_finite()
            || self.progress_min_delta < 0.0
            || self.progress_min_delta > 100.0
        {
            return Err(ScriptorError::Config(format!(
                "progress_min_delta must be within 0..=100, got {}",
                self.progress_min_delta
            )));
        }
        if self.replace_default_profiles && self.profiles.is_empty() {
            return Err(ScriptorError::Config(
                "replace_default_profiles requires at least one profile".into(),
            ));
        }
        for profile in &self.profiles {
            profile.validate()?;
        }
        Ok(())
    }

    /// Built-in profiles merged with the configured ones (configured wins by name).
    pub fn profile_registry(&self) -> ScriptorResult<ProfileRegistry> {
        let mut merged: Vec<WorkflowProfile> = if self.replace_default_profiles {
            Vec::new()
        } else {
            default_profiles()
        };
        for profile in &self.profiles {
            merged.retain(|p| !p.name.eq_ignore_ascii_case(&profile.name));
            merged.push(profile.clone());
        }
        ProfileRegistry::new(merged)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_concurrent_jobs, 3);
        assert_eq!(config.progress_min_delta, 1.0);
        assert_eq!(config.log_format, LogFormat::Pretty);
        let registry = config.profile_registry().unwrap();
        assert_eq!(registry.names(), vec!["express", "thorough"]);
    }

    #[test]
    fn test_custom_profile_merges_with_defaults() {
        let raw = r#"
max_concurrent_jobs = 5
log_format = "json"

[[profiles]]
name = "brief"
artifact_format = "html"
required_params = ["theme"]

[[profiles.stages]]
name = "drafting"
weight = 70
timeout_ms = 60000

[profiles.stages.retry]
max_retries = 1

[[profiles.stages]]
name = "build"
agent = "renderer"
weight = 30
"#;
        let config = EngineConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.max_concurrent_jobs, 5);
        assert_eq!(config.log_format, LogFormat::Json);

        let registry = config.profile_registry().unwrap();
        assert_eq!(registry.len(), 3);
        let brief = registry.resolve("brief").unwrap();
        assert_eq!(brief.artifact_format, "html");
        assert_eq!(brief.stages[0].retry.max_retries, 1);
        assert_eq!(brief.stages[0].retry.backoff_base_ms, 500);
        assert_eq!(brief.stages[1].agent_kind(), "renderer");
    }

    #[test]
    fn test_override_builtin_by_name() {
        let raw = r#"
[[profiles]]
name = "Express"

[[profiles.stages]]
name = "build"
weight = 1
"#;
        let registry = EngineConfig::from_toml_str(raw)
            .unwrap()
            .profile_registry()
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("express").unwrap().stages.len(), 1);
    }

    #[test]
    fn test_replace_defaults() {
        let raw = r#"
replace_default_profiles = true

[[profiles]]
name = "solo"

[[profiles.stages]]
name = "build"
"#;
        let registry = EngineConfig::from_toml_str(raw)
            .unwrap()
            .profile_registry()
            .unwrap();
        assert_eq!(registry.names(), vec!["solo"]);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_toml_str("max_concurrent_jobs = 0").is_err());
        assert!(EngineConfig::from_toml_str("progress_min_delta = 150.0").is_err());
        assert!(EngineConfig::from_toml_str("replace_default_profiles = true").is_err());
        assert!(EngineConfig::from_toml_str("max_concurrent_jobs = \"many\"").is_err());

        let bad_profile = r#"
[[profiles]]
name = "broken"
stages = []
"#;
        let err = EngineConfig::from_toml_str(bad_profile).unwrap_err();
        assert!(matches!(err, ScriptorError::Config(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("scriptor.toml");
        tokio::fs::write(&path, "max_concurrent_jobs = 2\n").await.unwrap();
        let config = EngineConfig::load(&path).await.unwrap();
        assert_eq!(config.max_concurrent_jobs, 2);

        let missing = EngineConfig::load(tmp.path().join("nope.toml")).await.unwrap_err();
        assert!(matches!(missing, ScriptorError::Config(_)));
    }
}
