//! Run configuration.
//!
//! Plain serde structs mirroring the TOML file. Building them into live
//! components (model client, catalog, template set) happens in
//! [`crate::Agent::from_config`]; everything that can be wrong with a
//! config surfaces there as a [`ConfigError`], before the first model
//! call or sandbox command.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use patchwright_core::error::ConfigError;
use patchwright_parsers::ActionParser;
use patchwright_providers::{
    build_backend, BackendConfig, CostLimits, MetadataOverride, ModelClient, ModelMetadata,
    RetryPolicy,
};
use patchwright_tools::ToolConfig;

use crate::history::HistoryProcessor;
use crate::reviewer::ReviewConfig;
use crate::templates::TemplateConfig;

/// Top level of the config file: the main agent plus an optional review
/// loop around it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub agent: AgentConfig,
    pub review: Option<ReviewConfig>,
}

impl RunConfig {
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError::InvalidValue {
            field: "config".into(),
            reason: err.to_string(),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&raw)
    }
}

/// Everything one agent needs: which model, how to prompt it, what it may
/// run, and how its transcript is compacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub name: String,
    pub model: ModelConfig,
    pub templates: TemplateConfig,
    pub tools: ToolConfig,
    pub parser: ActionParser,
    pub history_processors: Vec<HistoryProcessor>,
    /// Combined budget for format failures and blocked actions before the
    /// run is terminated with `exit_format`.
    pub max_requeries: u32,
    pub subroutines: Vec<SubroutineConfig>,
    pub max_subroutine_depth: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "main".into(),
            model: ModelConfig::default(),
            templates: TemplateConfig::default(),
            tools: ToolConfig::default(),
            parser: ActionParser::default(),
            history_processors: Vec::new(),
            max_requeries: 3,
            subroutines: Vec::new(),
            max_subroutine_depth: 2,
        }
    }
}

/// Model selection plus the spend and retry knobs around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Canonical model name or a shortcut like `gpt4o` / `claude-sonnet-3.5`.
    pub name: String,
    /// Backend wiring; inferred from the model name when omitted.
    pub backend: Option<BackendConfig>,
    pub per_instance_cost_limit: f64,
    /// Cross-attempt spend ceiling; 0 disables it.
    pub total_cost_limit: f64,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub retry: RetryConfig,
    /// Pricing/context overrides, keyed by model name. Required for models
    /// missing from the built-in table.
    pub metadata_overrides: BTreeMap<String, MetadataOverride>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "claude-sonnet-3.5".into(),
            backend: None,
            per_instance_cost_limit: 3.0,
            total_cost_limit: 0.0,
            temperature: 0.0,
            top_p: Some(0.95),
            retry: RetryConfig::default(),
            metadata_overrides: BTreeMap::new(),
        }
    }
}

impl ModelConfig {
    /// Resolves metadata, wires the backend, and assembles the client.
    pub fn build_client(&self) -> Result<ModelClient, ConfigError> {
        let metadata = ModelMetadata::resolve(&self.name, &self.metadata_overrides)?;
        let backend_config = match &self.backend {
            Some(config) => config.clone(),
            None => BackendConfig::infer_for_model(&metadata.name)?,
        };
        let backend = build_backend(&backend_config, &metadata)?;
        let retry = self.retry.build()?;
        Ok(ModelClient::new(backend, metadata)
            .with_limits(CostLimits {
                per_instance: self.per_instance_cost_limit,
                total: self.total_cost_limit,
            })
            .with_retry(retry)
            .with_sampling(self.temperature, self.top_p))
    }
}

/// Provider retry/backoff knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 1.0,
            max_delay_secs: 15.0,
        }
    }
}

impl RetryConfig {
    pub fn build(&self) -> Result<RetryPolicy, ConfigError> {
        if !(3..=10).contains(&self.max_attempts) {
            return Err(ConfigError::InvalidValue {
                field: "model.retry.max_attempts".into(),
                reason: format!("{} is outside the allowed range 3..=10", self.max_attempts),
            });
        }
        if self.base_delay_secs <= 0.0 || self.max_delay_secs < self.base_delay_secs {
            return Err(ConfigError::InvalidValue {
                field: "model.retry".into(),
                reason: "delays must satisfy 0 < base_delay_secs <= max_delay_secs".into(),
            });
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_secs_f64(self.base_delay_secs),
            max_delay: Duration::from_secs_f64(self.max_delay_secs),
        })
    }
}

/// A named sub-agent the model can dispatch to by using the subroutine's
/// name as an action's first token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubroutineConfig {
    pub name: String,
    /// Optional command run before the sub-agent starts; rendered with
    /// `{{args}}` and its output becomes the sub-agent's first observation.
    #[serde(default)]
    pub init_command: Option<String>,
    /// Environment variables snapshotted before dispatch and restored
    /// after the sub-agent returns.
    #[serde(default)]
    pub env_variables: Vec<String>,
    pub agent: Box<AgentConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = AgentConfig::default();
        assert_eq!(config.name, "main");
        assert_eq!(config.max_requeries, 3);
        assert_eq!(config.model.per_instance_cost_limit, 3.0);
        assert_eq!(config.model.retry.max_attempts, 5);
        assert!(config.subroutines.is_empty());
    }

    #[test]
    fn retry_bounds_are_enforced() {
        let mut retry = RetryConfig::default();
        assert!(retry.build().is_ok());

        retry.max_attempts = 2;
        assert!(retry.build().is_err());
        retry.max_attempts = 11;
        assert!(retry.build().is_err());
        retry.max_attempts = 10;
        assert!(retry.build().is_ok());

        retry.max_delay_secs = 0.5;
        assert!(retry.build().is_err());
    }

    #[test]
    fn run_config_parses_a_minimal_file() {
        let raw = r#"
            [agent]
            name = "main"
            max_requeries = 5

            [agent.model]
            name = "gpt4o"
            per_instance_cost_limit = 2.5

            [agent.tools]
            execution_timeout_secs = 10

            [[agent.history_processors]]
            kind = "last_n_observations"
            n = 5
        "#;
        let config = RunConfig::from_toml(raw).unwrap();
        assert_eq!(config.agent.max_requeries, 5);
        assert_eq!(config.agent.model.name, "gpt4o");
        assert_eq!(config.agent.model.per_instance_cost_limit, 2.5);
        assert_eq!(config.agent.history_processors.len(), 1);
        assert!(config.review.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"
            [agent]
            naem = "main"
        "#;
        assert!(RunConfig::from_toml(raw).is_err());
    }

    #[test]
    fn replay_backend_requires_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steps.json");
        std::fs::write(&path, r#"["```\nsubmit\n```"]"#).unwrap();

        let config = ModelConfig {
            name: "replay".into(),
            backend: Some(BackendConfig::Replay {
                path: path.clone(),
                usage: None,
            }),
            ..ModelConfig::default()
        };
        let client = config.build_client().unwrap();
        assert_eq!(client.model_name(), "replay");
    }

    #[test]
    fn unknown_model_without_override_is_fatal() {
        let config = ModelConfig {
            name: "my-bespoke-model".into(),
            ..ModelConfig::default()
        };
        assert!(matches!(
            config.build_client(),
            Err(ConfigError::UnknownModel(_))
        ));
    }
}
