//! Model backends and the cost-limited client.
//!
//! A [`BackendConfig`] names one of the closed set of backends; [`build_backend`]
//! turns it into an `Arc<dyn ModelBackend>` ready to hand to a [`ModelClient`].
//! API keys and base URLs come from the config file or fall back to
//! environment variables (`ANTHROPIC_API_KEY`, `OPENAI_API_KEY`,
//! `ANTHROPIC_BASE_URL`, `OPENAI_BASE_URL`).

pub mod anthropic;
pub mod client;
pub mod metadata;
pub mod openai_compat;
pub mod replay;

use std::path::PathBuf;
use std::sync::Arc;

use patchwright_core::error::ConfigError;
use patchwright_core::model::ModelBackend;
use serde::{Deserialize, Serialize};

pub use anthropic::AnthropicBackend;
pub use client::{CostLimits, ModelClient, RetryPolicy};
pub use metadata::{MetadataOverride, ModelMetadata};
pub use openai_compat::OpenAiCompatBackend;
pub use replay::ReplayBackend;

/// The closed set of model backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Anthropic {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        base_url: Option<String>,
    },
    OpenaiCompat {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        base_url: Option<String>,
    },
    /// Replay responses from a saved trajectory or a response script.
    Replay {
        path: PathBuf,
        /// Fixed (input, output) token counts reported per call, so a
        /// replayed run exercises the same cost accounting as a live one.
        #[serde(default)]
        usage: Option<(u64, u64)>,
    },
    /// Submit immediately; for smoke tests of the full pipeline.
    InstantSubmit,
}

impl BackendConfig {
    /// Pick a backend from the model name when the config does not say.
    pub fn infer_for_model(model: &str) -> Result<Self, ConfigError> {
        if model.starts_with("claude") {
            Ok(BackendConfig::Anthropic {
                api_key: None,
                base_url: None,
            })
        } else if model.starts_with("gpt") || model.starts_with("o1") || model.starts_with("deepseek") {
            Ok(BackendConfig::OpenaiCompat {
                name: None,
                api_key: None,
                base_url: None,
            })
        } else if model == "instant-submit" {
            Ok(BackendConfig::InstantSubmit)
        } else {
            Err(ConfigError::InvalidValue {
                field: "model.backend".into(),
                reason: format!("cannot infer a backend for model '{model}'"),
            })
        }
    }
}

/// Instantiate the configured backend. Metadata supplies the context window
/// echoed in overflow errors.
pub fn build_backend(
    config: &BackendConfig,
    metadata: &ModelMetadata,
) -> Result<Arc<dyn ModelBackend>, ConfigError> {
    match config {
        BackendConfig::Anthropic { api_key, base_url } => {
            let key = resolve_key(api_key.as_deref(), "ANTHROPIC_API_KEY")?;
            let mut backend = AnthropicBackend::new(key, metadata.context_window);
            if let Some(url) = resolve_base_url(base_url.as_deref(), "ANTHROPIC_BASE_URL") {
                backend = backend.with_base_url(url);
            }
            Ok(Arc::new(backend))
        }
        BackendConfig::OpenaiCompat {
            name,
            api_key,
            base_url,
        } => {
            let key = resolve_key(api_key.as_deref(), "OPENAI_API_KEY")?;
            let backend = match resolve_base_url(base_url.as_deref(), "OPENAI_BASE_URL") {
                Some(url) => OpenAiCompatBackend::new(
                    name.as_deref().unwrap_or("openai_compat"),
                    url,
                    key,
                    metadata.context_window,
                ),
                None => OpenAiCompatBackend::openai(key, metadata.context_window),
            };
            Ok(Arc::new(backend))
        }
        BackendConfig::Replay { path, usage } => {
            let mut backend = ReplayBackend::from_file(path)?;
            if let Some((input_tokens, output_tokens)) = usage {
                backend = backend.with_usage(*input_tokens, *output_tokens);
            }
            Ok(Arc::new(backend))
        }
        BackendConfig::InstantSubmit => Ok(Arc::new(ReplayBackend::instant_submit())),
    }
}

fn resolve_key(configured: Option<&str>, env_var: &str) -> Result<String, ConfigError> {
    if let Some(key) = configured {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    std::env::var(env_var)
        .ok()
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "backend.api_key".into(),
            reason: format!("no API key configured and {env_var} is not set"),
        })
}

fn resolve_base_url(configured: Option<&str>, env_var: &str) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok().filter(|url| !url.is_empty()))
}
