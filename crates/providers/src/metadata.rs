//! Model metadata: context windows and per-token pricing.
//!
//! The built-in table covers the models the runtime has been used with;
//! anything else must be supplied via a configuration override. Shortcut
//! names (`gpt4o`, `claude-sonnet-3.5`) resolve to canonical model ids
//! before lookup.

use std::collections::BTreeMap;

use patchwright_core::error::ConfigError;
use serde::{Deserialize, Serialize};

/// Pricing and capacity facts for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Canonical model id sent to the provider.
    pub name: String,
    /// Maximum prompt size in tokens.
    pub context_window: u32,
    /// Provider-side completion cap, if the model has one.
    pub max_output_tokens: Option<u32>,
    /// Dollars per prompt token.
    pub cost_per_input_token: f64,
    /// Dollars per completion token.
    pub cost_per_output_token: f64,
}

/// Partial metadata from configuration. Fills gaps for unknown models or
/// overrides individual fields of a built-in entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataOverride {
    pub context_window: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub cost_per_input_token: Option<f64>,
    pub cost_per_output_token: Option<f64>,
}

/// (canonical id, context window, max output tokens, $/input token, $/output token)
const BUILTIN: &[(&str, u32, Option<u32>, f64, f64)] = &[
    ("gpt-4o-2024-05-13", 128_000, None, 5e-6, 15e-6),
    ("gpt-4o-mini-2024-07-18", 128_000, None, 1.5e-7, 6e-7),
    ("gpt-4-1106-preview", 128_000, None, 1e-5, 3e-5),
    ("gpt-4-turbo-2024-04-09", 128_000, None, 1e-5, 3e-5),
    ("gpt-3.5-turbo-0125", 16_385, None, 5e-7, 1.5e-6),
    ("o1-preview-2024-09-12", 128_000, None, 1.5e-5, 6e-5),
    ("o1-mini-2024-09-12", 128_000, None, 3e-6, 1.2e-5),
    ("claude-3-opus-20240229", 200_000, Some(4096), 1.5e-5, 7.5e-5),
    ("claude-3-sonnet-20240229", 200_000, Some(4096), 3e-6, 1.5e-5),
    ("claude-3-5-sonnet-20240620", 200_000, Some(4096), 3e-6, 1.5e-5),
    ("claude-3-haiku-20240307", 200_000, Some(4096), 2.5e-7, 1.25e-6),
    ("deepseek-coder", 32_000, None, 1.4e-7, 2.8e-7),
    // Deterministic backends; free by definition.
    ("replay", 100_000, None, 0.0, 0.0),
    ("instant-submit", 100_000, None, 0.0, 0.0),
];

const SHORTCUTS: &[(&str, &str)] = &[
    ("gpt4o", "gpt-4o-2024-05-13"),
    ("gpt4omini", "gpt-4o-mini-2024-07-18"),
    ("gpt-4o-mini", "gpt-4o-mini-2024-07-18"),
    ("gpt4", "gpt-4-1106-preview"),
    ("gpt4-turbo", "gpt-4-turbo-2024-04-09"),
    ("gpt3", "gpt-3.5-turbo-0125"),
    ("o1", "o1-preview-2024-09-12"),
    ("o1-mini", "o1-mini-2024-09-12"),
    ("claude-opus", "claude-3-opus-20240229"),
    ("claude-sonnet", "claude-3-sonnet-20240229"),
    ("claude-sonnet-3.5", "claude-3-5-sonnet-20240620"),
    ("claude-haiku", "claude-3-haiku-20240307"),
];

impl ModelMetadata {
    /// Resolve a (possibly shortcut) model name against the built-in table
    /// and configuration overrides.
    ///
    /// Overrides are consulted under both the raw and the canonical name. An
    /// unknown model is accepted only when the override supplies the context
    /// window and both token prices.
    pub fn resolve(
        name: &str,
        overrides: &BTreeMap<String, MetadataOverride>,
    ) -> Result<Self, ConfigError> {
        let canonical = SHORTCUTS
            .iter()
            .find(|(short, _)| *short == name)
            .map(|(_, full)| *full)
            .unwrap_or(name);

        let base = BUILTIN
            .iter()
            .find(|(id, ..)| *id == canonical)
            .map(|(id, window, max_out, cpi, cpo)| Self {
                name: (*id).to_string(),
                context_window: *window,
                max_output_tokens: *max_out,
                cost_per_input_token: *cpi,
                cost_per_output_token: *cpo,
            });

        let patch = overrides.get(name).or_else(|| overrides.get(canonical));

        match (base, patch) {
            (Some(mut meta), Some(patch)) => {
                if let Some(window) = patch.context_window {
                    meta.context_window = window;
                }
                if let Some(max_out) = patch.max_output_tokens {
                    meta.max_output_tokens = Some(max_out);
                }
                if let Some(cpi) = patch.cost_per_input_token {
                    meta.cost_per_input_token = cpi;
                }
                if let Some(cpo) = patch.cost_per_output_token {
                    meta.cost_per_output_token = cpo;
                }
                Ok(meta)
            }
            (Some(meta), None) => Ok(meta),
            (None, Some(patch)) => {
                let (Some(window), Some(cpi), Some(cpo)) = (
                    patch.context_window,
                    patch.cost_per_input_token,
                    patch.cost_per_output_token,
                ) else {
                    return Err(ConfigError::InvalidValue {
                        field: format!("model_metadata.{canonical}"),
                        reason: "override for an unknown model must set context_window, \
                                 cost_per_input_token and cost_per_output_token"
                            .into(),
                    });
                };
                Ok(Self {
                    name: canonical.to_string(),
                    context_window: window,
                    max_output_tokens: patch.max_output_tokens,
                    cost_per_input_token: cpi,
                    cost_per_output_token: cpo,
                })
            }
            (None, None) => Err(ConfigError::UnknownModel(name.to_string())),
        }
    }
}
