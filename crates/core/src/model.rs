//! Model backend trait — the abstraction over LLM provider APIs.
//!
//! A backend knows how to send one ordered message list to a model and get
//! back text, optional structured tool calls, and token counts. Cost
//! accounting and retry live above this boundary, in the model client.
//!
//! Implementations: Anthropic messages API, OpenAI-compatible chat
//! completions, deterministic replay.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::message::Message;

/// One completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Provider-side model identifier.
    pub model: String,

    /// The ordered conversation.
    pub messages: Vec<Message>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tool schemas advertised for function calling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
}

fn default_temperature() -> f32 {
    0.0
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            top_p: None,
            max_tokens: None,
            tools: Vec::new(),
        }
    }
}

/// A tool schema advertised to the model for function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
}

/// A structured tool call returned by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as the model produced them.
    pub arguments: String,
}

/// A complete model response with token accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    pub input_tokens: u64,
    pub output_tokens: u64,

    /// Which model actually answered (may differ from the requested one).
    pub model: String,
}

/// What the agent loop consumes from one model query: assistant text plus
/// any structured tool calls. Token accounting stays inside the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOutput {
    pub text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }
}

impl From<CompletionResponse> for ModelOutput {
    fn from(response: CompletionResponse) -> Self {
        Self {
            text: response.text,
            tool_calls: response.tool_calls,
        }
    }
}

/// The provider contract.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// A short name for this backend (e.g. "anthropic", "openai").
    fn name(&self) -> &str;

    /// Send one completion request and await the full response.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ModelError>;
}
