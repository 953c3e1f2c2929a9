//! Anthropic Messages API backend.
//!
//! Speaks the native API (not an OpenAI-compatible proxy):
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - system prompt as a top-level field
//! - `tool_use` content blocks for function calling

use async_trait::async_trait;
use patchwright_core::error::ModelError;
use patchwright_core::message::{Message, Role};
use patchwright_core::model::{
    CompletionRequest, CompletionResponse, ModelBackend, ToolCall, ToolSpec,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicBackend {
    base_url: String,
    api_key: String,
    /// Context window of the model in use; echoed in overflow errors.
    max_context: u32,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>, max_context: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("failed to build HTTP client");

        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            max_context,
            client,
        }
    }

    /// Point at a proxy or test server instead of the public endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Anthropic takes the system prompt as a top-level field, not a message.
    fn extract_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut non_system: Vec<&Message> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                _ => non_system.push(msg),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        (system, non_system)
    }

    /// Flatten to the API shape. Tool observations travel as user turns;
    /// consecutive same-role turns are merged because the API insists on
    /// alternation.
    fn to_api_messages(messages: &[&Message]) -> Vec<AnthropicMessage> {
        let mut result: Vec<AnthropicMessage> = Vec::new();

        for msg in messages {
            let role = match msg.role {
                Role::Assistant => "assistant",
                Role::User | Role::Tool => "user",
                Role::System => continue, // handled separately
            };
            match result.last_mut() {
                Some(last) if last.role == role => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&msg.content);
                }
                _ => result.push(AnthropicMessage {
                    role: role.into(),
                    content: msg.content.clone(),
                }),
            }
        }

        result
    }

    fn to_api_tools(tools: &[ToolSpec]) -> Vec<AnthropicTool> {
        tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }

    fn to_completion_response(resp: AnthropicResponse) -> CompletionResponse {
        let mut text = String::new();
        let mut tool_calls = Vec::new();

        for block in resp.content {
            match block {
                ResponseContentBlock::Text { text: chunk } => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&chunk);
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: serde_json::to_string(&input).unwrap_or_default(),
                    });
                }
            }
        }

        CompletionResponse {
            text,
            tool_calls,
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            model: resp.model,
        }
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ModelError> {
        let url = format!("{}/v1/messages", self.base_url);
        let (system, messages) = Self::extract_system(&request.messages);
        let api_messages = Self::to_api_messages(&messages);

        let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": api_messages,
            "max_tokens": max_tokens,
            "temperature": request.temperature,
        });

        if let Some(ref sys) = system {
            body["system"] = serde_json::json!(sys);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        debug!(backend = "anthropic", model = %request.model, "sending completion request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(e.to_string())
                } else {
                    ModelError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ModelError::RateLimited { retry_after_secs });
        }
        if status == 401 || status == 403 {
            return Err(ModelError::AuthenticationFailed(
                "invalid Anthropic API key".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            if error_body.contains("prompt is too long") {
                return Err(ModelError::ContextWindowExceeded {
                    max_context: self.max_context,
                });
            }
            return Err(ModelError::Api {
                status_code: status,
                message: error_body,
            });
        }

        let api_resp: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;

        Ok(Self::to_completion_response(api_resp))
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_defaults() {
        let backend = AnthropicBackend::new("sk-ant-test", 200_000);
        assert_eq!(backend.name(), "anthropic");
        assert_eq!(backend.base_url, DEFAULT_BASE_URL);
        assert_eq!(backend.max_context, 200_000);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let backend =
            AnthropicBackend::new("sk-ant-test", 200_000).with_base_url("https://proxy.local/");
        assert_eq!(backend.base_url, "https://proxy.local");
    }

    #[test]
    fn system_messages_become_top_level_field() {
        let messages = vec![
            Message::system("You are a software engineer"),
            Message::system("Work inside the sandbox"),
            Message::user("Fix the bug"),
            Message::assistant("Looking"),
        ];

        let (system, non_system) = AnthropicBackend::extract_system(&messages);
        assert_eq!(
            system.as_deref(),
            Some("You are a software engineer\n\nWork inside the sandbox")
        );
        assert_eq!(non_system.len(), 2);
    }

    #[test]
    fn consecutive_user_turns_are_merged() {
        let messages = vec![
            Message::user("observation one"),
            Message {
                role: Role::Tool,
                content: "observation two".into(),
            },
            Message::assistant("next"),
        ];
        let refs: Vec<&Message> = messages.iter().collect();
        let api = AnthropicBackend::to_api_messages(&refs);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0].role, "user");
        assert_eq!(api[0].content, "observation one\n\nobservation two");
        assert_eq!(api[1].role, "assistant");
    }

    #[test]
    fn tool_specs_map_to_input_schema() {
        let tools = vec![ToolSpec {
            name: "open".into(),
            description: "Open a file".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "path": {"type": "string"} },
                "required": ["path"]
            }),
        }];
        let api_tools = AnthropicBackend::to_api_tools(&tools);
        assert_eq!(api_tools.len(), 1);
        assert_eq!(api_tools[0].name, "open");
        assert_eq!(api_tools[0].input_schema["type"].as_str(), Some("object"));
    }

    #[test]
    fn parses_text_response() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "model": "claude-3-5-sonnet-20240620",
                "content": [{"type": "text", "text": "DISCUSSION\nls\n\n```\nls\n```"}],
                "usage": {"input_tokens": 10, "output_tokens": 5}
            }"#,
        )
        .unwrap();

        let completion = AnthropicBackend::to_completion_response(resp);
        assert!(completion.text.contains("```\nls\n```"));
        assert!(completion.tool_calls.is_empty());
        assert_eq!(completion.input_tokens, 10);
        assert_eq!(completion.output_tokens, 5);
    }

    #[test]
    fn parses_tool_use_response() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "model": "claude-3-5-sonnet-20240620",
                "content": [
                    {"type": "text", "text": "Opening the file"},
                    {"type": "tool_use", "id": "toolu_1", "name": "open", "input": {"path": "src/main.rs"}}
                ],
                "usage": {"input_tokens": 20, "output_tokens": 10}
            }"#,
        )
        .unwrap();

        let completion = AnthropicBackend::to_completion_response(resp);
        assert_eq!(completion.text, "Opening the file");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "open");
        let args: serde_json::Value =
            serde_json::from_str(&completion.tool_calls[0].arguments).unwrap();
        assert_eq!(args["path"], "src/main.rs");
    }
}
