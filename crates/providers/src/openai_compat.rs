//! OpenAI-compatible chat backend.
//!
//! Works against the official OpenAI API and any server speaking the same
//! `/chat/completions` dialect (Azure proxies, DeepSeek, local inference
//! gateways) by swapping the base URL.

use async_trait::async_trait;
use patchwright_core::error::ModelError;
use patchwright_core::message::{Message, Role};
use patchwright_core::model::{
    CompletionRequest, CompletionResponse, ModelBackend, ToolCall, ToolSpec,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatBackend {
    name: String,
    base_url: String,
    api_key: String,
    /// Context window of the model in use; echoed in overflow errors.
    max_context: u32,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        max_context: u32,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("failed to build HTTP client");

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_context,
            client,
        }
    }

    pub fn openai(api_key: impl Into<String>, max_context: u32) -> Self {
        Self::new("openai", OPENAI_BASE_URL, api_key, max_context)
    }

    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|msg| ApiMessage {
                role: match msg.role {
                    Role::System => "system",
                    Role::User | Role::Tool => "user",
                    Role::Assistant => "assistant",
                }
                .into(),
                content: Some(msg.content.clone()),
                tool_calls: None,
            })
            .collect()
    }

    fn to_api_tools(tools: &[ToolSpec]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn is_context_overflow(status: u16, body: &str) -> bool {
        status == 400
            && (body.contains("maximum context length") || body.contains("context_length_exceeded"))
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": false,
        });

        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        debug!(backend = %self.name, model = %request.model, "sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
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
                "invalid API key or insufficient permissions".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "provider returned error");
            if Self::is_context_overflow(status, &error_body) {
                return Err(ModelError::ContextWindowExceeded {
                    max_context: self.max_context,
                });
            }
            return Err(ModelError::Api {
                status_code: status,
                message: error_body,
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::MalformedResponse(e.to_string()))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::MalformedResponse("no choices in response".into()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        let usage = api_response.usage.unwrap_or_default();

        Ok(CompletionResponse {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            model: api_response.model,
        })
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_trims_base_url() {
        let backend = OpenAiCompatBackend::new("deepseek", "https://api.deepseek.com/", "key", 32_000);
        assert_eq!(backend.name(), "deepseek");
        assert_eq!(backend.base_url, "https://api.deepseek.com");
    }

    #[test]
    fn openai_constructor_uses_public_endpoint() {
        let backend = OpenAiCompatBackend::openai("sk-test", 128_000);
        assert_eq!(backend.name(), "openai");
        assert_eq!(backend.base_url, OPENAI_BASE_URL);
    }

    #[test]
    fn message_conversion_flattens_tool_role() {
        let messages = vec![
            Message::system("instructions"),
            Message::user("prompt"),
            Message {
                role: Role::Tool,
                content: "tool output".into(),
            },
        ];
        let api = OpenAiCompatBackend::to_api_messages(&messages);
        assert_eq!(api.len(), 3);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
        assert_eq!(api[2].role, "user");
    }

    #[test]
    fn tool_conversion_wraps_function() {
        let tools = vec![ToolSpec {
            name: "submit".into(),
            description: "Submit the solution".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        }];
        let api = OpenAiCompatBackend::to_api_tools(&tools);
        assert_eq!(api[0].r#type, "function");
        assert_eq!(api[0].function.name, "submit");
    }

    #[test]
    fn context_overflow_detection() {
        assert!(OpenAiCompatBackend::is_context_overflow(
            400,
            "This model's maximum context length is 128000 tokens"
        ));
        assert!(OpenAiCompatBackend::is_context_overflow(
            400,
            r#"{"error": {"code": "context_length_exceeded"}}"#
        ));
        assert!(!OpenAiCompatBackend::is_context_overflow(400, "bad request"));
        assert!(!OpenAiCompatBackend::is_context_overflow(
            500,
            "maximum context length"
        ));
    }

    #[test]
    fn parses_chat_completion_response() {
        let raw = r#"{
            "model": "gpt-4o-2024-05-13",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "DISCUSSION\nrun ls\n\n```\nls\n```"
                }
            }],
            "usage": {"prompt_tokens": 42, "completion_tokens": 13, "total_tokens": 55}
        }"#;
        let api: ApiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(api.choices.len(), 1);
        assert_eq!(api.usage.as_ref().unwrap().prompt_tokens, 42);
    }

    #[test]
    fn parses_tool_call_response() {
        let raw = r#"{
            "model": "gpt-4o-2024-05-13",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "open", "arguments": "{\"path\": \"src/lib.rs\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let api: ApiResponse = serde_json::from_str(raw).unwrap();
        let calls = api.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "open");
    }
}
