//! Deterministic backends: trajectory replay and instant submission.
//!
//! `ReplayBackend` feeds back a fixed sequence of responses, either scripted
//! in memory or recovered from a saved trajectory file. Once the script runs
//! dry it keeps answering with a bare `submit` so a replayed run always
//! reaches a terminal state. It doubles as the scripted backend used all
//! over the test suites.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use patchwright_core::error::{ConfigError, ModelError};
use patchwright_core::model::{CompletionRequest, CompletionResponse, ModelBackend};
use patchwright_core::trajectory::TrajectoryRecord;
use tracing::warn;

const SUBMIT_FALLBACK: &str = "DISCUSSION\nNo replay steps left, submitting.\n\n```\nsubmit\n```";

#[derive(Debug)]
pub struct ReplayBackend {
    responses: Mutex<VecDeque<String>>,
    /// (input, output) token counts reported per call.
    usage: (u64, u64),
    calls: Mutex<u32>,
}

impl ReplayBackend {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            usage: (0, 0),
            calls: Mutex::new(0),
        }
    }

    /// A backend that immediately submits whatever the sandbox holds.
    pub fn instant_submit() -> Self {
        Self::new(vec![
            "DISCUSSION\nSubmitting the workspace as-is.\n\n```\nsubmit\n```".into(),
        ])
    }

    /// Report fixed token counts on every call, so replayed runs exercise
    /// the same cost accounting as live ones.
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = (input_tokens, output_tokens);
        self
    }

    /// Load a response script from disk. Accepts either a saved trajectory
    /// record (the `response` field of each step is replayed) or a plain
    /// JSON array of response strings.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|err| ConfigError::InvalidValue {
                field: path.display().to_string(),
                reason: format!("not valid JSON: {err}"),
            })?;
        let responses = match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => Ok(s),
                    other => Err(ConfigError::InvalidValue {
                        field: path.display().to_string(),
                        reason: format!("replay entries must be strings, got: {other}"),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                let record: TrajectoryRecord =
                    serde_json::from_value(other).map_err(|err| ConfigError::InvalidValue {
                        field: path.display().to_string(),
                        reason: format!("neither a response array nor a trajectory record: {err}"),
                    })?;
                record
                    .trajectory
                    .into_iter()
                    .map(|step| step.response)
                    .collect()
            }
        };
        Ok(Self::new(responses))
    }

    /// How many times the backend has been queried.
    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    async fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, ModelError> {
        *self.calls.lock().unwrap() += 1;
        let text = match self.responses.lock().unwrap().pop_front() {
            Some(text) => text,
            None => {
                warn!("replay script exhausted, falling back to submit");
                SUBMIT_FALLBACK.to_string()
            }
        };
        Ok(CompletionResponse {
            text,
            tool_calls: Vec::new(),
            input_tokens: self.usage.0,
            output_tokens: self.usage.1,
            model: "replay".into(),
        })
    }
}
