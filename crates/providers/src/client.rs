//! Cost-limited model client.
//!
//! Wraps a [`ModelBackend`] with spend accounting, context pre-checks and
//! retry/backoff. Every successful call advances the owned [`ApiStats`];
//! limits are enforced immediately afterwards, total budget first, so a
//! sub-agent blowing the shared budget surfaces as `TotalCostLimitExceeded`
//! even when its own instance allowance still has room.

use std::sync::Arc;
use std::time::Duration;

use patchwright_core::error::ModelError;
use patchwright_core::message::Message;
use patchwright_core::model::{CompletionRequest, CompletionResponse, ModelBackend, ModelOutput, ToolSpec};
use patchwright_core::stats::ApiStats;
use rand::Rng;
use tracing::{debug, warn};

use crate::metadata::ModelMetadata;

/// Rough prompt-size estimate used for the pre-flight context check.
const CHARS_PER_TOKEN: usize = 4;

/// Spend ceilings in dollars. A zero or negative value disables that limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostLimits {
    /// Budget for the current attempt.
    pub per_instance: f64,
    /// Budget across all attempts and sub-agents of the run.
    pub total: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            per_instance: 3.0,
            total: 0.0,
        }
    }
}

/// Exponential backoff with full jitter: each attempt sleeps a uniform
/// duration up to `base * 2^(attempt-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = (self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32))
            .min(self.max_delay.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(0.0..=ceiling);
        Duration::from_secs_f64(jittered)
    }
}

/// A model backend plus accounting: owns the run's [`ApiStats`] and refuses
/// to spend past the configured limits.
pub struct ModelClient {
    backend: Arc<dyn ModelBackend>,
    metadata: ModelMetadata,
    limits: CostLimits,
    retry: RetryPolicy,
    temperature: f32,
    top_p: Option<f32>,
    tools: Vec<ToolSpec>,
    stats: ApiStats,
}

impl ModelClient {
    pub fn new(backend: Arc<dyn ModelBackend>, metadata: ModelMetadata) -> Self {
        Self {
            backend,
            metadata,
            limits: CostLimits::default(),
            retry: RetryPolicy::default(),
            temperature: 0.0,
            top_p: None,
            tools: Vec::new(),
            stats: ApiStats::default(),
        }
    }

    pub fn with_limits(mut self, limits: CostLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, top_p: Option<f32>) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self
    }

    /// Advertise tool schemas to the backend (function-calling parsers).
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn model_name(&self) -> &str {
        &self.metadata.name
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn stats(&self) -> &ApiStats {
        &self.stats
    }

    /// Start a fresh attempt: the instance budget resets while the total
    /// spend carries over.
    pub fn begin_attempt(&mut self) {
        self.stats = ApiStats::with_carried_total(self.stats.total_cost);
    }

    /// Merge a finished sub-agent's stats into this client's, field-wise.
    pub fn absorb_stats(&mut self, child: &ApiStats) {
        self.stats += child;
    }

    /// One accounted model call: pre-check the prompt size, call the backend
    /// with retry/backoff, then record cost and enforce limits.
    pub async fn query(&mut self, messages: &[Message]) -> Result<ModelOutput, ModelError> {
        self.check_context_fit(messages)?;
        let response = self.complete_with_retry(messages).await?;
        self.record_usage(&response)?;
        Ok(ModelOutput::from(response))
    }

    fn check_context_fit(&self, messages: &[Message]) -> Result<(), ModelError> {
        let chars: usize = messages.iter().map(|m| m.content.len()).sum();
        let estimated_tokens = chars / CHARS_PER_TOKEN;
        if estimated_tokens > self.metadata.context_window as usize {
            warn!(
                estimated_tokens,
                context_window = self.metadata.context_window,
                "prompt cannot fit the context window, skipping the call"
            );
            return Err(ModelError::ContextWindowExceeded {
                max_context: self.metadata.context_window,
            });
        }
        Ok(())
    }

    fn build_request(&self, messages: &[Message]) -> CompletionRequest {
        let mut request = CompletionRequest::new(self.metadata.name.as_str(), messages.to_vec());
        request.temperature = self.temperature;
        request.top_p = self.top_p;
        request.max_tokens = self.metadata.max_output_tokens;
        request.tools = self.tools.clone();
        request
    }

    async fn complete_with_retry(
        &self,
        messages: &[Message],
    ) -> Result<CompletionResponse, ModelError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.backend.complete(self.build_request(messages)).await {
                Ok(response) => return Ok(response),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(ModelError::RetriesExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        });
                    }
                    let delay = match &err {
                        ModelError::RateLimited {
                            retry_after_secs: Some(secs),
                        } => Duration::from_secs(*secs).min(self.retry.max_delay),
                        _ => self.retry.delay_for(attempt),
                    };
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "model call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn record_usage(&mut self, response: &CompletionResponse) -> Result<(), ModelError> {
        let cost = response.input_tokens as f64 * self.metadata.cost_per_input_token
            + response.output_tokens as f64 * self.metadata.cost_per_output_token;
        self.stats
            .record_call(cost, response.input_tokens, response.output_tokens);
        debug!(
            cost,
            instance_cost = self.stats.instance_cost,
            total_cost = self.stats.total_cost,
            tokens_sent = response.input_tokens,
            tokens_received = response.output_tokens,
            api_calls = self.stats.api_calls,
            "recorded model call"
        );
        if 0.0 < self.limits.total && self.limits.total <= self.stats.total_cost {
            warn!(
                limit = self.limits.total,
                spent = self.stats.total_cost,
                "total cost limit exceeded"
            );
            return Err(ModelError::TotalCostLimitExceeded {
                limit: self.limits.total,
                spent: self.stats.total_cost,
            });
        }
        if 0.0 < self.limits.per_instance && self.limits.per_instance <= self.stats.instance_cost {
            warn!(
                limit = self.limits.per_instance,
                spent = self.stats.instance_cost,
                "instance cost limit exceeded"
            );
            return Err(ModelError::InstanceCostLimitExceeded {
                limit: self.limits.per_instance,
                spent: self.stats.instance_cost,
            });
        }
        Ok(())
    }
}
