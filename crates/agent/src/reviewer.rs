//! The review loop: sample complete runs, judge each one, keep the best.
//!
//! Two model-backed judges drive it. The reviewer reads one formatted
//! trajectory and answers accept or reject; the binary reviewer compares
//! the current best against the latest challenger. Both verdicts are read
//! off the last line of the model output, so judge prompts must ask for a
//! one-word final line.

use minijinja::{context, Environment};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, info, warn};

use patchwright_core::error::{ConfigError, ModelError};
use patchwright_core::message::Message;
use patchwright_core::stats::ApiStats;
use patchwright_core::trajectory::{AgentInfo, TrajectoryStep};
use patchwright_providers::ModelClient;

use crate::config::ModelConfig;

const DEFAULT_REVIEWER_SYSTEM: &str = "\
You are a strict reviewer of automated software-engineering agents. Given
a task and the transcript of one attempt at it, judge whether the attempt
actually solved the task.";

const DEFAULT_REVIEWER_INSTANCE: &str = "\
TASK:
{{problem_statement}}

ATTEMPT TRANSCRIPT:
{{trajectory}}

FINAL SUBMISSION:
{{submission}}

Reason about whether the submission solves the task, then answer on the
last line with exactly one word: success or failure.";

const DEFAULT_COMPARISON_SYSTEM: &str = "\
You compare two attempts at the same software-engineering task and pick
the one more likely to be correct.";

const DEFAULT_COMPARISON_INSTANCE: &str = "\
TASK:
{{problem_statement}}

FIRST ATTEMPT:
{{first_trajectory}}

FIRST SUBMISSION:
{{first_submission}}

SECOND ATTEMPT:
{{second_trajectory}}

SECOND SUBMISSION:
{{second_submission}}

Reason about which attempt is better, then answer on the last line with
exactly one word: first or second.";

const DEFAULT_ITEM_TEMPLATE: &str = "Model: {{response}}\n\nObservation: {{observation}}";

const DEFAULT_FORWARDED_TEMPLATE: &str = "\
ATTEMPT {{index}} (rejected):
SUBMISSION:
{{submission}}
REVIEW:
{{review}}";

/// One completed attempt as the judges see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub trajectory: Vec<TrajectoryStep>,
    pub info: AgentInfo,
}

/// Renders a trajectory into the text block judge prompts embed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrajectoryFormatterConfig {
    /// Steps whose action starts with one of these prefixes are dropped.
    pub filter: Vec<String>,
    /// Per-step template; sees `response`, `observation`, `action`,
    /// `thought`, and `i_step`.
    pub item_template: String,
    /// When > 0, only the last n surviving steps keep their observation.
    pub only_show_last_n_output: usize,
}

impl Default for TrajectoryFormatterConfig {
    fn default() -> Self {
        Self {
            filter: Vec::new(),
            item_template: DEFAULT_ITEM_TEMPLATE.into(),
            only_show_last_n_output: 0,
        }
    }
}

impl TrajectoryFormatterConfig {
    pub fn format_trajectory(&self, steps: &[TrajectoryStep]) -> String {
        let kept: Vec<&TrajectoryStep> = steps
            .iter()
            .filter(|step| {
                let action = step.action.trim();
                !self.filter.iter().any(|prefix| action.starts_with(prefix.as_str()))
            })
            .collect();
        let total = kept.len();
        kept.iter()
            .enumerate()
            .map(|(i_step, step)| {
                let observation = if self.only_show_last_n_output > 0
                    && i_step + self.only_show_last_n_output < total
                {
                    "[Output omitted]".to_string()
                } else {
                    step.observation.clone()
                };
                Environment::new()
                    .render_str(
                        &self.item_template,
                        context! {
                            response => step.response.clone(),
                            observation => observation.clone(),
                            action => step.action.clone(),
                            thought => step.thought.clone(),
                            i_step => i_step,
                        },
                    )
                    .unwrap_or_else(|_| {
                        format!("Model: {}\n\nObservation: {}", step.response, observation)
                    })
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Accept/reject judge prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReviewerConfig {
    pub system_template: String,
    pub instance_template: String,
    pub traj_formatter: TrajectoryFormatterConfig,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            system_template: DEFAULT_REVIEWER_SYSTEM.into(),
            instance_template: DEFAULT_REVIEWER_INSTANCE.into(),
            traj_formatter: TrajectoryFormatterConfig::default(),
        }
    }
}

/// Pairwise comparison judge prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComparisonConfig {
    pub system_template: String,
    pub instance_template: String,
    pub traj_formatter: TrajectoryFormatterConfig,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            system_template: DEFAULT_COMPARISON_SYSTEM.into(),
            instance_template: DEFAULT_COMPARISON_INSTANCE.into(),
            traj_formatter: TrajectoryFormatterConfig::default(),
        }
    }
}

/// Review loop knobs. Validated before the first attempt starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReviewConfig {
    /// Judge model; the agent's own model config when omitted.
    pub model: Option<ModelConfig>,
    pub reviewer: ReviewerConfig,
    pub comparison: ComparisonConfig,
    /// Hard ceiling on attempts.
    pub max_samples: u32,
    /// Minimum attempts before an accepted one may end the loop.
    pub min_draws: u32,
    /// Stop once this many attempts were accepted; 0 disables.
    pub max_accepted_draws: u32,
    /// Desk-reject attempts that ran into the cost limit.
    pub reject_exit_cost: bool,
    /// Forward rejected-attempt summaries into the next attempt's
    /// instance prompt.
    pub forward_rejected: bool,
    /// Per-attempt summary template; sees `index`, `submission`, `review`.
    pub forwarded_template: String,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            model: None,
            reviewer: ReviewerConfig::default(),
            comparison: ComparisonConfig::default(),
            max_samples: 2,
            min_draws: 1,
            max_accepted_draws: 0,
            reject_exit_cost: true,
            forward_rejected: false,
            forwarded_template: DEFAULT_FORWARDED_TEMPLATE.into(),
        }
    }
}

impl ReviewConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_draws < 1 {
            return Err(ConfigError::InvalidValue {
                field: "review.min_draws".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.max_samples < self.min_draws {
            return Err(ConfigError::InvalidValue {
                field: "review.max_samples".into(),
                reason: format!("must be >= min_draws ({})", self.min_draws),
            });
        }
        if self.max_accepted_draws > self.min_draws {
            return Err(ConfigError::InvalidValue {
                field: "review.max_accepted_draws".into(),
                reason: format!("must be <= min_draws ({})", self.min_draws),
            });
        }
        Ok(())
    }
}

/// A single judge verdict, kept with the raw output and the exact
/// messages that produced it. Desk rejects carry no messages.
#[derive(Debug, Clone)]
pub struct ReviewerResult {
    pub accept: bool,
    pub output: String,
    pub messages: Vec<Message>,
}

/// A single pairwise verdict: 0 keeps the current best, 1 promotes the
/// challenger.
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub choice: usize,
    pub output: String,
    pub messages: Vec<Message>,
}

/// Tracks submissions, verdicts, and the running best across one
/// instance's attempts.
pub struct ReviewLoop {
    config: ReviewConfig,
    client: ModelClient,
    problem_statement: String,
    submissions: Vec<ReviewSubmission>,
    reviews: Vec<ReviewerResult>,
    comparisons: Vec<(usize, usize, ComparisonResult)>,
    best_idx: usize,
}

impl ReviewLoop {
    pub fn build(
        config: ReviewConfig,
        fallback_model: &ModelConfig,
        problem_statement: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let templates = [
            ("review.reviewer.system_template", &config.reviewer.system_template),
            ("review.reviewer.instance_template", &config.reviewer.instance_template),
            ("review.comparison.system_template", &config.comparison.system_template),
            ("review.comparison.instance_template", &config.comparison.instance_template),
            ("review.forwarded_template", &config.forwarded_template),
        ];
        for (name, source) in templates {
            let env = Environment::new();
            env.template_from_str(source)
                .map_err(|err| ConfigError::InvalidTemplate {
                    name: name.into(),
                    reason: err.to_string(),
                })?;
        }
        let model = config.model.clone().unwrap_or_else(|| fallback_model.clone());
        let client = model.build_client()?;
        Ok(Self {
            config,
            client,
            problem_statement: problem_statement.into(),
            submissions: Vec::new(),
            reviews: Vec::new(),
            comparisons: Vec::new(),
            best_idx: 0,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.submissions.len()
    }

    fn n_accepted(&self) -> u32 {
        self.reviews.iter().filter(|r| r.accept).count() as u32
    }

    pub fn best_index(&self) -> usize {
        self.best_idx
    }

    pub fn reviews(&self) -> &[ReviewerResult] {
        &self.reviews
    }

    /// Judge-settled comparisons as (best index, challenger index, verdict).
    pub fn comparisons(&self) -> &[(usize, usize, ComparisonResult)] {
        &self.comparisons
    }

    pub fn stats(&self) -> &ApiStats {
        self.client.stats()
    }

    /// Judges a finished attempt and settles the running best.
    pub async fn on_submit(&mut self, submission: ReviewSubmission) -> Result<(), ModelError> {
        let review = self.review(&submission).await?;
        info!(
            sample = self.submissions.len() + 1,
            accept = review.accept,
            "submission reviewed"
        );
        self.submissions.push(submission);
        self.reviews.push(review);
        if self.submissions.len() > 1 {
            self.compare().await?;
        }
        Ok(())
    }

    async fn review(&mut self, submission: &ReviewSubmission) -> Result<ReviewerResult, ModelError> {
        let Some(status) = submission.info.exit_status else {
            return Ok(ReviewerResult {
                accept: false,
                output: "No exit status recorded; rejected without review.".into(),
                messages: Vec::new(),
            });
        };
        if self.config.reject_exit_cost && status.to_string().contains("exit_cost") {
            return Ok(ReviewerResult {
                accept: false,
                output: format!("Rejected without review: run ended with '{status}'."),
                messages: Vec::new(),
            });
        }
        let trajectory = self
            .config
            .reviewer
            .traj_formatter
            .format_trajectory(&submission.trajectory);
        let mut ctx = JsonMap::new();
        ctx.insert(
            "problem_statement".into(),
            JsonValue::String(self.problem_statement.clone()),
        );
        ctx.insert("trajectory".into(), JsonValue::String(trajectory));
        ctx.insert(
            "submission".into(),
            JsonValue::String(submission.info.submission.clone().unwrap_or_default()),
        );
        ctx.insert("exit_status".into(), JsonValue::String(status.to_string()));
        let messages = vec![
            Message::system(render(&self.config.reviewer.system_template, &ctx)),
            Message::user(render(&self.config.reviewer.instance_template, &ctx)),
        ];
        let output = self.client.query(&messages).await?;
        debug!(output = %output.text, "reviewer answered");
        let accept = interpret_review(&output.text);
        Ok(ReviewerResult {
            accept,
            output: output.text,
            messages,
        })
    }

    async fn compare(&mut self) -> Result<(), ModelError> {
        let latest = self.submissions.len() - 1;
        let best_accepted = self.reviews[self.best_idx].accept;
        let latest_accepted = self.reviews[latest].accept;
        // When exactly one of the pair is accepted it wins outright.
        let choice = if best_accepted && !latest_accepted {
            0
        } else if !best_accepted && latest_accepted {
            1
        } else {
            let messages = self.comparison_messages(self.best_idx, latest);
            let output = self.client.query(&messages).await?;
            debug!(output = %output.text, "comparison answered");
            let choice = interpret_comparison(&output.text);
            self.comparisons.push((
                self.best_idx,
                latest,
                ComparisonResult {
                    choice,
                    output: output.text,
                    messages,
                },
            ));
            choice
        };
        self.best_idx = [self.best_idx, latest][choice];
        info!(best = self.best_idx, "running best settled");
        Ok(())
    }

    fn comparison_messages(&self, first: usize, second: usize) -> Vec<Message> {
        let formatter = &self.config.comparison.traj_formatter;
        let mut ctx = JsonMap::new();
        ctx.insert(
            "problem_statement".into(),
            JsonValue::String(self.problem_statement.clone()),
        );
        for (prefix, idx) in [("first", first), ("second", second)] {
            let submission = &self.submissions[idx];
            ctx.insert(
                format!("{prefix}_trajectory"),
                JsonValue::String(formatter.format_trajectory(&submission.trajectory)),
            );
            ctx.insert(
                format!("{prefix}_submission"),
                JsonValue::String(submission.info.submission.clone().unwrap_or_default()),
            );
        }
        vec![
            Message::system(render(&self.config.comparison.system_template, &ctx)),
            Message::user(render(&self.config.comparison.instance_template, &ctx)),
        ]
    }

    /// Whether the loop wants another attempt.
    pub fn keep_sampling(&self) -> bool {
        let n_samples = self.submissions.len() as u32;
        if n_samples >= self.config.max_samples {
            return false;
        }
        if self.reviews.last().is_some_and(|r| r.accept) && n_samples >= self.config.min_draws {
            return false;
        }
        if self.config.max_accepted_draws > 0 && self.n_accepted() >= self.config.max_accepted_draws
        {
            return false;
        }
        true
    }

    /// Rendered summaries of every rejected attempt so far, for the next
    /// attempt's instance prompt. Empty when forwarding is off.
    pub fn forwarded_context(&self) -> String {
        if !self.config.forward_rejected {
            return String::new();
        }
        let mut parts = Vec::new();
        for (idx, (submission, review)) in
            self.submissions.iter().zip(&self.reviews).enumerate()
        {
            if review.accept {
                continue;
            }
            let rendered = Environment::new()
                .render_str(
                    &self.config.forwarded_template,
                    context! {
                        index => idx + 1,
                        submission => submission.info.submission.clone().unwrap_or_default(),
                        review => review.output.clone(),
                    },
                )
                .unwrap_or_default();
            parts.push(rendered);
        }
        parts.join("\n\n")
    }
}

fn render(source: &str, ctx: &JsonMap<String, JsonValue>) -> String {
    Environment::new()
        .render_str(source, ctx)
        .unwrap_or_else(|_| source.to_string())
}

fn interpret_review(response: &str) -> bool {
    let last_line = response.trim().lines().last().unwrap_or("").to_lowercase();
    if last_line.contains("success") {
        return true;
    }
    if last_line.contains("fail") {
        return false;
    }
    warn!(%last_line, "could not interpret reviewer verdict, rejecting");
    false
}

fn interpret_comparison(response: &str) -> usize {
    let last_line = response.trim().lines().last().unwrap_or("").to_lowercase();
    let first = last_line.contains("first");
    let second = last_line.contains("second");
    if first && !second {
        return 0;
    }
    if second && !first {
        return 1;
    }
    warn!(%last_line, "could not interpret comparison verdict, keeping current best");
    0
}
