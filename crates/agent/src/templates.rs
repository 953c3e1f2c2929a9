//! Prompt templates.
//!
//! Every string the model sees is rendered from a minijinja template
//! against one flat context: the problem statement, the command docs, the
//! tool environment variables, the current sandbox state variables, and
//! the previous observation. Templates are compile-checked at build time
//! so a typo fails the run before the first model call.

use std::path::PathBuf;

use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use patchwright_core::error::ConfigError;

/// The flat key/value context a template is rendered against.
pub type TemplateContext = JsonMap<String, JsonValue>;

const DEFAULT_SYSTEM: &str = "\
You are an autonomous programmer working in a sandboxed shell session.

COMMANDS:
{{command_docs}}

Respond with a short DISCUSSION of what you are going to do, followed by
exactly one command to run, wrapped in triple backticks. Issue exactly one
command per response and wait for its output before the next one.";

const DEFAULT_INSTANCE: &str = "\
We're currently solving the following task:

TASK:
{{problem_statement}}
{% if forwarded_attempts %}
Your earlier attempts at this task were rejected by a reviewer:

{{forwarded_attempts}}
{% endif %}
Work step by step. When you are confident the task is solved, run the
`{{submit_command}}` command.";

const DEFAULT_NEXT_STEP: &str = "Observation: {{observation}}";

const DEFAULT_NEXT_STEP_NO_OUTPUT: &str =
    "Your command ran successfully and did not produce any output.";

const DEFAULT_DEMONSTRATION: &str = "\
Here is a demonstration of how to correctly accomplish a similar task.
It is included to show you how to correctly use the interface.
You do not need to follow exactly what is done in the demonstration.
--- DEMONSTRATION ---
{{demonstration}}
--- END OF DEMONSTRATION ---";

/// Template sources plus the demonstration wiring, straight from the
/// config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplateConfig {
    pub system_template: String,
    pub instance_template: String,
    pub next_step_template: String,
    pub next_step_no_output_template: String,
    pub demonstration_template: String,
    /// Trajectory files replayed as few-shot examples at startup.
    pub demonstrations: Vec<PathBuf>,
    /// Inject demonstration turns individually instead of collapsing each
    /// file into one user message.
    pub put_demos_in_history: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            system_template: DEFAULT_SYSTEM.into(),
            instance_template: DEFAULT_INSTANCE.into(),
            next_step_template: DEFAULT_NEXT_STEP.into(),
            next_step_no_output_template: DEFAULT_NEXT_STEP_NO_OUTPUT.into(),
            demonstration_template: DEFAULT_DEMONSTRATION.into(),
            demonstrations: Vec::new(),
            put_demos_in_history: false,
        }
    }
}

/// Compile-checked template set.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    config: TemplateConfig,
}

impl TemplateSet {
    pub fn build(config: TemplateConfig) -> Result<Self, ConfigError> {
        let sources = [
            ("system_template", &config.system_template),
            ("instance_template", &config.instance_template),
            ("next_step_template", &config.next_step_template),
            (
                "next_step_no_output_template",
                &config.next_step_no_output_template,
            ),
            ("demonstration_template", &config.demonstration_template),
        ];
        for (name, source) in sources {
            let env = Environment::new();
            env.template_from_str(source)
                .map_err(|err| ConfigError::InvalidTemplate {
                    name: name.into(),
                    reason: err.to_string(),
                })?;
        }
        if !config.demonstrations.is_empty()
            && !config.put_demos_in_history
            && config.demonstration_template.trim().is_empty()
        {
            return Err(ConfigError::InvalidValue {
                field: "templates.demonstration_template".into(),
                reason: "required when demonstrations are collapsed into one message".into(),
            });
        }
        Ok(Self { config })
    }

    pub fn demonstrations(&self) -> &[PathBuf] {
        &self.config.demonstrations
    }

    pub fn put_demos_in_history(&self) -> bool {
        self.config.put_demos_in_history
    }

    pub fn system(&self, ctx: &TemplateContext) -> Result<String, ConfigError> {
        render("system_template", &self.config.system_template, ctx)
    }

    pub fn instance(&self, ctx: &TemplateContext) -> Result<String, ConfigError> {
        render("instance_template", &self.config.instance_template, ctx)
    }

    pub fn next_step(&self, ctx: &TemplateContext) -> Result<String, ConfigError> {
        render("next_step_template", &self.config.next_step_template, ctx)
    }

    pub fn next_step_no_output(&self, ctx: &TemplateContext) -> Result<String, ConfigError> {
        render(
            "next_step_no_output_template",
            &self.config.next_step_no_output_template,
            ctx,
        )
    }

    pub fn demonstration(&self, transcript: &str) -> Result<String, ConfigError> {
        let mut ctx = TemplateContext::new();
        ctx.insert("demonstration".into(), JsonValue::String(transcript.into()));
        render(
            "demonstration_template",
            &self.config.demonstration_template,
            &ctx,
        )
    }
}

fn render(name: &str, source: &str, ctx: &TemplateContext) -> Result<String, ConfigError> {
    Environment::new()
        .render_str(source, ctx)
        .map_err(|err| ConfigError::InvalidTemplate {
            name: name.into(),
            reason: err.to_string(),
        })
}
