//! The agent control loop.
//!
//! One `Agent` owns one run: it installs the tool catalog into the
//! sandbox, builds the prompt history, and then cycles
//! query → parse → validate → execute until the model submits or a limit
//! forces termination. The trajectory file is rewritten after every step,
//! so a killed process loses at most the in-flight step.
//!
//! Malformed output and blocked actions share one requery budget; the
//! correction turns ride only on the in-flight prompt and never enter the
//! permanent history. When a cost, context, API, or format limit ends the
//! run, the loop makes one salvage attempt at the submit command before
//! recording the exit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use minijinja::{context, Environment};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use patchwright_core::error::{ConfigError, Error, FormatError, ModelError, Result};
use patchwright_core::exit::{ExitReason, ExitStatus};
use patchwright_core::message::{HistoryItem, Message, Role};
use patchwright_core::model::ModelOutput;
use patchwright_core::sandbox::Sandbox;
use patchwright_core::stats::ApiStats;
use patchwright_core::trajectory::{AgentInfo, TrajectoryRecord, TrajectoryStep};
use patchwright_parsers::ActionParser;
use patchwright_providers::ModelClient;
use patchwright_tools::Catalog;

use crate::config::AgentConfig;
use crate::history::{self, HistoryProcessor};
use crate::templates::{TemplateContext, TemplateSet};

/// What one finished run hands back to its caller.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_status: ExitStatus,
    pub submission: Option<String>,
    pub stats: ApiStats,
    pub record: TrajectoryRecord,
}

/// A registered sub-agent the model can dispatch to by name.
struct Subroutine {
    name: String,
    init_command: Option<String>,
    env_variables: Vec<String>,
    config: AgentConfig,
}

/// A forced termination: the reason plus the synthetic turn recorded
/// for it.
struct Forced {
    reason: ExitReason,
    thought: String,
    action: String,
    response: String,
}

impl Forced {
    /// The synthetic assistant content defaults to the thought; the format
    /// exit overrides it with the last malformed model output.
    fn new(reason: ExitReason, thought: impl Into<String>) -> Self {
        let thought = thought.into();
        Self {
            reason,
            response: thought.clone(),
            action: reason.as_str().to_string(),
            thought,
        }
    }

    fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    fn environment(detail: &str) -> Self {
        Self::new(
            ExitReason::Environment,
            format!("Exit due to environment error: {detail}"),
        )
    }

    fn from_model_error(err: &ModelError) -> Self {
        match err {
            ModelError::InstanceCostLimitExceeded { .. } => {
                Self::new(ExitReason::Cost, "Exit due to cost limit")
            }
            ModelError::TotalCostLimitExceeded { .. } => {
                Self::new(ExitReason::TotalCost, "Exit due to total cost limit")
            }
            ModelError::ContextWindowExceeded { .. } => {
                Self::new(ExitReason::Context, "Exit due to context window")
            }
            other => Self::new(ExitReason::Api, format!("Exit due to API error: {other}")),
        }
    }

    /// Whether a best-effort autosubmission may upgrade this exit.
    fn salvageable(&self) -> bool {
        !matches!(self.reason, ExitReason::Environment)
    }
}

enum StepFlow {
    Continue,
    Done(RunResult),
}

/// One agent instance: built once from config, runs one instance to
/// completion.
pub struct Agent {
    name: String,
    client: ModelClient,
    catalog: Catalog,
    parser: ActionParser,
    templates: TemplateSet,
    demos: Vec<HistoryItem>,
    history_processors: Vec<HistoryProcessor>,
    max_requeries: u32,
    format_error_template: String,
    subroutines: Vec<Subroutine>,
    max_subroutine_depth: u32,
    depth: u32,

    problem_statement: String,
    forwarded_attempts: String,
    last_observation: String,
    history: Vec<HistoryItem>,
    trajectory: Vec<TrajectoryStep>,
    info: AgentInfo,
    trajectory_path: Option<PathBuf>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn from_config(config: AgentConfig) -> std::result::Result<Self, ConfigError> {
        if !config.tools.enable_bash_tool && !config.parser.is_structured() {
            return Err(ConfigError::InvalidValue {
                field: "tools.enable_bash_tool".into(),
                reason: "the bash tool can only be disabled with the function_calling or json parser"
                    .into(),
            });
        }
        let client = config.model.build_client()?;
        let catalog = Catalog::build(config.tools)?;
        let client = if config.parser.uses_function_calling() {
            client.with_tools(catalog.tool_specs())
        } else {
            client
        };
        let format_error_template = catalog
            .config()
            .format_error_template
            .clone()
            .unwrap_or_else(|| config.parser.format_error_template().to_string());

        let templates = TemplateSet::build(config.templates)?;
        let demos = load_demonstrations(&templates, &config.name)?;

        for processor in &config.history_processors {
            processor.validate()?;
        }

        let mut subroutines = Vec::new();
        for sub in config.subroutines {
            if subroutines.iter().any(|s: &Subroutine| s.name == sub.name) {
                return Err(ConfigError::InvalidValue {
                    field: "subroutines".into(),
                    reason: format!("duplicate subroutine name '{}'", sub.name),
                });
            }
            // Child configs must be buildable now, not when first dispatched.
            Agent::from_config((*sub.agent).clone())?;
            subroutines.push(Subroutine {
                name: sub.name,
                init_command: sub.init_command,
                env_variables: sub.env_variables,
                config: *sub.agent,
            });
        }

        Ok(Self {
            name: config.name,
            client,
            catalog,
            parser: config.parser,
            templates,
            demos,
            history_processors: config.history_processors,
            max_requeries: config.max_requeries,
            format_error_template,
            subroutines,
            max_subroutine_depth: config.max_subroutine_depth,
            depth: 0,
            problem_statement: String::new(),
            forwarded_attempts: String::new(),
            last_observation: String::new(),
            history: Vec::new(),
            trajectory: Vec::new(),
            info: AgentInfo::default(),
            trajectory_path: None,
        })
    }

    /// Seeds the cross-attempt total spend before the run starts.
    pub fn carry_total_cost(&mut self, total_cost: f64) {
        self.client.absorb_stats(&ApiStats {
            total_cost,
            ..ApiStats::default()
        });
    }

    /// Makes rejected-attempt summaries available to the instance prompt.
    pub fn forward_rejected_attempts(&mut self, rendered: impl Into<String>) {
        self.forwarded_attempts = rendered.into();
    }

    pub fn stats(&self) -> &ApiStats {
        self.client.stats()
    }

    /// Runs the loop to completion against an already started sandbox
    /// session. The returned result is also persisted to
    /// `trajectory_path` when one is given.
    pub async fn run(
        &mut self,
        sandbox: &mut dyn Sandbox,
        problem_statement: &str,
        trajectory_path: Option<&Path>,
    ) -> Result<RunResult> {
        self.run_boxed(sandbox, problem_statement, None, trajectory_path)
            .await
    }

    /// Boxed entry point; breaks the future cycle for sub-agent recursion.
    fn run_boxed<'a>(
        &'a mut self,
        sandbox: &'a mut dyn Sandbox,
        problem_statement: &'a str,
        initial_observation: Option<String>,
        trajectory_path: Option<&'a Path>,
    ) -> BoxFuture<'a, Result<RunResult>> {
        async move {
            self.run_impl(sandbox, problem_statement, initial_observation, trajectory_path)
                .await
        }
        .boxed()
    }

    async fn run_impl(
        &mut self,
        sandbox: &mut dyn Sandbox,
        problem_statement: &str,
        initial_observation: Option<String>,
        trajectory_path: Option<&Path>,
    ) -> Result<RunResult> {
        self.problem_statement = problem_statement.to_string();
        self.last_observation = initial_observation.unwrap_or_default();
        self.trajectory_path = trajectory_path.map(Path::to_path_buf);
        self.history.clear();
        self.trajectory.clear();
        self.info = AgentInfo::default();

        info!(
            agent = %self.name,
            model = self.client.model_name(),
            "starting run"
        );

        let ctx = self.template_ctx(&BTreeMap::new());
        let system = self.templates.system(&ctx)?;
        self.history.push(HistoryItem::system(system, &self.name));
        let demos = self.demos.clone();
        self.history.extend(demos);
        self.save_record()?;

        if let Err(err) = self.catalog.install(sandbox).await {
            error!(error = %err, "tool installation failed");
            let forced = Forced::environment(&err.to_string());
            self.push_synthetic_assistant(&forced);
            return self.finish(sandbox, forced, BTreeMap::new()).await;
        }

        loop {
            match self.step(sandbox).await? {
                StepFlow::Continue => {}
                StepFlow::Done(result) => return Ok(result),
            }
        }
    }

    async fn step(&mut self, sandbox: &mut dyn Sandbox) -> Result<StepFlow> {
        // A dead session at the state probe ends the run; there is nothing
        // left to salvage a submission from.
        let state = match self.catalog.state(sandbox).await {
            Ok(state) => state,
            Err(err) => {
                error!(error = %err, "state probe failed");
                let forced = Forced::environment(&err.to_string());
                self.push_synthetic_assistant(&forced);
                return self.finish(sandbox, forced, BTreeMap::new()).await.map(StepFlow::Done);
            }
        };

        self.push_user_turn(&state)?;

        let (thought, action, output) = match self.query_and_parse().await {
            Ok(parsed) => parsed,
            Err(forced) => {
                self.push_synthetic_assistant(&forced);
                return self.finish(sandbox, forced, state).await.map(StepFlow::Done);
            }
        };

        let mut assistant =
            HistoryItem::assistant(&output.text, &self.name).with_thought_action(&thought, &action);
        if !output.tool_calls.is_empty() {
            assistant = assistant.with_tool_calls(output.tool_calls.clone());
        }
        self.history.push(assistant);
        debug!(action = %action, "executing action");

        let started = Instant::now();
        let first_token = action.split_whitespace().next().unwrap_or("").to_string();
        let observation = if self.subroutines.iter().any(|s| s.name == first_token) {
            match self.call_subroutine(sandbox, &first_token, &action).await {
                Ok(observation) => observation,
                Err(err) => {
                    error!(error = %err, subroutine = %first_token, "subroutine dispatch failed");
                    let forced = Forced::environment(&err.to_string());
                    return self.finish(sandbox, forced, state).await.map(StepFlow::Done);
                }
            }
        } else {
            let guarded = self.catalog.guard_multiline_input(&action);
            match sandbox.execute(&guarded, self.catalog.execution_timeout()).await {
                Ok(result) => result.output,
                Err(err) if err.is_timeout() => {
                    warn!(action = %action, "command timed out, session recovered");
                    format!(
                        "EXECUTION TIMED OUT: the command was interrupted after {}s.",
                        self.catalog.execution_timeout().as_secs()
                    )
                }
                Err(err) => {
                    error!(error = %err, "sandbox session failed");
                    let forced = Forced::environment(&err.to_string());
                    return self.finish(sandbox, forced, state).await.map(StepFlow::Done);
                }
            }
        };
        let execution_time = started.elapsed().as_secs_f64();

        let mut submitted = false;
        if first_token == self.catalog.submit_command() {
            if let Some(found) = self.catalog.extract_submission(&observation) {
                self.info.submission = Some(found);
                submitted = true;
            }
        }

        self.trajectory.push(TrajectoryStep {
            action: action.clone(),
            observation: observation.clone(),
            response: output.text.clone(),
            state,
            thought,
            execution_time,
        });

        if submitted {
            self.info.exit_status = Some(ExitStatus::Submitted);
            self.save_record()?;
            info!(steps = self.trajectory.len(), "submitted");
            return Ok(StepFlow::Done(self.result(ExitStatus::Submitted)));
        }

        self.last_observation = observation;
        self.save_record()?;
        Ok(StepFlow::Continue)
    }

    /// Appends the user turn for the upcoming query: the instance prompt
    /// on the first step, afterwards the previous observation through the
    /// next-step templates.
    fn push_user_turn(&mut self, state: &BTreeMap<String, String>) -> Result<()> {
        let ctx = self.template_ctx_with(state, &self.last_observation.clone());
        let content = match self.history.last() {
            Some(last) if last.role == Role::System || last.is_demo => {
                self.templates.instance(&ctx)?
            }
            _ if self.last_observation.trim().is_empty() => {
                self.templates.next_step_no_output(&ctx)?
            }
            _ => self.templates.next_step(&ctx)?,
        };
        let mut turn = HistoryItem::user(content, &self.name);
        if let Some(prev) = self.history.last() {
            if prev.role == Role::Assistant && !prev.tool_calls.is_empty() {
                turn.role = Role::Tool;
                turn.tool_call_ids = prev.tool_calls.iter().map(|c| c.id.clone()).collect();
            }
        }
        self.history.push(turn);
        Ok(())
    }

    /// Queries the model and parses the response, requerying on malformed
    /// output or blocked actions until the shared budget runs out.
    async fn query_and_parse(
        &mut self,
    ) -> std::result::Result<(String, String, ModelOutput), Forced> {
        let base: Vec<Message> = history::compact(&self.history_processors, &self.history)
            .iter()
            .map(HistoryItem::to_message)
            .collect();

        let mut output = self
            .client
            .query(&base)
            .await
            .map_err(|err| Forced::from_model_error(&err))?;
        let mut fails = 0u32;
        loop {
            let correction = match self.parser.parse(&output, self.catalog.commands()) {
                Ok((thought, action)) => {
                    if self.catalog.should_block(&action) {
                        warn!(action = %action, "action is blocked");
                        self.catalog.blocklist_error(&action)
                    } else {
                        return Ok((thought, action, output));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "malformed model output");
                    self.render_format_error(&err)
                }
            };

            fails += 1;
            if fails >= self.max_requeries {
                warn!(fails, "requery budget exhausted");
                return Err(Forced::new(ExitReason::Format, "Exit due to format error")
                    .with_response(output.text));
            }
            // The failed turn and its correction ride only on this query.
            let mut messages = base.clone();
            messages.push(Message::assistant(&output.text));
            messages.push(Message::user(correction));
            output = self
                .client
                .query(&messages)
                .await
                .map_err(|err| Forced::from_model_error(&err))?;
        }
    }

    fn render_format_error(&self, err: &FormatError) -> String {
        let error_code = err.code.as_ref().map(|c| c.as_str()).unwrap_or("");
        Environment::new()
            .render_str(
                &self.format_error_template,
                context! {
                    command_docs => self.catalog.command_docs(),
                    error_code => error_code,
                    exception_message => err.message.clone(),
                },
            )
            .unwrap_or_else(|_| self.format_error_template.clone())
    }

    /// Runs a registered sub-agent and returns its submission as this
    /// step's observation. The parent's working directory and the named
    /// environment variables are restored afterwards.
    async fn call_subroutine(
        &mut self,
        sandbox: &mut dyn Sandbox,
        name: &str,
        action: &str,
    ) -> Result<String> {
        let Some(sub) = self.subroutines.iter().find(|s| s.name == name) else {
            return Err(Error::Internal(format!("unregistered subroutine '{name}'")));
        };
        if self.depth + 1 > self.max_subroutine_depth {
            warn!(subroutine = %name, depth = self.depth, "subroutine nesting limit reached");
            return Ok(format!(
                "Subroutine '{name}' was not started: the nesting depth limit is {}.",
                self.max_subroutine_depth
            ));
        }
        let init_command = sub.init_command.clone();
        let env_variables = sub.env_variables.clone();
        let config = sub.config.clone();
        let args = action[name.len()..].trim().to_string();
        let timeout = self.catalog.execution_timeout();

        // Snapshot everything the child may clobber.
        let cwd = sandbox.execute("pwd -P", timeout).await?.output.trim().to_string();
        let mut saved = Vec::with_capacity(env_variables.len());
        for var in &env_variables {
            let value = sandbox
                .execute(&format!("echo \"${{{var}}}\""), timeout)
                .await?
                .output
                .trim_end_matches('\n')
                .to_string();
            saved.push((var.clone(), value));
        }

        let initial_observation = match &init_command {
            Some(template) => {
                let rendered = Environment::new()
                    .render_str(template, context! { args => args.clone() })
                    .map_err(|err| {
                        Error::Internal(format!("init command for '{name}' failed to render: {err}"))
                    })?;
                let result = sandbox.execute(&rendered, timeout).await?;
                if !result.success() {
                    return Ok(format!(
                        "Subroutine '{name}' initialization failed:\n{}",
                        result.output
                    ));
                }
                Some(result.output)
            }
            None => None,
        };

        info!(subroutine = %name, args = %args, "dispatching subroutine");
        let mut child = Agent::from_config(config)?;
        child.depth = self.depth + 1;
        child.carry_total_cost(self.client.stats().total_cost);
        let outcome = child.run_boxed(sandbox, &args, initial_observation, None).await;

        // Restore the parent's view of the world before inspecting the
        // outcome, even when the child failed.
        sandbox
            .execute(&format!("cd '{}'", shell_escape(&cwd)), timeout)
            .await?;
        for (var, value) in saved {
            sandbox
                .execute(&format!("export {var}='{}'", shell_escape(&value)), timeout)
                .await?;
        }

        // The child spends against the shared total; its own spend is its
        // instance cost, which the parent absorbs exactly once.
        let child_stats = child.stats().clone();
        self.client.absorb_stats(&ApiStats {
            total_cost: child_stats.instance_cost,
            instance_cost: child_stats.instance_cost,
            tokens_sent: child_stats.tokens_sent,
            tokens_received: child_stats.tokens_received,
            api_calls: child_stats.api_calls,
        });

        let result = outcome?;
        info!(subroutine = %name, status = %result.exit_status, "subroutine returned");
        Ok(result.submission.unwrap_or_else(|| {
            format!(
                "Subroutine '{name}' finished ({}) without a submission.",
                result.exit_status
            )
        }))
    }

    fn push_synthetic_assistant(&mut self, forced: &Forced) {
        self.history.push(
            HistoryItem::assistant(&forced.response, &self.name)
                .with_thought_action(&forced.thought, &forced.action),
        );
    }

    /// Records a forced termination, after one salvage attempt at the
    /// submit command where the exit reason allows it.
    async fn finish(
        &mut self,
        sandbox: &mut dyn Sandbox,
        forced: Forced,
        state: BTreeMap<String, String>,
    ) -> Result<RunResult> {
        let mut status = ExitStatus::Exited(forced.reason);
        let mut observation = format!("Exited ({})", forced.reason);
        if forced.salvageable() {
            if let Some(submission) = self.try_autosubmit(sandbox).await {
                info!(reason = %forced.reason, "autosubmission salvaged the run");
                self.info.submission = Some(submission);
                status = ExitStatus::AutoSubmitted(forced.reason);
                observation = "Exited (autosubmitted)".to_string();
            }
        }
        self.trajectory.push(TrajectoryStep {
            action: forced.action,
            observation,
            response: forced.response,
            state,
            thought: forced.thought,
            execution_time: 0.0,
        });
        self.info.exit_status = Some(status);
        self.save_record()?;
        let stats = self.client.stats();
        error!(
            status = %status,
            instance_cost = stats.instance_cost,
            api_calls = stats.api_calls,
            "run terminated"
        );
        Ok(self.result(status))
    }

    async fn try_autosubmit(&mut self, sandbox: &mut dyn Sandbox) -> Option<String> {
        let submit = self.catalog.submit_command().to_string();
        match sandbox.execute(&submit, self.catalog.execution_timeout()).await {
            Ok(result) => self.catalog.extract_submission(&result.output),
            Err(err) => {
                warn!(error = %err, "autosubmission attempt failed");
                None
            }
        }
    }

    fn template_ctx(&self, state: &BTreeMap<String, String>) -> TemplateContext {
        self.template_ctx_with(state, "")
    }

    fn template_ctx_with(
        &self,
        state: &BTreeMap<String, String>,
        observation: &str,
    ) -> TemplateContext {
        let mut ctx = TemplateContext::new();
        for (key, value) in &self.catalog.config().env_variables {
            ctx.insert(key.clone(), JsonValue::String(value.clone()));
        }
        for (key, value) in state {
            ctx.insert(key.clone(), JsonValue::String(value.clone()));
        }
        ctx.insert(
            "command_docs".into(),
            JsonValue::String(self.catalog.command_docs().to_string()),
        );
        ctx.insert(
            "submit_command".into(),
            JsonValue::String(self.catalog.submit_command().to_string()),
        );
        ctx.insert(
            "problem_statement".into(),
            JsonValue::String(self.problem_statement.clone()),
        );
        ctx.insert(
            "observation".into(),
            JsonValue::String(observation.to_string()),
        );
        ctx.insert(
            "forwarded_attempts".into(),
            JsonValue::String(self.forwarded_attempts.clone()),
        );
        ctx
    }

    fn record(&self) -> TrajectoryRecord {
        let mut info = self.info.clone();
        info.model_stats = self.client.stats().clone();
        TrajectoryRecord {
            history: self.history.clone(),
            trajectory: self.trajectory.clone(),
            info,
        }
    }

    fn save_record(&self) -> Result<()> {
        if let Some(path) = &self.trajectory_path {
            self.record().save(path)?;
        }
        Ok(())
    }

    fn result(&self, exit_status: ExitStatus) -> RunResult {
        RunResult {
            exit_status,
            submission: self.info.submission.clone(),
            stats: self.client.stats().clone(),
            record: self.record(),
        }
    }
}

fn shell_escape(value: &str) -> String {
    value.replace('\'', r"'\''")
}

fn load_demonstrations(
    templates: &TemplateSet,
    agent_name: &str,
) -> std::result::Result<Vec<HistoryItem>, ConfigError> {
    let mut demos = Vec::new();
    for path in templates.demonstrations() {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let record: JsonValue =
            serde_json::from_str(&raw).map_err(|err| ConfigError::InvalidValue {
                field: "templates.demonstrations".into(),
                reason: format!("{}: {err}", path.display()),
            })?;
        let entries: Vec<HistoryItem> =
            serde_json::from_value(record.get("history").cloned().unwrap_or(JsonValue::Null))
                .map_err(|err| ConfigError::InvalidValue {
                    field: "templates.demonstrations".into(),
                    reason: format!("{} has no usable history: {err}", path.display()),
                })?;
        if templates.put_demos_in_history() {
            for mut entry in entries {
                if entry.role == Role::System {
                    continue;
                }
                entry.is_demo = true;
                entry.agent = agent_name.to_string();
                demos.push(entry);
            }
        } else {
            let transcript = entries
                .iter()
                .filter(|e| e.role != Role::System)
                .map(|e| e.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let content = templates.demonstration(&transcript)?;
            demos.push(HistoryItem::user(content, agent_name).as_demo());
        }
    }
    Ok(demos)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use patchwright_core::error::SandboxError;
    use patchwright_core::sandbox::ExecutionResult;
    use patchwright_providers::BackendConfig;
    use patchwright_tools::ToolConfig;

    use crate::config::{ModelConfig, SubroutineConfig};

    const MARKER: &str = "<<SUBMISSION||diff --git a/fix b/fix||SUBMISSION>>";

    /// In-memory sandbox: answers from an exact-match table, records every
    /// executed command, and can be told to fail on specific commands.
    struct FakeSandbox {
        calls: Mutex<Vec<String>>,
        responses: Vec<(String, String)>,
        fail_on: Vec<String>,
        started: bool,
    }

    impl FakeSandbox {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Vec::new(),
                fail_on: Vec::new(),
                started: true,
            }
        }

        fn respond(mut self, command: &str, output: &str) -> Self {
            self.responses.push((command.to_string(), output.to_string()));
            self
        }

        fn fail_on(mut self, command: &str) -> Self {
            self.fail_on.push(command.to_string());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn executed(&self, command: &str) -> bool {
            self.calls().iter().any(|c| c == command)
        }
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn name(&self) -> &str {
            "fake"
        }

        async fn start_session(&mut self) -> std::result::Result<(), SandboxError> {
            self.started = true;
            Ok(())
        }

        async fn execute(
            &mut self,
            command: &str,
            _timeout: Duration,
        ) -> std::result::Result<ExecutionResult, SandboxError> {
            self.calls.lock().unwrap().push(command.to_string());
            if self.fail_on.iter().any(|f| f == command) {
                return Err(SandboxError::SessionClosed("shell exited".into()));
            }
            let output = self
                .responses
                .iter()
                .find(|(c, _)| c == command)
                .map(|(_, o)| o.clone())
                .unwrap_or_else(|| {
                    if command == "pwd" || command == "pwd -P" {
                        "/workspace".to_string()
                    } else {
                        String::new()
                    }
                });
            Ok(ExecutionResult {
                output,
                exit_code: 0,
            })
        }

        async fn write_file(
            &mut self,
            _path: &Path,
            _content: &str,
        ) -> std::result::Result<(), SandboxError> {
            Ok(())
        }

        async fn upload_directory(
            &mut self,
            _source: &Path,
            _dest: &Path,
        ) -> std::result::Result<(), SandboxError> {
            Ok(())
        }

        async fn close_session(&mut self) -> std::result::Result<(), SandboxError> {
            self.started = false;
            Ok(())
        }
    }

    fn fenced(action: &str) -> String {
        format!("DISCUSSION\nnext step\n\n```\n{action}\n```")
    }

    /// Agent wired to a replay backend fed from a temp file.
    fn replay_agent(dir: &tempfile::TempDir, responses: &[String]) -> Agent {
        replay_config_agent(dir, responses, |_| {})
    }

    fn replay_config_agent(
        dir: &tempfile::TempDir,
        responses: &[String],
        tweak: impl FnOnce(&mut AgentConfig),
    ) -> Agent {
        let path = dir.path().join("replay.json");
        std::fs::write(&path, serde_json::to_string(responses).unwrap()).unwrap();
        let mut config = AgentConfig {
            model: ModelConfig {
                name: "replay".into(),
                backend: Some(BackendConfig::Replay { path, usage: None }),
                ..ModelConfig::default()
            },
            ..AgentConfig::default()
        };
        tweak(&mut config);
        Agent::from_config(config).unwrap()
    }

    #[tokio::test]
    async fn scripted_run_submits_after_three_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = replay_agent(
            &dir,
            &[
                "no fenced block here".to_string(),
                fenced("ls -l"),
                fenced("submit"),
            ],
        );
        let mut sandbox = FakeSandbox::new()
            .respond("ls -l", "total 0\n-rw-r--r-- 1 root root 0 README.md\n")
            .respond("submit", MARKER);

        let result = agent.run(&mut sandbox, "fix the bug", None).await.unwrap();

        assert_eq!(result.exit_status, ExitStatus::Submitted);
        assert_eq!(result.submission.as_deref(), Some("diff --git a/fix b/fix"));
        assert_eq!(result.stats.api_calls, 3);
        // One step per executed action; the malformed turn never became one.
        let actions: Vec<&str> = result
            .record
            .trajectory
            .iter()
            .map(|s| s.action.as_str())
            .collect();
        assert_eq!(actions, vec!["ls -l", "submit"]);
        assert!(sandbox.executed("ls -l"));
        // The format correction stayed out of the permanent history.
        assert!(result
            .record
            .history
            .iter()
            .all(|e| !e.content.contains("not formatted correctly")));
        assert!(result
            .record
            .history
            .iter()
            .all(|e| e.content != "no fenced block here"));
    }

    #[tokio::test]
    async fn trajectory_file_is_rewritten_after_each_step() {
        let dir = tempfile::tempdir().unwrap();
        let traj = dir.path().join("run.traj.json");
        let mut agent = replay_agent(&dir, &[fenced("echo hi"), fenced("submit")]);
        let mut sandbox = FakeSandbox::new()
            .respond("echo hi", "hi\n")
            .respond("submit", MARKER);

        let result = agent
            .run(&mut sandbox, "say hi", Some(&traj))
            .await
            .unwrap();
        assert!(result.exit_status.is_submitted());

        let loaded = TrajectoryRecord::load(&traj).unwrap();
        assert_eq!(loaded.trajectory.len(), 2);
        assert_eq!(loaded.info.exit_status, Some(ExitStatus::Submitted));
        assert_eq!(loaded.info.model_stats.api_calls, 2);
    }

    #[tokio::test]
    async fn blocked_actions_exhaust_the_budget_without_reaching_the_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = replay_agent(
            &dir,
            &[
                fenced("vim file.py"),
                fenced("vim file.py"),
                fenced("vim file.py"),
            ],
        );
        // No submission marker: the salvage attempt comes back empty.
        let mut sandbox = FakeSandbox::new();

        let result = agent.run(&mut sandbox, "edit a file", None).await.unwrap();

        assert_eq!(result.exit_status, ExitStatus::Exited(ExitReason::Format));
        assert_eq!(result.exit_status.to_string(), "exit_format");
        assert_eq!(result.stats.api_calls, 3);
        assert!(!sandbox.executed("vim file.py"));
        let last = result.record.trajectory.last().unwrap();
        assert_eq!(last.action, "exit_format");
        assert_eq!(last.observation, "Exited (exit_format)");
    }

    #[tokio::test]
    async fn mixed_format_and_blocklist_failures_share_one_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = replay_agent(
            &dir,
            &[
                "no block".to_string(),
                fenced("vim file.py"),
                "still no block".to_string(),
            ],
        );
        let mut sandbox = FakeSandbox::new();
        let result = agent.run(&mut sandbox, "edit a file", None).await.unwrap();
        assert_eq!(result.exit_status, ExitStatus::Exited(ExitReason::Format));
        assert_eq!(result.stats.api_calls, 3);
    }

    #[tokio::test]
    async fn next_step_templates_follow_the_observation() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = replay_agent(
            &dir,
            &[fenced("echo hi"), fenced("true"), fenced("submit")],
        );
        let mut sandbox = FakeSandbox::new()
            .respond("echo hi", "hi\n")
            .respond("submit", MARKER);

        let result = agent.run(&mut sandbox, "say hi", None).await.unwrap();
        let users: Vec<&HistoryItem> = result
            .record
            .history
            .iter()
            .filter(|e| e.role == Role::User && !e.is_demo)
            .collect();
        assert_eq!(users.len(), 3);
        assert!(users[0].content.contains("say hi"));
        assert_eq!(users[1].content, "Observation: hi\n");
        assert_eq!(
            users[2].content,
            "Your command ran successfully and did not produce any output."
        );
    }

    #[tokio::test]
    async fn cost_limit_triggers_autosubmission() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = replay_config_agent(&dir, &[fenced("ls")], |config| {
            config.model.per_instance_cost_limit = 0.5;
            if let Some(BackendConfig::Replay { usage, .. }) = config.model.backend.as_mut() {
                *usage = Some((1000, 0));
            }
            config
                .model
                .metadata_overrides
                .insert("replay".into(), priced_override());
        });
        let mut sandbox = FakeSandbox::new().respond("submit", MARKER);

        let result = agent.run(&mut sandbox, "expensive task", None).await.unwrap();

        assert_eq!(result.exit_status, ExitStatus::AutoSubmitted(ExitReason::Cost));
        assert_eq!(result.exit_status.to_string(), "submitted (exit_cost)");
        assert_eq!(result.submission.as_deref(), Some("diff --git a/fix b/fix"));
        let last = result.record.trajectory.last().unwrap();
        assert_eq!(last.action, "exit_cost");
        assert_eq!(last.observation, "Exited (autosubmitted)");
        assert_eq!(last.thought, "Exit due to cost limit");
        // The action the model asked for never ran.
        assert!(!sandbox.executed("ls"));
    }

    fn priced_override() -> patchwright_providers::MetadataOverride {
        // With 1000 input tokens per call, every call costs a dollar.
        serde_json::from_value(serde_json::json!({
            "cost_per_input_token": 1e-3,
            "cost_per_output_token": 1e-3,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn dead_session_ends_the_run_without_salvage() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = replay_agent(&dir, &[fenced("ls"), fenced("submit")]);
        let mut sandbox = FakeSandbox::new().fail_on("ls");

        let result = agent.run(&mut sandbox, "look around", None).await.unwrap();

        assert_eq!(
            result.exit_status,
            ExitStatus::Exited(ExitReason::Environment)
        );
        // Environment failures make no salvage attempt.
        assert!(!sandbox.executed("submit"));
        assert!(result.submission.is_none());
    }

    #[tokio::test]
    async fn timeout_is_reported_and_the_run_continues() {
        struct TimeoutOnce {
            inner: FakeSandbox,
        }

        #[async_trait]
        impl Sandbox for TimeoutOnce {
            fn name(&self) -> &str {
                "timeout-once"
            }
            async fn start_session(&mut self) -> std::result::Result<(), SandboxError> {
                self.inner.start_session().await
            }
            async fn execute(
                &mut self,
                command: &str,
                timeout: Duration,
            ) -> std::result::Result<ExecutionResult, SandboxError> {
                if command == "sleep 100" {
                    self.inner.calls.lock().unwrap().push(command.to_string());
                    return Err(SandboxError::Timeout { timeout_secs: 30 });
                }
                self.inner.execute(command, timeout).await
            }
            async fn write_file(
                &mut self,
                path: &Path,
                content: &str,
            ) -> std::result::Result<(), SandboxError> {
                self.inner.write_file(path, content).await
            }
            async fn upload_directory(
                &mut self,
                source: &Path,
                dest: &Path,
            ) -> std::result::Result<(), SandboxError> {
                self.inner.upload_directory(source, dest).await
            }
            async fn close_session(&mut self) -> std::result::Result<(), SandboxError> {
                self.inner.close_session().await
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut agent = replay_agent(&dir, &[fenced("sleep 100"), fenced("submit")]);
        let mut sandbox = TimeoutOnce {
            inner: FakeSandbox::new().respond("submit", MARKER),
        };

        let result = agent.run(&mut sandbox, "wait", None).await.unwrap();

        assert_eq!(result.exit_status, ExitStatus::Submitted);
        assert!(result.record.trajectory[0]
            .observation
            .contains("EXECUTION TIMED OUT"));
    }

    #[tokio::test]
    async fn subroutine_submission_becomes_the_observation() {
        let dir = tempfile::tempdir().unwrap();
        let child_replay = dir.path().join("child.json");
        std::fs::write(
            &child_replay,
            serde_json::to_string(&[fenced("submit")]).unwrap(),
        )
        .unwrap();
        let child_config = AgentConfig {
            name: "helper".into(),
            model: ModelConfig {
                name: "replay".into(),
                backend: Some(BackendConfig::Replay {
                    path: child_replay,
                    usage: None,
                }),
                ..ModelConfig::default()
            },
            ..AgentConfig::default()
        };

        let mut agent = replay_config_agent(
            &dir,
            &[fenced("helper narrow down the bug"), fenced("submit")],
            move |config| {
                config.subroutines.push(SubroutineConfig {
                    name: "helper".into(),
                    init_command: None,
                    env_variables: vec!["ROOT".into()],
                    agent: Box::new(child_config),
                });
            },
        );
        let mut sandbox = FakeSandbox::new().respond("submit", MARKER);

        let result = agent.run(&mut sandbox, "find the bug", None).await.unwrap();

        assert!(result.exit_status.is_submitted());
        // Parent step observation is the child's submission.
        assert_eq!(
            result.record.trajectory[0].observation,
            "diff --git a/fix b/fix"
        );
        // 2 parent calls plus the child's 1, absorbed into the parent.
        assert_eq!(result.stats.api_calls, 3);
        // Snapshot and restore bracket the dispatch.
        assert!(sandbox.executed("pwd -P"));
        assert!(sandbox.executed("cd '/workspace'"));
        assert!(sandbox.calls().iter().any(|c| c.starts_with("export ROOT=")));
    }

    #[tokio::test]
    async fn subroutine_depth_limit_refuses_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let child_replay = dir.path().join("child.json");
        std::fs::write(
            &child_replay,
            serde_json::to_string(&[fenced("submit")]).unwrap(),
        )
        .unwrap();
        let child_config = AgentConfig {
            name: "helper".into(),
            model: ModelConfig {
                name: "replay".into(),
                backend: Some(BackendConfig::Replay {
                    path: child_replay,
                    usage: None,
                }),
                ..ModelConfig::default()
            },
            ..AgentConfig::default()
        };

        let mut agent = replay_config_agent(
            &dir,
            &[fenced("helper do it"), fenced("submit")],
            move |config| {
                config.max_subroutine_depth = 0;
                config.subroutines.push(SubroutineConfig {
                    name: "helper".into(),
                    init_command: None,
                    env_variables: Vec::new(),
                    agent: Box::new(child_config),
                });
            },
        );
        let mut sandbox = FakeSandbox::new().respond("submit", MARKER);

        let result = agent.run(&mut sandbox, "find the bug", None).await.unwrap();
        assert!(result.exit_status.is_submitted());
        assert!(result.record.trajectory[0]
            .observation
            .contains("nesting depth limit"));
        // Only the parent queried the model.
        assert_eq!(result.stats.api_calls, 2);
    }

    #[tokio::test]
    async fn demonstrations_collapse_into_one_user_turn() {
        let dir = tempfile::tempdir().unwrap();
        let demo_path = dir.path().join("demo.traj.json");
        let demo = serde_json::json!({
            "history": [
                {"role": "system", "content": "demo system", "agent": "main"},
                {"role": "user", "content": "demo task", "agent": "main"},
                {"role": "assistant", "content": "demo answer", "agent": "main"},
            ]
        });
        std::fs::write(&demo_path, demo.to_string()).unwrap();

        let mut agent = replay_config_agent(&dir, &[fenced("submit")], |config| {
            config.templates.demonstrations = vec![demo_path];
        });
        let mut sandbox = FakeSandbox::new().respond("submit", MARKER);
        let result = agent.run(&mut sandbox, "real task", None).await.unwrap();

        let demos: Vec<&HistoryItem> = result
            .record
            .history
            .iter()
            .filter(|e| e.is_demo)
            .collect();
        assert_eq!(demos.len(), 1);
        assert_eq!(demos[0].role, Role::User);
        assert!(demos[0].content.contains("--- DEMONSTRATION ---"));
        assert!(demos[0].content.contains("demo task\ndemo answer"));
        assert!(!demos[0].content.contains("demo system"));
        // The instance prompt still follows the demo.
        let first_regular_user = result
            .record
            .history
            .iter()
            .find(|e| e.role == Role::User && !e.is_demo)
            .unwrap();
        assert!(first_regular_user.content.contains("real task"));
    }

    #[tokio::test]
    async fn compaction_applies_only_to_the_outgoing_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = replay_config_agent(
            &dir,
            &[
                fenced("echo one"),
                fenced("echo two"),
                fenced("echo three"),
                fenced("submit"),
            ],
            |config| {
                config.history_processors =
                    vec![HistoryProcessor::LastNObservations { n: 1 }];
            },
        );
        let mut sandbox = FakeSandbox::new()
            .respond("echo one", "one\n")
            .respond("echo two", "two\n")
            .respond("echo three", "three\n")
            .respond("submit", MARKER);

        let result = agent.run(&mut sandbox, "count", None).await.unwrap();
        assert!(result.exit_status.is_submitted());
        // The permanent record keeps every observation intact.
        assert!(result
            .record
            .history
            .iter()
            .any(|e| e.content == "Observation: one\n"));
        assert!(result
            .record
            .history
            .iter()
            .all(|e| !e.content.starts_with("Old output omitted")));
    }

    #[test]
    fn duplicate_subroutine_names_fail_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.json");
        std::fs::write(&path, "[]").unwrap();
        let model = ModelConfig {
            name: "replay".into(),
            backend: Some(BackendConfig::Replay { path, usage: None }),
            ..ModelConfig::default()
        };
        let child = AgentConfig {
            model: model.clone(),
            ..AgentConfig::default()
        };
        let sub = |name: &str| SubroutineConfig {
            name: name.into(),
            init_command: None,
            env_variables: Vec::new(),
            agent: Box::new(child.clone()),
        };
        let config = AgentConfig {
            model,
            subroutines: vec![sub("helper"), sub("helper")],
            ..AgentConfig::default()
        };
        let err = Agent::from_config(config).unwrap_err();
        assert!(err.to_string().contains("duplicate subroutine"));
    }

    #[test]
    fn bash_tool_can_only_be_disabled_for_structured_parsers() {
        let model = ModelConfig {
            name: "replay".into(),
            backend: Some(BackendConfig::InstantSubmit),
            ..ModelConfig::default()
        };
        let tools = ToolConfig {
            enable_bash_tool: false,
            ..ToolConfig::default()
        };

        let err = Agent::from_config(AgentConfig {
            model: model.clone(),
            tools: tools.clone(),
            ..AgentConfig::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("enable_bash_tool"));

        Agent::from_config(AgentConfig {
            model,
            tools,
            parser: ActionParser::Json,
            ..AgentConfig::default()
        })
        .unwrap();
    }
}
