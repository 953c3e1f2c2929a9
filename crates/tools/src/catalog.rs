//! The action catalog: every command the model may invoke, plus the
//! machinery around them.
//!
//! The catalog compiles one recognition pattern per command, rewrites
//! multi-line invocations into heredocs, decides which actions are
//! blocked, installs bundles into a sandbox session, runs the state
//! probe, and renders the command documentation substituted into the
//! prompt templates.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use minijinja::{Environment, context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use patchwright_core::error::{ConfigError, Error, Result};
use patchwright_core::model::ToolSpec;
use patchwright_core::sandbox::Sandbox;

use crate::bundle::{Bundle, BundleRef};
use crate::command::Command;

/// Wrapper emitted by submit-style commands around the final patch.
static SUBMISSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<<SUBMISSION\|\|(.*)\|\|SUBMISSION>>").unwrap());

/// Which actions are refused before they ever reach the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Rendered with `action` when an action is blocked.
    pub blocklist_error_template: String,

    /// Programs blocked whenever they appear as the first token.
    pub blocklist: Vec<String>,

    /// Programs blocked only when invoked bare, with no arguments.
    pub blocklist_standalone: Vec<String>,

    /// Programs allowed only when the action matches a companion regex.
    pub block_unless_regex: BTreeMap<String, String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocklist_error_template:
                "Interactive operation '{{action}}' is not supported by this environment."
                    .into(),
            blocklist: ["vim", "vi", "emacs", "nano", "nohup", "git", "gdb", "less"]
                .map(String::from)
                .to_vec(),
            blocklist_standalone: [
                "python",
                "python3",
                "ipython",
                "bash",
                "sh",
                "/bin/bash",
                "/bin/sh",
                "nohup",
                "vi",
                "vim",
                "emacs",
                "nano",
                "su",
                "exit",
            ]
            .map(String::from)
            .to_vec(),
            block_unless_regex: BTreeMap::from([
                (
                    "radare2".to_string(),
                    r"\b(?:radare2|r2)\b.*\s+-c\s+.*".to_string(),
                ),
                (
                    "r2".to_string(),
                    r"\b(?:radare2|r2)\b.*\s+-c\s+.*".to_string(),
                ),
            ]),
        }
    }
}

/// Tool configuration: bundles, the filter, and sandbox-side knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub filter: FilterConfig,

    pub bundles: Vec<BundleRef>,

    /// Exported into the session before installation and on reset.
    pub env_variables: BTreeMap<String, String>,

    /// The command that ends the run with a submission.
    pub submit_command: String,

    /// Registers the free-form bash passthrough command.
    pub enable_bash_tool: bool,

    /// Overrides the parser's own format-error template when set.
    pub format_error_template: Option<String>,

    /// Where bundles land inside the sandbox.
    pub install_root: PathBuf,

    /// Run after installation and on every reset, joined with `&&`.
    pub reset_commands: Vec<String>,

    pub execution_timeout_secs: u64,

    pub install_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            filter: FilterConfig::default(),
            bundles: Vec::new(),
            env_variables: BTreeMap::new(),
            submit_command: "submit".into(),
            enable_bash_tool: true,
            format_error_template: None,
            install_root: PathBuf::from("/root/tools"),
            reset_commands: Vec::new(),
            execution_timeout_secs: 30,
            install_timeout_secs: 300,
        }
    }
}

/// The compiled catalog. Built once at startup; read-only afterwards.
#[derive(Debug)]
pub struct Catalog {
    config: ToolConfig,
    bundles: Vec<Bundle>,
    commands: Vec<Command>,
    patterns: BTreeMap<String, Regex>,
    multiline_endings: BTreeMap<String, String>,
    submit_end_name: Option<String>,
    block_unless: BTreeMap<String, Regex>,
    state_commands: Vec<String>,
    command_docs: String,
}

impl Catalog {
    /// Loads all bundles, validates the command set, and compiles the
    /// recognition patterns. Every failure here is fatal configuration.
    pub fn build(config: ToolConfig) -> std::result::Result<Self, ConfigError> {
        let mut commands: Vec<Command> = Vec::new();
        let mut sources: BTreeMap<String, String> = BTreeMap::new();
        if config.enable_bash_tool {
            let bash = Command::bash();
            sources.insert(bash.name.clone(), "<builtin>".into());
            commands.push(bash);
        }

        let mut bundles = Vec::new();
        for reference in &config.bundles {
            let bundle = Bundle::load(reference)?;
            for command in bundle.commands() {
                if let Some(first) = sources.get(&command.name) {
                    return Err(ConfigError::DuplicateCommand {
                        name: command.name.clone(),
                        first: first.clone(),
                        second: bundle.path.display().to_string(),
                    });
                }
                sources.insert(command.name.clone(), bundle.path.display().to_string());
                commands.push(command.clone());
            }
            bundles.push(bundle);
        }

        let mut patterns = BTreeMap::new();
        let mut multiline_endings = BTreeMap::new();
        for command in &commands {
            let pattern = match &command.end_name {
                Some(end) => {
                    multiline_endings.insert(command.name.clone(), end.clone());
                    format!(
                        r"(?ms)^\s*({})\s*(.*?)^({})\s*$",
                        regex::escape(&command.name),
                        regex::escape(end)
                    )
                }
                None => format!(r"(?m)^\s*({})\s*(.*?)$", regex::escape(&command.name)),
            };
            let compiled = Regex::new(&pattern).map_err(|err| ConfigError::InvalidCommand {
                command: command.name.clone(),
                reason: format!("could not compile command pattern: {err}"),
            })?;
            patterns.insert(command.name.clone(), compiled);
        }
        let submit_end_name = commands
            .iter()
            .find(|c| c.name == config.submit_command)
            .and_then(|c| c.end_name.clone());

        let mut block_unless = BTreeMap::new();
        for (name, pattern) in &config.filter.block_unless_regex {
            let compiled = Regex::new(pattern).map_err(|err| ConfigError::InvalidValue {
                field: format!("filter.block_unless_regex.{name}"),
                reason: err.to_string(),
            })?;
            block_unless.insert(name.clone(), compiled);
        }

        let state_commands = bundles
            .iter()
            .filter_map(|b| b.state_command().map(str::to_string))
            .collect();
        let command_docs = generate_command_docs(&commands, &config.env_variables)?;

        Ok(Self {
            config,
            bundles,
            commands,
            patterns,
            multiline_endings,
            submit_end_name,
            block_unless,
            state_commands,
            command_docs,
        })
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn find_command(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == name)
    }

    pub fn submit_command(&self) -> &str {
        &self.config.submit_command
    }

    /// The documentation block substituted into prompt templates.
    pub fn command_docs(&self) -> &str {
        &self.command_docs
    }

    /// Function-calling schemas for every command, in catalog order.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.commands
            .iter()
            .map(Command::function_calling_spec)
            .collect()
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.config.execution_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.config.install_timeout_secs)
    }

    // Blocking
    // --------

    /// Whether this action must be refused instead of executed.
    pub fn should_block(&self, action: &str) -> bool {
        let trimmed = action.trim();
        let Some(first) = trimmed.split_whitespace().next() else {
            return false;
        };
        if self.config.filter.blocklist.iter().any(|b| b == first) {
            return true;
        }
        if first == trimmed
            && self
                .config
                .filter
                .blocklist_standalone
                .iter()
                .any(|b| b == first)
        {
            return true;
        }
        if let Some(unless) = self.block_unless.get(first) {
            if !unless.is_match(action) {
                return true;
            }
        }
        false
    }

    /// The observation shown to the model for a blocked action.
    pub fn blocklist_error(&self, action: &str) -> String {
        Environment::new()
            .render_str(
                &self.config.filter.blocklist_error_template,
                context! { action },
            )
            .unwrap_or_else(|_| {
                format!("Interactive operation '{action}' is not supported by this environment.")
            })
    }

    // Multi-line guarding
    // -------------------

    /// Rewrites each recognized multi-line invocation so its body travels
    /// to the shell as a quoted heredoc. Text outside recognized commands
    /// is preserved verbatim; guarding an already guarded action is a
    /// no-op.
    pub fn guard_multiline_input(&self, action: &str) -> String {
        let mut parts: Vec<String> = Vec::new();
        let mut rem = action;
        while !rem.trim().is_empty() {
            let Some(caps) = self.first_multiline_match(rem) else {
                parts.push(rem.to_string());
                break;
            };
            let whole = caps.get(0).expect("match has a full capture");
            let pre = &rem[..whole.start()];
            let matched = whole.as_str();
            if !pre.trim().is_empty() {
                parts.push(pre.to_string());
            }
            if !matched.trim().is_empty() {
                let end_token = caps
                    .get(3)
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                parts.push(append_heredoc_redirect(matched, &end_token));
            }
            rem = &rem[whole.end()..];
        }
        parts.join("\n")
    }

    /// The earliest-starting multi-line command match in `text`.
    fn first_multiline_match<'t>(&self, text: &'t str) -> Option<regex::Captures<'t>> {
        let mut best: Option<regex::Captures<'t>> = None;
        for name in self.multiline_endings.keys() {
            let Some(pattern) = self.patterns.get(name) else {
                continue;
            };
            let Some(caps) = pattern.captures(text) else {
                continue;
            };
            let start = caps.get(0).map(|m| m.start()).unwrap_or(usize::MAX);
            let better = match &best {
                None => true,
                Some(current) => start < current.get(0).map(|m| m.start()).unwrap_or(usize::MAX),
            };
            if better {
                best = Some(caps);
            }
        }
        best
    }

    // Submission
    // ----------

    /// Extracts the submission body from a submit command's output.
    pub fn extract_submission(&self, output: &str) -> Option<String> {
        SUBMISSION.captures(output).map(|caps| caps[1].to_string())
    }

    // Installation & reset
    // --------------------

    /// Uploads and wires up every bundle, then resets the session.
    pub async fn install(&self, sandbox: &mut dyn Sandbox) -> Result<()> {
        self.install_bundles(sandbox).await?;
        self.reset(sandbox).await
    }

    async fn install_bundles(&self, sandbox: &mut dyn Sandbox) -> Result<()> {
        self.export_env_variables(sandbox).await?;
        let cwd = sandbox
            .execute("pwd", self.execution_timeout())
            .await?
            .output
            .trim()
            .to_string();

        for bundle in &self.bundles {
            let target = self.config.install_root.join(bundle.dir_name());
            sandbox.upload_directory(&bundle.path, &target).await?;
            let target = target.display().to_string();
            sandbox
                .execute(
                    &format!("export PATH=$PATH:{target}/bin"),
                    self.execution_timeout(),
                )
                .await?;
            // bin/ may be missing or empty
            let _ = sandbox
                .execute(
                    &format!("chmod +x {target}/bin/* 2>/dev/null"),
                    self.execution_timeout(),
                )
                .await;
            if bundle.has_install_script() {
                let result = sandbox
                    .execute(
                        &format!("cd {target} && source install.sh"),
                        self.install_timeout(),
                    )
                    .await?;
                if !result.success() {
                    return Err(Error::Internal(format!(
                        "install.sh for bundle '{}' failed: {}",
                        bundle.dir_name(),
                        result.output
                    )));
                }
            }
            for file in bundle.sourced_files() {
                let result = sandbox
                    .execute(
                        &format!("source {target}/bin/{}", file.name),
                        self.install_timeout(),
                    )
                    .await?;
                if !result.success() {
                    return Err(Error::Internal(format!(
                        "sourcing {}/bin/{} failed: {}",
                        bundle.dir_name(),
                        file.name,
                        result.output
                    )));
                }
            }
        }
        sandbox
            .execute(&format!("cd {cwd}"), self.execution_timeout())
            .await?;

        let mut missing = Vec::new();
        for command in &self.commands {
            let result = sandbox
                .execute(
                    &format!("command -v {}", command.name),
                    self.execution_timeout(),
                )
                .await?;
            if !result.success() {
                missing.push(command.name.clone());
            }
        }
        if !missing.is_empty() {
            return Err(Error::Internal(format!(
                "tools not available in the sandbox after installation: {}",
                missing.join(", ")
            )));
        }
        info!(
            bundles = self.bundles.len(),
            commands = self.commands.len(),
            "installed tool bundles"
        );
        Ok(())
    }

    /// Re-exports environment variables and replays the reset commands.
    pub async fn reset(&self, sandbox: &mut dyn Sandbox) -> Result<()> {
        info!("resetting tools");
        self.export_env_variables(sandbox).await?;
        if self.config.reset_commands.is_empty() {
            return Ok(());
        }
        let script = self.config.reset_commands.join(" && ");
        let result = sandbox.execute(&script, self.install_timeout()).await?;
        if !result.success() {
            return Err(Error::Internal(format!(
                "reset commands failed: {}",
                result.output
            )));
        }
        Ok(())
    }

    async fn export_env_variables(&self, sandbox: &mut dyn Sandbox) -> Result<()> {
        if self.config.env_variables.is_empty() {
            return Ok(());
        }
        let script = self
            .config
            .env_variables
            .iter()
            .map(|(k, v)| format!("export {k}={v}"))
            .collect::<Vec<_>>()
            .join(" && ");
        let result = sandbox.execute(&script, self.execution_timeout()).await?;
        if !result.success() {
            return Err(Error::Internal(format!(
                "failed to export tool environment variables: {}",
                result.output
            )));
        }
        Ok(())
    }

    // State probe
    // -----------

    /// Runs every bundle's state command and merges the JSON objects they
    /// print. Later bundles win on key conflicts.
    pub async fn state(&self, sandbox: &mut dyn Sandbox) -> Result<BTreeMap<String, String>> {
        let mut combined = BTreeMap::new();
        for state_command in &self.state_commands {
            let result = sandbox
                .execute(state_command, self.execution_timeout())
                .await?;
            let output = result.output.trim().to_string();
            let parsed: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&output).map_err(|_| {
                    Error::Internal(format!("state output {output:?} is not a JSON object"))
                })?;
            for (key, value) in parsed {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                combined.insert(key, value);
            }
        }
        debug!(state = ?combined, "retrieved sandbox state");
        Ok(combined)
    }
}

fn append_heredoc_redirect(matched: &str, end_token: &str) -> String {
    let redirect = format!("<< '{end_token}'");
    let first_line = matched.split('\n').next().unwrap_or("");
    if first_line.trim_end().ends_with(&redirect) {
        return matched.to_string();
    }
    match matched.split_once('\n') {
        Some((head, tail)) => format!("{head} {redirect}\n{tail}"),
        None => format!("{matched} {redirect}"),
    }
}

/// Renders the documentation block for the prompt templates. Docstrings
/// are minijinja templates evaluated against the tool environment
/// variables, so bundles can write `{{WINDOW}}` and the like.
fn generate_command_docs(
    commands: &[Command],
    env_variables: &BTreeMap<String, String>,
) -> std::result::Result<String, ConfigError> {
    let env = Environment::new();
    let mut docs = String::new();
    for command in commands {
        docs.push_str(&format!("{}:\n", command.name));
        if let Some(docstring) = &command.docstring {
            let rendered =
                env.render_str(docstring, env_variables)
                    .map_err(|err| ConfigError::InvalidTemplate {
                        name: format!("docstring of '{}'", command.name),
                        reason: err.to_string(),
                    })?;
            docs.push_str(&format!("  docstring: {rendered}\n"));
        }
        docs.push_str(&format!("  signature: {}\n", command.signature_or_default()));
        if !command.arguments.is_empty() {
            docs.push_str("  arguments:\n");
            for arg in &command.arguments {
                let requirement = if arg.required { "required" } else { "optional" };
                docs.push_str(&format!(
                    "    - {} ({}) [{requirement}]: {}\n",
                    arg.name, arg.kind, arg.description
                ));
            }
        }
        docs.push('\n');
    }
    Ok(docs)
}
