//! Command and argument definitions.
//!
//! A [`Command`] is one action the model may invoke: either a plain
//! single-line command or a multi-line command terminated by an end
//! marker (sent to the shell as a heredoc). Commands carry typed
//! arguments and render model-supplied values into a concrete shell
//! invocation.

use std::sync::LazyLock;

use minijinja::{Environment, context};
use regex::Regex;
use serde::{Deserialize, Serialize};

use patchwright_core::error::{ConfigError, FormatError, FormatErrorCode};
use patchwright_core::model::ToolSpec;

/// Valid argument names: a letter or underscore followed by at least one
/// more word character or dash.
static ARGUMENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_-]+$").unwrap());

/// `<name>` and `[<name>]` placeholders in a signature.
static SIGNATURE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[?<([a-zA-Z_][a-zA-Z0-9_-]+)>\]?").unwrap());

/// `{name}` placeholders in an invocation template.
static INVOKE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_-]+)\}").unwrap());

fn default_argument_format() -> String {
    "{{value}}".to_string()
}

/// One typed argument accepted by a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,

    /// JSON-schema type name ("string", "integer", "array", ...).
    #[serde(rename = "type")]
    pub kind: String,

    pub description: String,

    #[serde(default)]
    pub required: bool,

    /// Allowed values, forwarded into the function-calling schema.
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,

    /// Item schema for array arguments, forwarded verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<serde_json::Value>,

    /// Template rendering one supplied value inside the invocation.
    #[serde(default = "default_argument_format")]
    pub argument_format: String,
}

impl Argument {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: description.into(),
            required,
            enum_values: None,
            items: None,
            argument_format: default_argument_format(),
        }
    }
}

/// An executable command with arguments and documentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,

    #[serde(default)]
    pub docstring: Option<String>,

    /// Display signature; when absent one is derived from the arguments.
    #[serde(default)]
    pub signature: Option<String>,

    /// Terminator line for multi-line commands.
    #[serde(default)]
    pub end_name: Option<String>,

    #[serde(default)]
    pub arguments: Vec<Argument>,
}

impl Command {
    /// The built-in passthrough command for free-form shell input.
    pub fn bash() -> Self {
        Self {
            name: "bash".into(),
            docstring: Some("runs the given command directly in bash".into()),
            signature: Some("<command>".into()),
            end_name: None,
            arguments: vec![Argument::new(
                "command",
                "string",
                "a command to run directly in the current shell",
                true,
            )],
        }
    }

    pub fn is_multiline(&self) -> bool {
        self.end_name.is_some()
    }

    /// The format string for building a concrete invocation.
    ///
    /// Either the custom signature with `<name>` / `[<name>]` placeholders
    /// rewritten to `{name}`, or the default `name {arg1} {arg2} ` form.
    pub fn invoke_format(&self) -> Result<String, ConfigError> {
        let Some(signature) = &self.signature else {
            let mut format = format!("{} ", self.name);
            for arg in &self.arguments {
                format.push_str(&format!("{{{}}} ", arg.name));
            }
            return Ok(format);
        };
        for arg in &self.arguments {
            let angled = format!("<{}>", arg.name);
            let braced = format!("{{{}}}", arg.name);
            if !signature.contains(&angled) && !signature.contains(&braced) {
                return Err(ConfigError::InvalidCommand {
                    command: self.name.clone(),
                    reason: format!(
                        "signature '{signature}' is missing argument '{name}'; \
                         write it as <{name}>, [<{name}>], or {{{name}}}",
                        name = arg.name
                    ),
                });
            }
        }
        Ok(SIGNATURE_PLACEHOLDER
            .replace_all(signature, "{${1}}")
            .into_owned())
    }

    /// The signature shown in command documentation.
    ///
    /// Multi-line commands put the final argument on its own line followed
    /// by the end marker, mirroring how they are typed.
    pub fn signature_or_default(&self) -> String {
        if let Some(signature) = &self.signature {
            return signature.clone();
        }
        let placeholder = |arg: &Argument| {
            if arg.required {
                format!(" <{}>", arg.name)
            } else {
                format!(" [<{}>]", arg.name)
            }
        };
        let mut sig = self.name.clone();
        match (&self.end_name, self.arguments.split_last()) {
            (None, _) => {
                for arg in &self.arguments {
                    sig.push_str(&placeholder(arg));
                }
            }
            (Some(end), Some((last, head))) => {
                for arg in head {
                    sig.push_str(&placeholder(arg));
                }
                sig.push_str(&format!("\n<{}>\n{end}", last.name));
            }
            (Some(end), None) => {
                sig.push_str(&format!("\n{end}"));
            }
        }
        sig
    }

    /// Validates the argument list against the invocation template.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidCommand {
            command: self.name.clone(),
            reason,
        };
        if self.arguments.is_empty() {
            return Ok(());
        }
        let mut found_optional = false;
        for arg in &self.arguments {
            if found_optional && arg.required {
                return Err(invalid(format!(
                    "required argument '{}' cannot come after optional arguments",
                    arg.name
                )));
            }
            if !arg.required {
                found_optional = true;
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for arg in &self.arguments {
            if !seen.insert(arg.name.as_str()) {
                return Err(invalid(format!("duplicate argument name '{}'", arg.name)));
            }
            if !ARGUMENT_NAME.is_match(&arg.name) {
                return Err(invalid(format!("invalid argument name '{}'", arg.name)));
            }
        }
        let invoke_format = self.invoke_format()?;
        let placeholders: std::collections::BTreeSet<&str> = INVOKE_PLACEHOLDER
            .captures_iter(&invoke_format)
            .map(|caps| caps.get(1).unwrap().as_str())
            .collect();
        if placeholders != seen {
            return Err(invalid(
                "placeholders in signature do not match the declared argument names".into(),
            ));
        }
        Ok(())
    }

    /// Whether string values get shell-quoted during rendering.
    ///
    /// Multi-line bodies travel inside a heredoc and must stay raw. A
    /// command whose whole invocation is one bare placeholder (the bash
    /// passthrough) must also stay raw, or the action would collapse into
    /// a single quoted shell word.
    fn quotes_string_values(&self) -> bool {
        if self.end_name.is_some() {
            return false;
        }
        match self.invoke_format() {
            Ok(format) => !INVOKE_PLACEHOLDER
                .find(format.trim())
                .is_some_and(|m| m.as_str() == format.trim()),
            Err(_) => true,
        }
    }

    /// Renders model-supplied argument values into a shell invocation.
    ///
    /// Values are taken in declared argument order; missing optional
    /// arguments render as empty. String values for single-line commands
    /// are shell-quoted; the body of a multi-line command is passed through
    /// raw so the heredoc carries it unchanged.
    pub fn render_invocation(
        &self,
        values: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, FormatError> {
        let missing: Vec<&str> = self
            .arguments
            .iter()
            .filter(|arg| arg.required && !values.contains_key(&arg.name))
            .map(|arg| arg.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(FormatError::coded(
                FormatErrorCode::MissingArg,
                format!("Required argument(s) missing: {}", missing.join(", ")),
            ));
        }
        let declared: std::collections::BTreeSet<&str> =
            self.arguments.iter().map(|arg| arg.name.as_str()).collect();
        let extra: Vec<&str> = values
            .keys()
            .map(String::as_str)
            .filter(|key| !declared.contains(key))
            // Models sometimes echo the end marker back as an argument.
            .filter(|key| self.end_name.as_deref() != Some(key))
            .collect();
        if !extra.is_empty() {
            return Err(FormatError::coded(
                FormatErrorCode::UnexpectedArg,
                format!("Unexpected argument(s): {}", extra.join(", ")),
            ));
        }

        let quote_strings = self.quotes_string_values();
        let env = Environment::new();
        let mut formatted = std::collections::BTreeMap::new();
        for arg in &self.arguments {
            let rendered = match values.get(&arg.name) {
                None => String::new(),
                Some(value) => {
                    let text = match value {
                        serde_json::Value::String(s) if quote_strings => quote_posix(s),
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    env.render_str(&arg.argument_format, context! { value => text })
                        .map_err(|err| {
                            FormatError::new(format!(
                                "failed to render argument '{}' of '{}': {err}",
                                arg.name, self.name
                            ))
                        })?
                }
            };
            formatted.insert(arg.name.clone(), rendered);
        }

        let invoke_format = self.invoke_format().map_err(|err| {
            FormatError::new(format!("command '{}' is misconfigured: {err}", self.name))
        })?;
        let invocation = INVOKE_PLACEHOLDER.replace_all(&invoke_format, |caps: &regex::Captures| {
            formatted.get(&caps[1]).cloned().unwrap_or_default()
        });
        Ok(invocation.trim().to_string())
    }

    /// The function-calling schema advertised to providers.
    pub fn function_calling_spec(&self) -> ToolSpec {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for arg in &self.arguments {
            let mut schema = serde_json::Map::new();
            schema.insert("type".into(), serde_json::Value::String(arg.kind.clone()));
            schema.insert(
                "description".into(),
                serde_json::Value::String(arg.description.clone()),
            );
            if let Some(items) = &arg.items {
                schema.insert("items".into(), items.clone());
            }
            if let Some(values) = &arg.enum_values {
                schema.insert(
                    "enum".into(),
                    serde_json::Value::Array(
                        values
                            .iter()
                            .map(|v| serde_json::Value::String(v.clone()))
                            .collect(),
                    ),
                );
            }
            if arg.required {
                required.push(serde_json::Value::String(arg.name.clone()));
            }
            properties.insert(arg.name.clone(), serde_json::Value::Object(schema));
        }
        ToolSpec {
            name: self.name.clone(),
            description: self.docstring.clone().unwrap_or_default(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Quotes a string for safe interpolation into a POSIX shell word.
fn quote_posix(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
