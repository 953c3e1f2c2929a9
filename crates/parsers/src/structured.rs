//! Parsers for structured model output: native tool calls and the JSON
//! envelope format. Both resolve the named command in the catalog and
//! substitute the supplied arguments into its invocation template; they
//! fail with machine-readable codes so retry prompts can be specific.

use patchwright_core::error::{FormatError, FormatErrorCode};
use patchwright_core::model::ModelOutput;
use patchwright_tools::Command;

/// Exactly one native tool call, resolved against the catalog.
pub(crate) fn parse_function_calling(
    output: &ModelOutput,
    commands: &[Command],
) -> Result<(String, String), FormatError> {
    if output.tool_calls.len() != 1 {
        let count = output.tool_calls.len();
        let code = if count == 0 {
            FormatErrorCode::Missing
        } else {
            FormatErrorCode::Multiple
        };
        return Err(FormatError::coded(
            code,
            format!(
                "Expected exactly one tool call in model response - received {count} tool calls \
                 with message: {}",
                output.text
            ),
        ));
    }
    let call = &output.tool_calls[0];
    let command = resolve_command(&call.name, commands)?;
    let values = parse_arguments(&call.arguments)?;
    let action = command.render_invocation(&values)?;
    Ok((output.text.trim().to_string(), action))
}

/// The whole response is a JSON object: `{"thought": ..., "command":
/// {"name": ..., "arguments": {...}}}`.
pub(crate) fn parse_json(
    output: &ModelOutput,
    commands: &[Command],
) -> Result<(String, String), FormatError> {
    let invalid = |msg: &str| FormatError::coded(FormatErrorCode::InvalidJson, msg);

    let data: serde_json::Value = serde_json::from_str(output.text.trim())
        .map_err(|_| invalid("Model output is not valid JSON."))?;
    let Some(object) = data.as_object() else {
        return Err(invalid("Model output is not a JSON object."));
    };
    let thought = match object.get("thought") {
        None => return Err(invalid("Key 'thought' is missing from model output.")),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let Some(command_value) = object.get("command") else {
        return Err(invalid("Key 'command' is missing from model output."));
    };
    let Some(command_object) = command_value.as_object() else {
        return Err(invalid("Value of 'command' key is not a JSON object."));
    };
    let Some(name) = command_object.get("name").and_then(|v| v.as_str()) else {
        return Err(invalid("Key 'name' is missing from 'command' object."));
    };
    let values = match command_object.get("arguments") {
        None => serde_json::Map::new(),
        Some(serde_json::Value::Object(map)) => map.clone(),
        Some(_) => return Err(invalid("Value of 'arguments' key is not a JSON object.")),
    };

    let command = resolve_command(name, commands)?;
    let action = command.render_invocation(&values)?;
    Ok((thought.trim().to_string(), action))
}

fn resolve_command<'c>(
    name: &str,
    commands: &'c [Command],
) -> Result<&'c Command, FormatError> {
    commands.iter().find(|c| c.name == name).ok_or_else(|| {
        FormatError::coded(
            FormatErrorCode::InvalidCommand,
            format!("Command '{name}' not found in list of available commands."),
        )
    })
}

fn parse_arguments(
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, FormatError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    serde_json::from_str(raw).map_err(|_| {
        FormatError::coded(
            FormatErrorCode::InvalidJson,
            "Tool call arguments are not valid JSON.",
        )
    })
}
