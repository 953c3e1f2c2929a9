//! Turning raw model responses into `(thought, action)` pairs.
//!
//! Each agent run is configured with exactly one [`ActionParser`] variant.
//! Free-form parsers slice the response text (first-word commands, fenced
//! code blocks, XML tags); structured parsers resolve native tool calls or
//! a JSON envelope against the command catalog. Every variant carries a
//! retry template that tells the model how to fix a malformed response.

mod freeform;
mod structured;

use serde::{Deserialize, Serialize};

use patchwright_core::error::FormatError;
use patchwright_core::model::ModelOutput;
use patchwright_tools::Command;

const ACTION_TEMPLATE: &str = "\
The command you provided was not recognized. Please specify one of the commands (+ any necessary arguments) from the following list in your response. Do not include any other text.

COMMANDS:
{{command_docs}}
";

const THOUGHT_ACTION_TEMPLATE: &str = "\
Your output was not formatted correctly. You must always include one discussion and one command as part of your response. Make sure you do not have multiple discussion/command tags.
Please make sure your output precisely matches the following format:
DISCUSSION
Discuss here with yourself about what your planning and what you're going to do in this step.

```
command(s) that you're going to run
```
";

const XML_THOUGHT_ACTION_TEMPLATE: &str = "\
Your output was not formatted correctly. You must always include one discussion and one command as part of your response. Make sure you do not have multiple discussion/command tags.
Please make sure your output precisely matches the following format:
";

const EDIT_FORMAT_TEMPLATE: &str = "\
Your output was not formatted correctly. You must wrap the replacement text in backticks (```).
Please make sure your output precisely matches the following format:
COMMENTS
You can write comments here about what you're going to do if you want.

```
New window contents.
Make sure you copy the entire contents of the window here, with the required indentation.
Make the changes to the window above directly in this window.
Remember that all of the window's contents will be replaced with the contents of this window.
Don't include line numbers in your response.
```
";

const IDENTITY_TEMPLATE: &str = "\
It seems like something went wrong with your output. Please try again.
";

const FUNCTION_CALLING_TEMPLATE: &str = r#"{%- if error_code == "missing" -%}
Your last output did not use any tool calls!
Please make sure your output includes exactly _ONE_ function call!
You must invoke the function directly using the function call format.
You cannot invoke commands with ```, you have to use the function call format.
If you think you have already resolved the issue, please submit your changes by running the `submit` command.
If you think you cannot solve the problem, please run `exit_forfeit` (if available).
Else, please continue with a new tool call!
{%- elif error_code == "multiple" -%}
Your last output included multiple tool calls!
Please make sure your output includes a thought and exactly _ONE_ function call.
{%- elif error_code == "unexpected_arg" -%}
Your action could not be parsed properly: {{exception_message}}.
Make sure your function call doesn't include any extra arguments that are not in the allowed arguments, and only use the allowed commands.
{%- else -%}
Your action could not be parsed properly: {{exception_message}}.
{% endif %}"#;

const JSON_TEMPLATE: &str = "\
Your output could not be parsed as JSON. Please make sure your output 1) is valid JSON and
2) Includes the \"thought\" and \"command\" fields.

";

/// How the model is expected to format its responses.
///
/// The variant decides both parsing and, for [`ActionParser::FunctionCalling`],
/// whether command schemas are sent to the API as native tool definitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionParser {
    /// The whole response is the action; its first word must be a command.
    Action,
    /// A discussion followed by exactly one fenced code block.
    #[default]
    ThoughtAction,
    /// The action is wrapped in `<command>...</command>` tags.
    XmlThoughtAction,
    /// Fenced-block parsing with an error template for window-replace edits.
    EditFormat,
    /// No parsing; thought and action are both the raw text.
    Identity,
    /// Exactly one native tool call, resolved against the catalog.
    FunctionCalling,
    /// The whole response is a JSON object naming a command and arguments.
    Json,
}

impl ActionParser {
    /// Splits a model response into `(thought, action)`.
    pub fn parse(
        &self,
        output: &ModelOutput,
        commands: &[Command],
    ) -> Result<(String, String), FormatError> {
        match self {
            ActionParser::Action => freeform::parse_action(&output.text, commands),
            ActionParser::ThoughtAction | ActionParser::EditFormat => {
                freeform::parse_thought_action(&output.text)
            }
            ActionParser::XmlThoughtAction => {
                freeform::parse_xml_thought_action(&output.text)
            }
            ActionParser::Identity => Ok((output.text.clone(), output.text.clone())),
            ActionParser::FunctionCalling => {
                structured::parse_function_calling(output, commands)
            }
            ActionParser::Json => structured::parse_json(output, commands),
        }
    }

    /// Template shown to the model when its response failed to parse.
    ///
    /// Rendered with `command_docs`, `error_code`, and `exception_message`
    /// in context; templates use whichever subset they need.
    pub fn format_error_template(&self) -> &'static str {
        match self {
            ActionParser::Action => ACTION_TEMPLATE,
            ActionParser::ThoughtAction => THOUGHT_ACTION_TEMPLATE,
            ActionParser::XmlThoughtAction => XML_THOUGHT_ACTION_TEMPLATE,
            ActionParser::EditFormat => EDIT_FORMAT_TEMPLATE,
            ActionParser::Identity => IDENTITY_TEMPLATE,
            ActionParser::FunctionCalling => FUNCTION_CALLING_TEMPLATE,
            ActionParser::Json => JSON_TEMPLATE,
        }
    }

    /// Whether command schemas must be sent as native tool definitions.
    pub fn uses_function_calling(&self) -> bool {
        matches!(self, ActionParser::FunctionCalling)
    }

    /// Structured parsers carry the command name out of band, so the bash
    /// tool can be disabled without stranding the model.
    pub fn is_structured(&self) -> bool {
        matches!(self, ActionParser::FunctionCalling | ActionParser::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash_only() -> Vec<Command> {
        vec![Command::bash()]
    }

    #[test]
    fn default_is_thought_action() {
        assert_eq!(ActionParser::default(), ActionParser::ThoughtAction);
    }

    #[test]
    fn config_names_round_trip() {
        for (parser, name) in [
            (ActionParser::Action, "\"action\""),
            (ActionParser::ThoughtAction, "\"thought_action\""),
            (ActionParser::XmlThoughtAction, "\"xml_thought_action\""),
            (ActionParser::EditFormat, "\"edit_format\""),
            (ActionParser::Identity, "\"identity\""),
            (ActionParser::FunctionCalling, "\"function_calling\""),
            (ActionParser::Json, "\"json\""),
        ] {
            assert_eq!(serde_json::to_string(&parser).unwrap(), name);
            let back: ActionParser = serde_json::from_str(name).unwrap();
            assert_eq!(back, parser);
        }
    }

    #[test]
    fn thought_action_dispatch() {
        let output = ModelOutput::text("Look around.\n```\nls -la\n```\n");
        let (thought, action) = ActionParser::ThoughtAction
            .parse(&output, &bash_only())
            .unwrap();
        assert_eq!(thought, "Look around.");
        assert_eq!(action, "ls -la");
    }

    #[test]
    fn edit_format_shares_fence_parsing() {
        let output = ModelOutput::text("COMMENTS\n```\nnew window\n```\n");
        let (_, action) = ActionParser::EditFormat
            .parse(&output, &bash_only())
            .unwrap();
        assert_eq!(action, "new window");
    }

    #[test]
    fn identity_is_verbatim() {
        let output = ModelOutput::text("  anything at all  ");
        let (thought, action) = ActionParser::Identity
            .parse(&output, &bash_only())
            .unwrap();
        assert_eq!(thought, "  anything at all  ");
        assert_eq!(action, thought);
    }

    #[test]
    fn every_variant_has_a_retry_template() {
        for parser in [
            ActionParser::Action,
            ActionParser::ThoughtAction,
            ActionParser::XmlThoughtAction,
            ActionParser::EditFormat,
            ActionParser::Identity,
            ActionParser::FunctionCalling,
            ActionParser::Json,
        ] {
            assert!(!parser.format_error_template().is_empty());
        }
        assert!(ActionParser::Action
            .format_error_template()
            .contains("{{command_docs}}"));
        assert!(ActionParser::FunctionCalling
            .format_error_template()
            .contains("{{exception_message}}"));
    }

    #[test]
    fn structured_flags() {
        assert!(ActionParser::FunctionCalling.uses_function_calling());
        assert!(ActionParser::FunctionCalling.is_structured());
        assert!(ActionParser::Json.is_structured());
        assert!(!ActionParser::Json.uses_function_calling());
        assert!(!ActionParser::ThoughtAction.is_structured());
    }
}
