//! Parsers for plain-text model output.
//!
//! These extract the action from unstructured assistant text: a bare
//! command, a fenced code block, or an XML-tagged block. They share one
//! convention: when several candidate blocks appear, the *last* top-level
//! one is the action, because models like to show illustrative snippets
//! in their discussion before the real command.

use std::sync::LazyLock;

use regex::Regex;

use patchwright_core::error::FormatError;
use patchwright_tools::Command;

/// Opening fence with an info string (must be followed by a newline), or
/// a bare closing fence at end of line.
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```(\S*)\s*\n|^```\s*$").unwrap());

/// The whole response is the action; its first word must name a command.
pub(crate) fn parse_action(
    text: &str,
    commands: &[Command],
) -> Result<(String, String), FormatError> {
    if let Some(first) = text.split_whitespace().next() {
        if commands.iter().any(|c| c.name == first) {
            let trimmed = text.trim().to_string();
            return Ok((trimmed.clone(), trimmed));
        }
    }
    Err(FormatError::new(
        "First word in model response is not a valid command.",
    ))
}

/// Discussion plus a fenced action block.
///
/// Fences are matched with a stack so blocks nested inside another block
/// never count: an info-string fence always opens, a bare fence closes
/// the innermost open block (or opens one when none is open). The last
/// block that closes at depth zero is the action; the thought is the
/// response with that block cut out.
pub(crate) fn parse_thought_action(text: &str) -> Result<(String, String), FormatError> {
    let mut stack: Vec<(usize, usize)> = Vec::new();
    let mut last_block: Option<((usize, usize), (usize, usize))> = None;
    for caps in CODE_FENCE.captures_iter(text) {
        let whole = caps.get(0).expect("fence match has a full capture");
        let info = caps.get(1);
        let closes = info.is_none_or(|m| m.as_str().is_empty());
        if !stack.is_empty() && closes {
            let open = stack.pop().expect("stack checked non-empty");
            if stack.is_empty() {
                last_block = Some((open, (whole.start(), whole.end())));
            }
        } else if info.is_some() {
            stack.push((whole.start(), whole.end()));
        }
    }
    let Some(((open_start, open_end), (close_start, close_end))) = last_block else {
        return Err(FormatError::new("No action found in model response."));
    };
    let thought = format!("{}{}", &text[..open_start], &text[close_end..]);
    let action = &text[open_end..close_start];
    Ok((thought.trim().to_string(), action.trim().to_string()))
}

/// Discussion plus an action between the last `<command>`/`</command>`
/// pair. The thought is everything outside that pair.
pub(crate) fn parse_xml_thought_action(text: &str) -> Result<(String, String), FormatError> {
    const OPEN: &str = "<command>";
    const CLOSE: &str = "</command>";
    let (Some(open_idx), Some(close_idx)) = (text.rfind(OPEN), text.rfind(CLOSE)) else {
        return Err(FormatError::new("No action found in model response."));
    };
    let action_start = open_idx + OPEN.len();
    let action = if action_start <= close_idx {
        &text[action_start..close_idx]
    } else {
        ""
    };
    let thought = format!("{}{}", &text[..open_idx], &text[close_idx + CLOSE.len()..]);
    Ok((thought.trim().to_string(), action.trim().to_string()))
}
