//! History and message domain types.
//!
//! The agent keeps a permanent `HistoryItem` list for the whole run; before
//! each model query the history is compacted and flattened into plain wire
//! `Message`s (role + content) for the backend.

use serde::{Deserialize, Serialize};

use crate::model::ToolCall;

/// Retention tag: the compactor never elides an entry carrying this.
pub const TAG_KEEP_ALWAYS: &str = "keep_always";

/// Retention tag: the compactor elides an entry carrying this even inside
/// the keep window.
pub const TAG_OMIT_ALWAYS: &str = "omit_always";

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (setup, command docs)
    System,
    /// Observations and prompts fed to the model
    User,
    /// Model output
    Assistant,
    /// Tool-call result (function-calling mode)
    Tool,
}

/// A plain wire message as sent to a model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One turn of the permanent agent history.
///
/// Carries more than the wire message: which agent owns the turn (sub-agents
/// share one transcript), demo marking, the parsed thought/action pair for
/// assistant turns, structured tool calls, and retention tags consulted by
/// the history processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub role: Role,
    pub content: String,

    /// Name of the agent that produced or received this turn.
    pub agent: String,

    /// Demonstration turns are exempt from compaction.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_demo: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Structured tool calls attached to an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Tool-call ids a tool-role turn responds to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_ids: Vec<String>,

    /// Retention tags (see [`TAG_KEEP_ALWAYS`], [`TAG_OMIT_ALWAYS`]).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl HistoryItem {
    pub fn new(role: Role, content: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            agent: agent.into(),
            is_demo: false,
            thought: None,
            action: None,
            tool_calls: Vec::new(),
            tool_call_ids: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>, agent: impl Into<String>) -> Self {
        Self::new(Role::System, content, agent)
    }

    pub fn user(content: impl Into<String>, agent: impl Into<String>) -> Self {
        Self::new(Role::User, content, agent)
    }

    pub fn assistant(content: impl Into<String>, agent: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, agent)
    }

    pub fn as_demo(mut self) -> Self {
        self.is_demo = true;
        self
    }

    pub fn with_thought_action(
        mut self,
        thought: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.thought = Some(thought.into());
        self.action = Some(action.into());
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the compactor treats this turn as an elidable observation.
    pub fn is_observation(&self) -> bool {
        matches!(self.role, Role::User | Role::Tool) && !self.is_demo
    }

    /// Flatten to the wire form sent to a backend.
    pub fn to_message(&self) -> Message {
        Message {
            role: self.role,
            content: self.content.clone(),
        }
    }
}
