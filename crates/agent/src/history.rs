//! History compaction.
//!
//! Long runs accumulate large command outputs that stop paying for their
//! tokens after a few steps. Before every model query the agent runs the
//! configured processor chain over a *copy* of the permanent history;
//! the permanent record is never touched, so the trajectory file always
//! holds the full transcript.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use patchwright_core::error::ConfigError;
use patchwright_core::message::{HistoryItem, Role, TAG_KEEP_ALWAYS, TAG_OMIT_ALWAYS};

/// One compaction pass. Configured as a chain; applied in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum HistoryProcessor {
    /// Leaves the history unchanged.
    Identity,
    /// Keeps the first observation (the instance prompt) and the last `n`
    /// observations intact; every older observation's content is replaced
    /// with a one-line stub. Entries tagged `keep_always` are exempt;
    /// entries tagged `omit_always` are stubbed even inside the window.
    LastNObservations { n: usize },
    /// Tags observations produced by the named tools with `keep_always`,
    /// shielding them from a later elision pass.
    TagToolOutputs { tools: BTreeSet<String> },
}

impl HistoryProcessor {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let HistoryProcessor::LastNObservations { n: 0 } = self {
            return Err(ConfigError::InvalidValue {
                field: "history_processors.n".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn apply(&self, history: Vec<HistoryItem>) -> Vec<HistoryItem> {
        match self {
            HistoryProcessor::Identity => history,
            HistoryProcessor::LastNObservations { n } => last_n_observations(history, *n),
            HistoryProcessor::TagToolOutputs { tools } => tag_tool_outputs(history, tools),
        }
    }
}

/// Runs the whole chain over a copy of the history.
pub fn compact(chain: &[HistoryProcessor], history: &[HistoryItem]) -> Vec<HistoryItem> {
    chain
        .iter()
        .fold(history.to_vec(), |acc, processor| processor.apply(acc))
}

fn stub(entry: &mut HistoryItem) {
    let lines = entry.content.lines().count();
    entry.content = format!("Old output omitted ({lines} lines)");
}

fn last_n_observations(mut history: Vec<HistoryItem>, n: usize) -> Vec<HistoryItem> {
    let observations: Vec<usize> = history
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.is_observation() && !entry.has_tag(TAG_KEEP_ALWAYS))
        .map(|(idx, _)| idx)
        .collect();
    // The first observation is the instance prompt and always survives.
    let elide: HashSet<usize> = if observations.len() > n + 1 {
        observations[1..observations.len() - n].iter().copied().collect()
    } else {
        HashSet::new()
    };
    for (idx, entry) in history.iter_mut().enumerate() {
        if !entry.is_observation() || entry.has_tag(TAG_KEEP_ALWAYS) {
            continue;
        }
        if elide.contains(&idx) || entry.has_tag(TAG_OMIT_ALWAYS) {
            stub(entry);
        }
    }
    history
}

fn tag_tool_outputs(mut history: Vec<HistoryItem>, tools: &BTreeSet<String>) -> Vec<HistoryItem> {
    let mut current_tool: Option<String> = None;
    for entry in history.iter_mut() {
        if entry.role == Role::Assistant {
            current_tool = entry
                .action
                .as_deref()
                .and_then(|action| action.split_whitespace().next())
                .map(str::to_string);
        } else if entry.is_observation() {
            let produced_by_tool = current_tool
                .as_deref()
                .is_some_and(|tool| tools.contains(tool));
            if produced_by_tool && !entry.has_tag(TAG_KEEP_ALWAYS) {
                entry.tags.push(TAG_KEEP_ALWAYS.to_string());
            }
        }
    }
    history
}
