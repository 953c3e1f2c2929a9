//! The permanent record of a run.
//!
//! One JSON file per run: the full message history, the ordered trajectory
//! of executed steps, and the final info block. The file is rewritten after
//! every step so a killed process loses at most the in-flight step.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::exit::ExitStatus;
use crate::message::HistoryItem;
use crate::stats::ApiStats;

/// One executed step of a run. Append-only: never mutated once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub action: String,
    pub observation: String,
    /// The raw model response the action was parsed from.
    pub response: String,
    /// Sandbox state snapshot taken at the start of the step.
    #[serde(default)]
    pub state: BTreeMap<String, String>,
    pub thought: String,
    /// Wall-clock execution time of the action, in seconds.
    #[serde(default)]
    pub execution_time: f64,
}

/// Final run metadata persisted alongside the trajectory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<ExitStatus>,

    /// The extracted patch text, when any submission was salvaged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission: Option<String>,

    #[serde(default)]
    pub model_stats: ApiStats,
}

/// The persisted record of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub history: Vec<HistoryItem>,
    pub trajectory: Vec<TrajectoryStep>,
    pub info: AgentInfo,
}

impl TrajectoryRecord {
    /// Write the record to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        tracing::debug!(
            path = %path.display(),
            steps = self.trajectory.len(),
            "saved trajectory"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
