//! Terminal run statuses.
//!
//! Serialized as the flat status strings recorded in trajectory files
//! (`"submitted"`, `"exit_cost"`, `"submitted (exit_cost)"`, ...), so the
//! on-disk format stays greppable.

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a run was forced to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Per-instance cost limit reached.
    Cost,
    /// Total (cross-attempt) cost limit reached.
    TotalCost,
    /// Prompt exceeded the model's context window.
    Context,
    /// Provider retries exhausted.
    Api,
    /// Format/blocklist requery budget exhausted.
    Format,
    /// Sandbox unusable (timeout or transport failure).
    Environment,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Cost => "exit_cost",
            ExitReason::TotalCost => "exit_total_cost",
            ExitReason::Context => "exit_context",
            ExitReason::Api => "exit_api",
            ExitReason::Format => "exit_format",
            ExitReason::Environment => "exit_environment_error",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unrecognized exit status: {0}")]
pub struct InvalidExitStatus(String);

impl FromStr for ExitReason {
    type Err = InvalidExitStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exit_cost" => Ok(ExitReason::Cost),
            "exit_total_cost" => Ok(ExitReason::TotalCost),
            "exit_context" => Ok(ExitReason::Context),
            "exit_api" => Ok(ExitReason::Api),
            "exit_format" => Ok(ExitReason::Format),
            "exit_environment_error" => Ok(ExitReason::Environment),
            other => Err(InvalidExitStatus(other.to_string())),
        }
    }
}

/// Final status of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The model submitted through the designated submit command.
    Submitted,
    /// A forced stop salvaged by a successful autosubmission,
    /// e.g. `submitted (exit_cost)`.
    AutoSubmitted(ExitReason),
    /// The run stopped without a submission.
    Exited(ExitReason),
}

impl ExitStatus {
    /// True for clean submissions and autosubmission salvages.
    pub fn is_submitted(&self) -> bool {
        matches!(self, ExitStatus::Submitted | ExitStatus::AutoSubmitted(_))
    }

    /// The forcing reason, if any.
    pub fn reason(&self) -> Option<ExitReason> {
        match self {
            ExitStatus::Submitted => None,
            ExitStatus::AutoSubmitted(r) | ExitStatus::Exited(r) => Some(*r),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Submitted => f.write_str("submitted"),
            ExitStatus::AutoSubmitted(reason) => write!(f, "submitted ({reason})"),
            ExitStatus::Exited(reason) => write!(f, "{reason}"),
        }
    }
}

impl FromStr for ExitStatus {
    type Err = InvalidExitStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s == "submitted" {
            return Ok(ExitStatus::Submitted);
        }
        if let Some(reason) = s
            .strip_prefix("submitted (")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            return Ok(ExitStatus::AutoSubmitted(reason.parse()?));
        }
        Ok(ExitStatus::Exited(s.parse()?))
    }
}

impl Serialize for ExitStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExitStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
