//! # Patchwright Core
//!
//! Domain types, traits, and error definitions for the patchwright
//! coding-agent runtime. This crate has **zero framework dependencies** —
//! it defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The two external boundaries (model provider, sandbox runtime) are
//! traits here; implementations live in their own crates. Everything else
//! is plain data: history, trajectories, stats, and exit statuses are
//! value types that serialize to the on-disk run record.

pub mod error;
pub mod exit;
pub mod message;
pub mod model;
pub mod sandbox;
pub mod stats;
pub mod trajectory;

// Re-export key types at crate root for ergonomics
pub use error::{ConfigError, Error, FormatError, FormatErrorCode, ModelError, Result, SandboxError};
pub use exit::{ExitReason, ExitStatus};
pub use message::{HistoryItem, Message, Role, TAG_KEEP_ALWAYS, TAG_OMIT_ALWAYS};
pub use model::{
    CompletionRequest, CompletionResponse, ModelBackend, ModelOutput, ToolCall, ToolSpec,
};
pub use sandbox::{ExecutionResult, Sandbox};
pub use stats::ApiStats;
pub use trajectory::{AgentInfo, TrajectoryRecord, TrajectoryStep};
