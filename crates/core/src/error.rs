//! Error types for the patchwright domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant; the agent loop maps
//! them onto terminal exit statuses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all patchwright operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Model querying ---
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    // --- Sandbox boundary ---
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    // --- Action parsing ---
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    // --- Configuration (load time, fatal) ---
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Filesystem ---
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures raised while querying a model backend or enforcing spend limits.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Context window ({max_context} tokens) exceeded")]
    ContextWindowExceeded { max_context: u32 },

    #[error("Instance cost limit ${limit:.2} exceeded (spent ${spent:.4})")]
    InstanceCostLimitExceeded { limit: f64, spent: f64 },

    #[error("Total cost limit ${limit:.2} exceeded (spent ${spent:.4})")]
    TotalCostLimitExceeded { limit: f64, spent: f64 },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl ModelError {
    /// Whether the client may retry the request with backoff.
    ///
    /// Cost and context failures are terminal for the run; auth failures
    /// never heal on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::RateLimited { .. }
            | ModelError::Network(_)
            | ModelError::Timeout(_)
            | ModelError::MalformedResponse(_) => true,
            ModelError::Api { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

/// Failures at the sandbox/runtime boundary.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Session not started")]
    SessionNotStarted,

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Timeouts can be tolerated by the caller; everything else means the
    /// session is unusable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout { .. })
    }
}

/// Machine-readable reason codes for structured-parser failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatErrorCode {
    /// No tool call / command field present.
    Missing,
    /// More than one tool call present.
    Multiple,
    /// Arguments or raw text are not valid JSON.
    InvalidJson,
    /// The named command is not in the catalog.
    InvalidCommand,
    /// A required argument was not supplied.
    MissingArg,
    /// An argument was supplied that the command does not declare.
    UnexpectedArg,
}

impl FormatErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormatErrorCode::Missing => "missing",
            FormatErrorCode::Multiple => "multiple",
            FormatErrorCode::InvalidJson => "invalid_json",
            FormatErrorCode::InvalidCommand => "invalid_command",
            FormatErrorCode::MissingArg => "missing_arg",
            FormatErrorCode::UnexpectedArg => "unexpected_arg",
        }
    }
}

/// Raised when model output cannot be turned into an executable action.
///
/// The agent loop treats this as retryable within its requery budget; the
/// optional code carries the structured-parser reason for logging and tests.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FormatError {
    pub message: String,
    pub code: Option<FormatErrorCode>,
}

impl FormatError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn coded(code: FormatErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

/// Load-time configuration failures. Always fatal at startup, never
/// surfaced mid-run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Command '{name}' is defined multiple times (first in {first}, again in {second})")]
    DuplicateCommand {
        name: String,
        first: String,
        second: String,
    },

    #[error("Invalid bundle at {path}: {reason}")]
    InvalidBundle { path: String, reason: String },

    #[error("Unknown model '{0}' and no metadata override supplied")]
    UnknownModel(String),

    #[error("Invalid template '{name}': {reason}")]
    InvalidTemplate { name: String, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}
