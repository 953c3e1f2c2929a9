//! Sandbox trait — the execution boundary for agent actions.
//!
//! A sandbox is a persistent interactive shell session: working directory
//! and environment variables survive between `execute` calls within one
//! session. The agent loop is the only caller and drives it strictly
//! sequentially, so the trait takes `&mut self` — one session, one owner.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SandboxError;

/// Output of one executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub output: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The runtime contract consumed by the agent loop and the tool catalog.
///
/// Errors are either a [`SandboxError::Timeout`] (recoverable at the
/// caller's discretion) or a hard transport/session failure (fatal for
/// the run).
#[async_trait]
pub trait Sandbox: Send {
    /// A short name for this runtime (e.g. "local-shell").
    fn name(&self) -> &str;

    /// Open the persistent session. Must precede any `execute`.
    async fn start_session(&mut self) -> std::result::Result<(), SandboxError>;

    /// Run a command in the session and wait for output plus exit code.
    async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> std::result::Result<ExecutionResult, SandboxError>;

    /// Write a file inside the sandbox.
    async fn write_file(
        &mut self,
        path: &Path,
        content: &str,
    ) -> std::result::Result<(), SandboxError>;

    /// Recursively copy a host directory into the sandbox.
    async fn upload_directory(
        &mut self,
        source: &Path,
        dest: &Path,
    ) -> std::result::Result<(), SandboxError>;

    /// Terminate the session. Idempotent.
    async fn close_session(&mut self) -> std::result::Result<(), SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoSandbox {
        started: bool,
    }

    #[async_trait]
    impl Sandbox for EchoSandbox {
        fn name(&self) -> &str {
            "echo"
        }

        async fn start_session(&mut self) -> std::result::Result<(), SandboxError> {
            self.started = true;
            Ok(())
        }

        async fn execute(
            &mut self,
            command: &str,
            _timeout: Duration,
        ) -> std::result::Result<ExecutionResult, SandboxError> {
            if !self.started {
                return Err(SandboxError::SessionNotStarted);
            }
            Ok(ExecutionResult {
                output: command.to_string(),
                exit_code: 0,
            })
        }

        async fn write_file(
            &mut self,
            _path: &Path,
            _content: &str,
        ) -> std::result::Result<(), SandboxError> {
            Ok(())
        }

        async fn upload_directory(
            &mut self,
            _source: &Path,
            _dest: &Path,
        ) -> std::result::Result<(), SandboxError> {
            Ok(())
        }

        async fn close_session(&mut self) -> std::result::Result<(), SandboxError> {
            self.started = false;
            Ok(())
        }
    }

    #[tokio::test]
    async fn execute_requires_open_session() {
        let mut sandbox = EchoSandbox { started: false };
        let err = sandbox
            .execute("pwd", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SessionNotStarted));

        sandbox.start_session().await.unwrap();
        let result = sandbox.execute("pwd", Duration::from_secs(1)).await.unwrap();
        assert!(result.success());
        assert_eq!(result.output, "pwd");
    }
}
