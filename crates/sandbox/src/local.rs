//! Persistent local bash session.
//!
//! One `bash` child process lives for the whole run, so working directory,
//! environment variables and sourced tool functions persist between
//! commands. Each command is framed with a sentinel echo that recovers the
//! exit code; stderr is merged into stdout at session start.
//!
//! A command that outruns its timeout gets its children killed; if the
//! sentinel still arrives afterwards the session survives and the caller
//! sees `SandboxError::Timeout`, otherwise the session is torn down.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use patchwright_core::error::SandboxError;
use patchwright_core::sandbox::{ExecutionResult, Sandbox};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

const SENTINEL_PREFIX: &str = "__PATCHWRIGHT_RC_";

/// Grace period for the sentinel to arrive after an interrupt.
const INTERRUPT_GRACE: Duration = Duration::from_secs(10);

struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    // `Lines` keeps partially read data across cancelled reads, so a timed
    // out drain does not corrupt the next one.
    lines: Lines<BufReader<ChildStdout>>,
}

pub struct LocalShell {
    workdir: Option<PathBuf>,
    session: Option<ShellSession>,
}

impl LocalShell {
    pub fn new() -> Self {
        Self {
            workdir: None,
            session: None,
        }
    }

    /// Start the session in the given directory instead of the caller's.
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            match &self.workdir {
                Some(workdir) => workdir.join(path),
                None => path.to_path_buf(),
            }
        }
    }

    /// Read lines until the sentinel for `marker` shows up; everything
    /// before it is command output.
    async fn drain_until(
        lines: &mut Lines<BufReader<ChildStdout>>,
        marker: &str,
    ) -> Result<ExecutionResult, SandboxError> {
        let sentinel = format!("{SENTINEL_PREFIX}{marker}");
        let mut output = String::new();
        loop {
            let Some(line) = lines.next_line().await? else {
                return Err(SandboxError::SessionClosed("shell exited".into()));
            };
            if let Some(rest) = line.strip_prefix(sentinel.as_str()) {
                let exit_code = rest.trim().parse::<i32>().unwrap_or(-1);
                // Drop the newline appended after the command's last line.
                if output.ends_with('\n') {
                    output.pop();
                }
                return Ok(ExecutionResult { output, exit_code });
            }
            output.push_str(&line);
            output.push('\n');
        }
    }

    /// Kill the children of the session shell so it can return to reading
    /// commands. The shell itself must not be signalled; bash exits when its
    /// foreground job dies from a group-wide SIGINT.
    async fn kill_foreground(&mut self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let Some(pid) = session.child.id() else {
            return false;
        };
        match Command::new("pkill")
            .arg("-9")
            .arg("-P")
            .arg(pid.to_string())
            .status()
            .await
        {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "failed to run pkill, giving up on the session");
                false
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.stdin.write_all(b"exit\n").await;
            let _ = session.child.kill().await;
        }
    }
}

impl Default for LocalShell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for LocalShell {
    fn name(&self) -> &str {
        "local"
    }

    async fn start_session(&mut self) -> Result<(), SandboxError> {
        if self.session.is_some() {
            return Ok(());
        }
        let mut command = Command::new("bash");
        command
            .arg("--norc")
            .arg("--noprofile")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(workdir) = &self.workdir {
            command.current_dir(workdir);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Transport("shell stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Transport("shell stdout unavailable".into()))?;
        self.session = Some(ShellSession {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        });

        // Merge stderr into the output stream for the whole session.
        self.execute("exec 2>&1", Duration::from_secs(5)).await?;
        info!(workdir = ?self.workdir, "local shell session started");
        Ok(())
    }

    async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let session = self
            .session
            .as_mut()
            .ok_or(SandboxError::SessionNotStarted)?;

        let marker = Uuid::new_v4().simple().to_string();
        let framed = format!("{command}\necho \"{SENTINEL_PREFIX}{marker} $?\"\n");
        session.stdin.write_all(framed.as_bytes()).await?;
        session.stdin.flush().await?;
        debug!(%command, "executing in local shell");

        match tokio::time::timeout(timeout, Self::drain_until(&mut session.lines, &marker)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                self.teardown().await;
                Err(err)
            }
            Err(_elapsed) => {
                warn!(%command, timeout_secs = timeout.as_secs(), "command timed out, interrupting");
                if self.kill_foreground().await {
                    let session = self
                        .session
                        .as_mut()
                        .ok_or(SandboxError::SessionNotStarted)?;
                    match tokio::time::timeout(
                        INTERRUPT_GRACE,
                        Self::drain_until(&mut session.lines, &marker),
                    )
                    .await
                    {
                        Ok(Ok(_discarded)) => {
                            return Err(SandboxError::Timeout {
                                timeout_secs: timeout.as_secs(),
                            });
                        }
                        _ => {
                            warn!("session did not settle after interrupt, closing it");
                        }
                    }
                }
                self.teardown().await;
                Err(SandboxError::SessionClosed(
                    "no response after interrupt".into(),
                ))
            }
        }
    }

    async fn write_file(&mut self, path: &Path, content: &str) -> Result<(), SandboxError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn upload_directory(&mut self, source: &Path, dest: &Path) -> Result<(), SandboxError> {
        let target = self.resolve(dest);
        copy_tree(source, &target)?;
        Ok(())
    }

    async fn close_session(&mut self) -> Result<(), SandboxError> {
        self.teardown().await;
        Ok(())
    }
}

fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started() -> LocalShell {
        let mut shell = LocalShell::new();
        shell.start_session().await.unwrap();
        shell
    }

    #[tokio::test]
    async fn reports_output_and_exit_codes() {
        let mut shell = started().await;

        let ok = shell
            .execute("echo hello", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ok.output, "hello");
        assert_eq!(ok.exit_code, 0);
        assert!(ok.success());

        let failed = shell.execute("false", Duration::from_secs(5)).await.unwrap();
        assert_eq!(failed.exit_code, 1);
        assert!(!failed.success());

        shell.close_session().await.unwrap();
    }

    #[tokio::test]
    async fn stderr_is_merged_into_output() {
        let mut shell = started().await;
        let result = shell
            .execute("echo oops >&2", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.output, "oops");
        shell.close_session().await.unwrap();
    }

    #[tokio::test]
    async fn state_persists_between_commands() {
        let mut shell = started().await;
        shell
            .execute("MARKER=persistent", Duration::from_secs(5))
            .await
            .unwrap();
        let result = shell
            .execute("echo $MARKER", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.output, "persistent");
        shell.close_session().await.unwrap();
    }

    #[tokio::test]
    async fn execute_without_session_fails() {
        let mut shell = LocalShell::new();
        let err = shell
            .execute("echo hi", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SessionNotStarted));
    }

    #[tokio::test]
    async fn timeout_interrupts_and_keeps_the_session() {
        let mut shell = started().await;
        let err = shell
            .execute("sleep 30", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        // The session survives the interrupt.
        let result = shell
            .execute("echo back", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.output, "back");
        shell.close_session().await.unwrap();
    }

    #[tokio::test]
    async fn write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let mut shell = LocalShell::new().with_workdir(dir.path());
        shell.start_session().await.unwrap();

        shell
            .write_file(Path::new("nested/dir/file.txt"), "content")
            .await
            .unwrap();
        let on_disk = std::fs::read_to_string(dir.path().join("nested/dir/file.txt")).unwrap();
        assert_eq!(on_disk, "content");
        shell.close_session().await.unwrap();
    }

    #[tokio::test]
    async fn upload_directory_copies_recursively() {
        let source = tempfile::tempdir().unwrap();
        std::fs::create_dir(source.path().join("bin")).unwrap();
        std::fs::write(source.path().join("bin/tool"), "#!/bin/bash\n").unwrap();
        std::fs::write(source.path().join("top.txt"), "x").unwrap();

        let dest = tempfile::tempdir().unwrap();
        let mut shell = LocalShell::new();
        shell.start_session().await.unwrap();
        shell
            .upload_directory(source.path(), &dest.path().join("tools"))
            .await
            .unwrap();

        assert!(dest.path().join("tools/bin/tool").exists());
        assert!(dest.path().join("tools/top.txt").exists());
        shell.close_session().await.unwrap();
    }

    #[tokio::test]
    async fn close_session_is_idempotent() {
        let mut shell = started().await;
        shell.close_session().await.unwrap();
        shell.close_session().await.unwrap();
    }

    #[tokio::test]
    async fn multiline_heredoc_commands_round_trip() {
        let mut shell = started().await;
        let result = shell
            .execute(
                "cat << 'EOF'\nfirst\nsecond\nEOF",
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(result.output, "first\nsecond");
        shell.close_session().await.unwrap();
    }
}
