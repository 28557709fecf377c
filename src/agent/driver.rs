//! Lifecycle of the external agent CLI process.
//!
//! The agent is spawned once per stage with the full prompt as an argument
//! and `--output-format stream-json`, and its stdout is consumed line by
//! line while it runs. A wall-clock deadline covers the whole invocation;
//! hitting it kills the process but leaves already-read output with the
//! caller.

use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;

use crate::config::AgentConfig;
use crate::errors::AgentError;

/// Spawns agent processes per the configured command and model.
#[derive(Debug, Clone)]
pub struct AgentDriver {
    config: AgentConfig,
}

impl AgentDriver {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Spawn one agent invocation for `prompt` in `working_dir`.
    pub fn spawn(&self, prompt: &str, working_dir: &Path) -> Result<AgentProcess, AgentError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args([
            "--print",
            "--model",
            &self.config.model,
            "--output-format",
            "stream-json",
            prompt,
        ])
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(AgentError::LaunchFailed)?;

        let stdout = child
            .stdout
            .take()
            .map(|out| BufReader::new(out).lines())
            .ok_or_else(|| {
                AgentError::Io(std::io::Error::other("child stdout not captured"))
            })?;
        let stderr = child.stderr.take();

        Ok(AgentProcess {
            child,
            lines: stdout,
            stderr,
            deadline: Instant::now() + self.config.timeout,
            timeout_secs: self.config.timeout.as_secs(),
        })
    }
}

/// A running agent invocation. Owned by exactly one stage; must be fully
/// reaped (`wait` or `kill`) before the next stage starts.
pub struct AgentProcess {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: Option<ChildStderr>,
    deadline: Instant,
    timeout_secs: u64,
}

impl AgentProcess {
    /// Pull the next raw stdout line. `Ok(None)` signals end of stream.
    ///
    /// Cancel-safe: dropping the future mid-read does not lose a line, so
    /// callers may `select!` against a cancellation signal.
    pub async fn next_line(&mut self) -> Result<Option<String>, AgentError> {
        match tokio::time::timeout_at(self.deadline, self.lines.next_line()).await {
            Ok(result) => result.map_err(AgentError::Io),
            Err(_) => {
                self.kill().await;
                Err(AgentError::Timeout {
                    secs: self.timeout_secs,
                })
            }
        }
    }

    /// Reap the process: drain stderr (diagnostic only), collect the exit
    /// status within the remaining deadline.
    pub async fn wait(mut self) -> Result<(), AgentError> {
        let stderr_content = match self.stderr.take() {
            Some(stderr) => {
                let drain = async {
                    let mut content = String::new();
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        content.push_str(&line);
                        content.push('\n');
                    }
                    content
                };
                // A child that closes stdout but keeps stderr open must not
                // outlive the wall-clock deadline.
                match tokio::time::timeout_at(self.deadline, drain).await {
                    Ok(content) => content,
                    Err(_) => {
                        self.kill().await;
                        return Err(AgentError::Timeout {
                            secs: self.timeout_secs,
                        });
                    }
                }
            }
            None => String::new(),
        };
        if !stderr_content.is_empty() {
            tracing::debug!(stderr = %stderr_content.trim(), "agent stderr");
        }

        let status = match tokio::time::timeout_at(self.deadline, self.child.wait()).await {
            Ok(result) => result.map_err(AgentError::Io)?,
            Err(_) => {
                self.kill().await;
                return Err(AgentError::Timeout {
                    secs: self.timeout_secs,
                });
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(AgentError::ProcessFailed {
                exit_code: status.code().unwrap_or(-1),
                stderr: stderr_content.trim().to_string(),
            })
        }
    }

    /// Kill the process and reap it. Used on timeout and cancellation.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "failed to kill agent process");
        }
    }
}
