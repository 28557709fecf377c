//! Typed error hierarchy for the revive service.
//!
//! Three enums cover the three failure domains:
//! - `AgentError` — launching and driving the external agent process
//! - `SandboxError` — the remote sandbox collaborator
//! - `StageError` — per-stage pipeline failures (wraps the other two)

use thiserror::Error;

/// Errors from spawning or driving the external agent CLI.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to launch agent process: {0}")]
    LaunchFailed(#[source] std::io::Error),

    #[error("Agent produced no output within {secs}s")]
    Timeout { secs: u64 },

    #[error("Agent exited with code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },

    #[error("Agent run cancelled by operator")]
    Cancelled,

    #[error("I/O error while reading agent output: {0}")]
    Io(#[source] std::io::Error),
}

/// Errors from the sandbox provisioning collaborator.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("Sandbox exec failed: {0}")]
    Exec(String),

    /// Stop/delete failures. Logged by callers, never propagated to a job.
    #[error("Sandbox cleanup failed: {0}")]
    Cleanup(String),
}

/// Errors from a single pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Stage '{stage}' did not produce required artifacts: {missing:?}")]
    ArtifactsMissing { stage: String, missing: Vec<String> },

    #[error("Stage '{stage}' did not record success marker '{marker}'")]
    MarkerNotFound { stage: String, marker: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Failed to clone {url}: {reason}")]
    CloneFailed { url: String, reason: String },
}

impl StageError {
    /// Short cause string recorded on the failed job and shown by the
    /// status endpoint.
    pub fn cause(&self) -> String {
        self.to_string()
    }
}
