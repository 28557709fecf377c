use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Configuration for invoking the external agent CLI.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent binary. Overridable with the `REVIVE_AGENT_CMD` env var.
    pub command: String,
    pub model: String,
    /// Wall-clock bound for a single prompt run.
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: std::env::var("REVIVE_AGENT_CMD")
                .unwrap_or_else(|_| "cursor-agent".to_string()),
            model: "sonnet-4.5".to_string(),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Configuration for the remote sandbox collaborator. Absent means stages
/// run without sandbox verification.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

/// Top-level service configuration, loaded from `revive.toml`.
#[derive(Debug, Clone)]
pub struct ReviveConfig {
    pub agent: AgentConfig,
    pub sandbox: Option<SandboxSettings>,
    /// Whether a final-verification stage failure fails the whole job.
    pub verification_fatal: bool,
    /// Per-clone timeout for repository checkout.
    pub clone_timeout: Duration,
}

impl Default for ReviveConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            sandbox: None,
            verification_fatal: false,
            clone_timeout: Duration::from_secs(120),
        }
    }
}

/// Raw TOML structure for `revive.toml`.
#[derive(Debug, Deserialize)]
struct ReviveToml {
    agent: Option<AgentSection>,
    sandbox: Option<SandboxSection>,
    pipeline: Option<PipelineSection>,
}

#[derive(Debug, Deserialize)]
struct AgentSection {
    command: Option<String>,
    model: Option<String>,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    base_url: String,
    token: Option<String>,
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PipelineSection {
    verification_fatal: Option<bool>,
    clone_timeout: Option<u64>,
}

impl ReviveConfig {
    /// Load config from `revive.toml` in the given directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("revive.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let toml: ReviveToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        if let Some(section) = toml.agent {
            if let Some(command) = section.command {
                // The env override wins over the config file.
                if std::env::var("REVIVE_AGENT_CMD").is_err() {
                    config.agent.command = command;
                }
            }
            if let Some(model) = section.model {
                config.agent.model = model;
            }
            if let Some(timeout) = section.timeout {
                config.agent.timeout = Duration::from_secs(timeout);
            }
        }
        if let Some(section) = toml.sandbox {
            config.sandbox = Some(SandboxSettings {
                base_url: section.base_url,
                token: section.token,
                timeout: Duration::from_secs(section.timeout.unwrap_or(120)),
            });
        }
        if let Some(section) = toml.pipeline {
            if let Some(fatal) = section.verification_fatal {
                config.verification_fatal = fatal;
            }
            if let Some(secs) = section.clone_timeout {
                config.clone_timeout = Duration::from_secs(secs);
            }
        }

        Ok(config)
    }
}
