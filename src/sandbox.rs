//! Remote execution sandbox collaborator.
//!
//! Verification commands run inside an isolated environment provisioned from
//! the base repository, reached over HTTP. The trait keeps the pipeline
//! testable without a live sandbox service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SandboxSettings;
use crate::errors::SandboxError;

/// Opaque reference to a provisioned sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
}

/// Result of one command execution inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a sandbox with the repository cloned into it.
    async fn create_from_git_url(&self, git_url: &str) -> Result<SandboxHandle, SandboxError>;

    /// Run a shell command in the sandbox and wait for it to finish.
    async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, SandboxError>;

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    async fn delete(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

/// Stop and delete a sandbox, swallowing failures. Cleanup problems are
/// logged and never fail the job that owned the sandbox.
pub async fn release(provider: &dyn SandboxProvider, handle: &SandboxHandle) {
    if let Err(e) = provider.stop(handle).await {
        warn!(sandbox_id = %handle.id, error = %e, "failed to stop sandbox");
    }
    if let Err(e) = provider.delete(handle).await {
        warn!(sandbox_id = %handle.id, error = %e, "failed to delete sandbox");
    }
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    git_url: &'a str,
}

#[derive(Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
}

/// `SandboxProvider` over a remote sandbox service's REST API.
pub struct HttpSandbox {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpSandbox {
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            timeout: settings.timeout,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(self.timeout);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl SandboxProvider for HttpSandbox {
    async fn create_from_git_url(&self, git_url: &str) -> Result<SandboxHandle, SandboxError> {
        let response = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&CreateRequest { git_url })
            .send()
            .await
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Provisioning(format!(
                "sandbox service returned {}",
                response.status()
            )));
        }
        let created: CreateResponse = response
            .json()
            .await
            .map_err(|e| SandboxError::Provisioning(e.to_string()))?;
        Ok(SandboxHandle { id: created.id })
    }

    async fn exec(&self, handle: &SandboxHandle, command: &str) -> Result<ExecOutput, SandboxError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/exec", handle.id),
            )
            .json(&ExecRequest { command })
            .send()
            .await
            .map_err(|e| SandboxError::Exec(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Exec(format!(
                "sandbox service returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SandboxError::Exec(e.to_string()))
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/stop", handle.id),
            )
            .send()
            .await
            .map_err(|e| SandboxError::Cleanup(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Cleanup(format!(
                "stop returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/sandboxes/{}", handle.id),
            )
            .send()
            .await
            .map_err(|e| SandboxError::Cleanup(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SandboxError::Cleanup(format!(
                "delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Assemble a provider from config, if sandbox use is enabled at all.
pub fn provider_from_settings(
    settings: Option<&SandboxSettings>,
) -> Option<Arc<dyn SandboxProvider>> {
    settings.map(|s| Arc::new(HttpSandbox::new(s)) as Arc<dyn SandboxProvider>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records calls and fails exactly the operations it is told to fail.
    struct FlakySandbox {
        fail_stop: bool,
        fail_delete: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FlakySandbox {
        fn new(fail_stop: bool, fail_delete: bool) -> Self {
            Self {
                fail_stop,
                fail_delete,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SandboxProvider for FlakySandbox {
        async fn create_from_git_url(&self, _: &str) -> Result<SandboxHandle, SandboxError> {
            self.calls.lock().unwrap().push("create");
            Ok(SandboxHandle { id: "sb-1".into() })
        }

        async fn exec(&self, _: &SandboxHandle, _: &str) -> Result<ExecOutput, SandboxError> {
            self.calls.lock().unwrap().push("exec");
            Ok(ExecOutput {
                exit_code: 0,
                output: "ok".into(),
            })
        }

        async fn stop(&self, _: &SandboxHandle) -> Result<(), SandboxError> {
            self.calls.lock().unwrap().push("stop");
            if self.fail_stop {
                return Err(SandboxError::Cleanup("stop refused".into()));
            }
            Ok(())
        }

        async fn delete(&self, _: &SandboxHandle) -> Result<(), SandboxError> {
            self.calls.lock().unwrap().push("delete");
            if self.fail_delete {
                return Err(SandboxError::Cleanup("delete refused".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_release_runs_stop_then_delete() {
        let sandbox = FlakySandbox::new(false, false);
        let handle = sandbox.create_from_git_url("https://github.com/a/b").await.unwrap();
        release(&sandbox, &handle).await;
        assert_eq!(*sandbox.calls.lock().unwrap(), vec!["create", "stop", "delete"]);
    }

    #[tokio::test]
    async fn test_release_swallows_cleanup_failures() {
        let sandbox = FlakySandbox::new(true, true);
        let handle = SandboxHandle { id: "sb-x".into() };
        // Must not panic or propagate despite both operations failing.
        release(&sandbox, &handle).await;
        assert_eq!(*sandbox.calls.lock().unwrap(), vec!["stop", "delete"]);
    }

    #[test]
    fn test_provider_from_settings() {
        assert!(provider_from_settings(None).is_none());
        let settings = SandboxSettings {
            base_url: "http://localhost:9900/".into(),
            token: Some("secret".into()),
            timeout: Duration::from_secs(120),
        };
        assert!(provider_from_settings(Some(&settings)).is_some());
    }
}
