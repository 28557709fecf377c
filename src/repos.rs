//! Input repository handling: URL validation, a best-effort reachability
//! probe, and robust shallow cloning into the job work directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::StageError;

/// Checked GitHub repository URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoUrl {
    pub url: String,
    pub owner: String,
    pub name: String,
}

impl RepoUrl {
    /// Validate the URL shape: `https://github.com/<owner>/<repo>` with
    /// non-empty path segments. No network access.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let Some(path) = raw.strip_prefix("https://github.com/") else {
            return Err(format!("not a GitHub repository URL: {}", raw));
        };
        let mut segments = path.trim_end_matches('/').split('/');
        let owner = segments.next().unwrap_or_default();
        let name = segments.next().unwrap_or_default();
        if owner.is_empty() || name.is_empty() || segments.next().is_some() {
            return Err(format!("expected https://github.com/<owner>/<repo>: {}", raw));
        }
        Ok(Self {
            url: raw.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

/// HEAD-probe the repository page. A definite non-200 answer means the repo
/// is private or gone; transport failures are treated as reachable so a flaky
/// network cannot block a job that git itself could still serve.
pub async fn probe_reachable(client: &reqwest::Client, repo: &RepoUrl) -> bool {
    match client
        .head(&repo.url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => true,
        Ok(response) => {
            warn!(url = %repo.url, status = %response.status(), "repository not accessible");
            false
        }
        Err(e) => {
            warn!(url = %repo.url, error = %e, "reachability probe failed, continuing anyway");
            true
        }
    }
}

/// Shallow-clone a repository, trying the `main` branch first and falling
/// back to `master`. Each attempt is bounded by `timeout`.
pub async fn shallow_clone(
    repo: &RepoUrl,
    target: &Path,
    timeout: Duration,
) -> Result<(), StageError> {
    for branch in ["main", "master"] {
        debug!(url = %repo.url, branch, "attempting shallow clone");
        match clone_branch(&repo.url, branch, target, timeout).await {
            Ok(()) => {
                info!(url = %repo.url, branch, target = %target.display(), "cloned");
                return Ok(());
            }
            Err(reason) => {
                debug!(url = %repo.url, branch, %reason, "clone attempt failed");
                // A stale partial checkout would poison the retry.
                if target.exists() {
                    let _ = tokio::fs::remove_dir_all(target).await;
                }
            }
        }
    }
    Err(StageError::CloneFailed {
        url: repo.url.clone(),
        reason: "neither main nor master branch could be cloned".to_string(),
    })
}

async fn clone_branch(
    url: &str,
    branch: &str,
    target: &Path,
    timeout: Duration,
) -> Result<(), String> {
    let mut child = Command::new("git")
        .args(["clone", "--branch", branch, "--depth", "1", url])
        .arg(target)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to launch git: {}", e))?;

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(format!("git exited with {}", status)),
        Ok(Err(e)) => Err(format!("failed waiting on git: {}", e)),
        Err(_) => {
            let _ = child.kill().await;
            Err(format!("clone timed out after {}s", timeout.as_secs()))
        }
    }
}

/// Clone both job inputs into `work_dir/base` and `work_dir/legacy`.
pub async fn clone_inputs(
    base: &RepoUrl,
    legacy: &RepoUrl,
    work_dir: &Path,
    timeout: Duration,
) -> Result<(PathBuf, PathBuf), StageError> {
    let base_dir = work_dir.join("base");
    let legacy_dir = work_dir.join("legacy");
    shallow_clone(base, &base_dir, timeout).await?;
    shallow_clone(legacy, &legacy_dir, timeout).await?;
    Ok((base_dir, legacy_dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_plain_repo_url() {
        let repo = RepoUrl::parse("https://github.com/acme/widgets").unwrap();
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "widgets");
        assert_eq!(repo.url, "https://github.com/acme/widgets");
    }

    #[test]
    fn test_parse_strips_trailing_slash_and_whitespace() {
        let repo = RepoUrl::parse("  https://github.com/acme/widgets/ ").unwrap();
        assert_eq!(repo.url, "https://github.com/acme/widgets");
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(RepoUrl::parse("http://github.com/acme/widgets").is_err());
        assert!(RepoUrl::parse("https://gitlab.com/acme/widgets").is_err());
        assert!(RepoUrl::parse("https://github.com/acme").is_err());
        assert!(RepoUrl::parse("https://github.com/acme/widgets/tree/main").is_err());
        assert!(RepoUrl::parse("https://github.com//widgets").is_err());
        assert!(RepoUrl::parse("").is_err());
    }

    #[tokio::test]
    async fn test_shallow_clone_reports_failure_for_dead_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = RepoUrl {
            url: format!("file://{}/definitely-missing", tmp.path().display()),
            owner: "none".to_string(),
            name: "missing".to_string(),
        };
        let target = tmp.path().join("checkout");
        let err = shallow_clone(&repo, &target, Duration::from_secs(20))
            .await
            .unwrap_err();
        match err {
            StageError::CloneFailed { url, .. } => assert_eq!(url, repo.url),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_shallow_clone_local_repo_with_master_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin");
        std::fs::create_dir(&origin).unwrap();
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(&origin)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@t")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@t")
                .status()
                .unwrap();
            assert!(status.success(), "git {:?}", args);
        };
        git(&["init", "--initial-branch=master"]);
        std::fs::write(origin.join("README.md"), "hello").unwrap();
        git(&["add", "."]);
        git(&["commit", "-m", "init"]);

        let repo = RepoUrl {
            url: format!("file://{}", origin.display()),
            owner: "local".to_string(),
            name: "origin".to_string(),
        };
        let target = tmp.path().join("checkout");
        // main branch fails, master fallback succeeds.
        shallow_clone(&repo, &target, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(target.join("README.md").exists());
    }
}
