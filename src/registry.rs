//! In-memory job tracking.
//!
//! Every submitted integration job gets a registry entry at creation time
//! and keeps it for the life of the process. Status moves strictly forward:
//! once a job reaches a terminal state, later writes cannot regress it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Lifecycle state of an integration job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Position in the forward-only lifecycle. Both terminal states share a
    /// rank; terminal stickiness is enforced separately.
    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::Failed => 2,
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("unknown job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One integration job: the pair of repositories being merged and where the
/// pipeline currently stands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// Name of the stage currently executing, if any.
    pub current_stage: Option<String>,
    pub base_repo: String,
    pub legacy_repo: String,
    pub work_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Terminal failure cause. Set only when status is failed.
    pub error: Option<String>,
    /// Non-fatal stage problems collected along the way.
    pub warnings: Vec<String>,
}

impl Job {
    /// Create a job with its own invocation directory under `work_root`.
    /// The directory name embeds the submission time and a short id prefix.
    pub fn new_in(work_root: &std::path::Path, base_repo: String, legacy_repo: String) -> Self {
        let id = Uuid::new_v4();
        let short = id.simple().to_string();
        let work_dir = work_root.join(format!(
            "invocation_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &short[..8]
        ));
        let mut job = Self::new(base_repo, legacy_repo, work_dir);
        job.id = id;
        job
    }

    pub fn new(base_repo: String, legacy_repo: String, work_dir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            current_stage: None,
            base_repo,
            legacy_repo,
            work_dir,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            warnings: Vec::new(),
        }
    }
}

/// Shared, concurrency-safe map of all jobs seen by this process.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) -> Uuid {
        let id = job.id;
        self.jobs.write().await.insert(id, job);
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Apply an arbitrary mutation to a job entry. Returns false if the id
    /// is unknown.
    pub async fn update<F>(&self, id: Uuid, f: F) -> bool
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    /// Move a job to a new status. Status only moves forward: a backwards
    /// transition is ignored, and terminal states are sticky. Entering a
    /// terminal state stamps `ended_at`.
    pub async fn set_status(&self, id: Uuid, status: JobStatus) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return false;
        };
        if job.status.is_terminal() || status.rank() < job.status.rank() {
            return false;
        }
        job.status = status;
        if status.is_terminal() {
            job.ended_at = Some(Utc::now());
            job.current_stage = None;
        }
        true
    }

    pub async fn set_stage(&self, id: Uuid, stage: &str) {
        self.update(id, |job| job.current_stage = Some(stage.to_string()))
            .await;
    }

    pub async fn add_warning(&self, id: Uuid, warning: impl Into<String>) {
        let warning = warning.into();
        self.update(id, |job| job.warnings.push(warning)).await;
    }

    pub async fn set_error(&self, id: Uuid, error: impl Into<String>) {
        let error = error.into();
        self.update(id, |job| job.error = Some(error)).await;
    }
}
