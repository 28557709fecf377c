//! Pipeline execution: one spawned task per job drives the agent through the
//! stage list, publishing decoded output to the job's broker and applying the
//! stage checks. Cancellation is a watch signal observed during workspace
//! setup and by the stage loop, which owns the child process and kills it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentDriver, StreamParser};
use crate::broker::{StreamBroker, StreamHub};
use crate::config::ReviveConfig;
use crate::errors::{AgentError, StageError};
use crate::pipeline::stage::{Stage, StageContext};
use crate::registry::{JobRegistry, JobStatus};
use crate::repos::{self, RepoUrl};
use crate::sandbox::{self, SandboxHandle, SandboxProvider};

pub struct PipelineRunner {
    registry: Arc<JobRegistry>,
    hub: Arc<StreamHub>,
    config: ReviveConfig,
    driver: AgentDriver,
    sandbox: Option<Arc<dyn SandboxProvider>>,
    cancels: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl PipelineRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        hub: Arc<StreamHub>,
        config: ReviveConfig,
        sandbox: Option<Arc<dyn SandboxProvider>>,
    ) -> Self {
        let driver = AgentDriver::new(config.agent.clone());
        Self {
            registry,
            hub,
            config,
            driver,
            sandbox,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Launch the pipeline for an already-registered job. Returns
    /// immediately; the work happens in a spawned task.
    pub fn start(self: &Arc<Self>, job_id: Uuid, stages: Vec<Stage>) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.lock().unwrap().insert(job_id, cancel_tx);

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run_job(job_id, stages, cancel_rx).await;
            runner.cancels.lock().unwrap().remove(&job_id);
        });
    }

    /// Signal cancellation to a running job. Returns false when the job has
    /// no live pipeline task (never started, or already finished).
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.cancels.lock().unwrap().get(&job_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    async fn run_job(&self, job_id: Uuid, stages: Vec<Stage>, mut cancel_rx: watch::Receiver<bool>) {
        let Some(job) = self.registry.get(job_id).await else {
            warn!(%job_id, "pipeline started for unknown job");
            return;
        };
        let broker = match self.hub.get(job_id) {
            Some(broker) => broker,
            None => self.hub.create(job_id),
        };

        self.registry.set_status(job_id, JobStatus::Running).await;
        info!(%job_id, base = %job.base_repo, legacy = %job.legacy_repo, "pipeline started");
        broker.publish(format!(
            "Integrating {} into {}\n",
            job.legacy_repo, job.base_repo
        ));

        let mut ctx = StageContext {
            base_repo: job.base_repo.clone(),
            legacy_repo: job.legacy_repo.clone(),
            work_dir: job.work_dir.clone(),
            prior_outputs: Vec::new(),
        };

        // Cancellation must also interrupt workspace setup; the clone and
        // sandbox children are kill_on_drop, so abandoning the future reaps
        // them.
        let prepared = tokio::select! {
            prepared = self.prepare(&ctx, &broker) => prepared,
            () = wait_for_cancel(&mut cancel_rx) => Err("cancelled by operator".to_string()),
        };

        let mut sandbox_handle = None;
        let outcome = match prepared {
            Err(cause) => Err(cause),
            Ok(handle) => {
                sandbox_handle = handle;
                self.run_stages(job_id, &mut ctx, &stages, &broker, &mut cancel_rx)
                    .await
            }
        };

        match outcome {
            Ok(()) => {
                if let (Some(provider), Some(handle)) = (&self.sandbox, &sandbox_handle) {
                    self.sandbox_verification(job_id, provider.as_ref(), handle, &broker)
                        .await;
                }
                broker.publish(completion_summary(stages.len(), Utc::now() - job.started_at));
                self.registry.set_status(job_id, JobStatus::Succeeded).await;
                info!(%job_id, "pipeline succeeded");
            }
            Err(cause) => {
                broker.publish(format!("\n\nIntegration failed: {}\n", cause));
                self.registry.set_error(job_id, cause.clone()).await;
                self.registry.set_status(job_id, JobStatus::Failed).await;
                error!(%job_id, %cause, "pipeline failed");
            }
        }

        broker.close();
        if let (Some(provider), Some(handle)) = (&self.sandbox, &sandbox_handle) {
            sandbox::release(provider.as_ref(), handle).await;
        }
    }

    /// Workspace setup: validate and clone both inputs, then provision the
    /// sandbox when one is configured. Any failure here is fatal.
    async fn prepare(
        &self,
        ctx: &StageContext,
        broker: &StreamBroker,
    ) -> Result<Option<SandboxHandle>, String> {
        tokio::fs::create_dir_all(&ctx.work_dir)
            .await
            .map_err(|e| format!("failed to create work directory: {}", e))?;

        let base = RepoUrl::parse(&ctx.base_repo)?;
        let legacy = RepoUrl::parse(&ctx.legacy_repo)?;

        let client = reqwest::Client::new();
        for repo in [&base, &legacy] {
            if !repos::probe_reachable(&client, repo).await {
                return Err(format!("repository not accessible: {}", repo.url));
            }
        }

        broker.publish("Cloning repositories...\n");
        repos::clone_inputs(&base, &legacy, &ctx.work_dir, self.config.clone_timeout)
            .await
            .map_err(|e| e.cause())?;

        match &self.sandbox {
            Some(provider) => {
                broker.publish("Provisioning sandbox...\n");
                let handle = provider
                    .create_from_git_url(&base.url)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Some(handle))
            }
            None => Ok(None),
        }
    }

    /// Drive each stage in order, applying the fatal/non-fatal policy.
    /// Returns the fatal cause, if any.
    async fn run_stages(
        &self,
        job_id: Uuid,
        ctx: &mut StageContext,
        stages: &[Stage],
        broker: &StreamBroker,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        for stage in stages {
            self.registry.set_stage(job_id, stage.name).await;
            broker.publish(format!("\n\n=== {} ===\n", stage.title));

            match self.run_stage(stage, ctx, broker, cancel_rx).await {
                Ok(output) => {
                    ctx.prior_outputs.push((stage.name.to_string(), output));
                }
                Err(StageError::Agent(AgentError::Cancelled)) => {
                    return Err("cancelled by operator".to_string());
                }
                Err(e) if stage.fatal => {
                    return Err(e.cause());
                }
                Err(e) => {
                    let warning = format!("stage {} failed: {}", stage.name, e.cause());
                    warn!(%job_id, stage = stage.name, "{}", warning);
                    broker.publish(format!("\nwarning: {}\n", warning));
                    self.registry.add_warning(job_id, warning).await;
                }
            }
        }
        Ok(())
    }

    /// One agent run: spawn, pump decoded deltas to the broker while watching
    /// for cancellation, reap the child, then check the stage's evidence.
    async fn run_stage(
        &self,
        stage: &Stage,
        ctx: &StageContext,
        broker: &StreamBroker,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<String, StageError> {
        let prompt = stage.build_prompt(ctx);
        let mut process = self.driver.spawn(&prompt, &ctx.work_dir)?;
        let mut parser = StreamParser::new();
        let mut output = String::new();
        let mut cancel_live = true;

        loop {
            tokio::select! {
                changed = cancel_rx.changed(), if cancel_live => {
                    match changed {
                        Ok(()) if *cancel_rx.borrow() => {
                            process.kill().await;
                            return Err(AgentError::Cancelled.into());
                        }
                        Ok(()) => {}
                        Err(_) => cancel_live = false,
                    }
                }
                line = process.next_line() => {
                    match line? {
                        Some(raw) => {
                            if let Some(delta) = parser.parse(&raw) {
                                broker.publish(delta.clone());
                                output.push_str(&delta);
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        process.wait().await?;
        stage.check(&ctx.work_dir)?;
        Ok(output)
    }

    /// Rerun both test scripts inside the sandbox and stream the results.
    /// Failures here are recorded as warnings only.
    async fn sandbox_verification(
        &self,
        job_id: Uuid,
        provider: &dyn SandboxProvider,
        handle: &SandboxHandle,
        broker: &StreamBroker,
    ) {
        broker.publish("\n\n=== Sandbox verification ===\n");
        for script in ["test_base.sh", "test_legacy.sh"] {
            match provider.exec(handle, &format!("bash {}", script)).await {
                Ok(result) => {
                    broker.publish(format!("$ bash {}\n{}\n", script, result.output));
                    if result.exit_code != 0 {
                        let warning = format!(
                            "sandbox verification: {} exited with {}",
                            script, result.exit_code
                        );
                        broker.publish(format!("warning: {}\n", warning));
                        self.registry.add_warning(job_id, warning).await;
                    }
                }
                Err(e) => {
                    let warning = format!("sandbox verification: {}", e);
                    broker.publish(format!("warning: {}\n", warning));
                    self.registry.add_warning(job_id, warning).await;
                }
            }
        }
    }
}

/// Closing line for a finished job's stream.
fn completion_summary(stage_count: usize, elapsed: chrono::Duration) -> String {
    format!(
        "\n\nIntegration complete: {} stages in {}s\n",
        stage_count,
        elapsed.num_seconds().max(0)
    )
}

/// Resolves once cancellation is signalled. Pends forever when the sender is
/// gone, so it can be raced against work that must run to completion.
async fn wait_for_cancel(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StreamUpdate;
    use crate::config::AgentConfig;
    use crate::registry::Job;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn stub_agent(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("stub-agent");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn assistant_line(text: &str) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{}"}}]}}}}"#,
            text
        )
    }

    fn test_runner(agent_cmd: PathBuf, timeout: Duration) -> (Arc<PipelineRunner>, Arc<JobRegistry>, Arc<StreamHub>) {
        let registry = Arc::new(JobRegistry::new());
        let hub = Arc::new(StreamHub::new());
        let config = ReviveConfig {
            agent: AgentConfig {
                command: agent_cmd.display().to_string(),
                model: "test-model".to_string(),
                timeout,
            },
            sandbox: None,
            verification_fatal: false,
            clone_timeout: Duration::from_secs(30),
        };
        let runner = Arc::new(PipelineRunner::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            config,
            None,
        ));
        (runner, registry, hub)
    }

    fn empty_prompt(_: &StageContext) -> String {
        String::new()
    }

    fn plain_stage(name: &'static str, fatal: bool) -> Stage {
        Stage {
            name,
            title: name,
            fatal,
            prompt: empty_prompt,
            artifacts: &[],
            markers: &[],
        }
    }

    async fn registered_job(registry: &JobRegistry, work_dir: &Path) -> Uuid {
        let job = Job::new(
            "https://github.com/acme/base".to_string(),
            "https://github.com/acme/legacy".to_string(),
            work_dir.to_path_buf(),
        );
        let id = registry.insert(job).await;
        registry.set_status(id, JobStatus::Running).await;
        id
    }

    fn context_for(work_dir: &Path) -> StageContext {
        StageContext {
            base_repo: "https://github.com/acme/base".to_string(),
            legacy_repo: "https://github.com/acme/legacy".to_string(),
            work_dir: work_dir.to_path_buf(),
            prior_outputs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_stage_output_reaches_subscribers_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = stub_agent(
            tmp.path(),
            &format!("echo '{}'\necho '{}'", assistant_line("alpha"), assistant_line("beta")),
        );
        let (runner, registry, hub) = test_runner(agent, Duration::from_secs(10));
        let id = registered_job(&registry, tmp.path()).await;
        let broker = hub.create(id);
        let mut sub = broker.subscribe();

        let mut ctx = context_for(tmp.path());
        let (_tx, mut rx) = watch::channel(false);
        let stages = vec![plain_stage("first", true)];
        runner
            .run_stages(id, &mut ctx, &stages, &broker, &mut rx)
            .await
            .unwrap();
        broker.close();

        let mut deltas = Vec::new();
        while let Some(StreamUpdate::Delta(text)) = sub.recv().await {
            deltas.push(text);
        }
        assert_eq!(deltas[0], "\n\n=== first ===\n");
        assert_eq!(deltas[1], "alpha");
        assert_eq!(deltas[2], "beta");
        assert_eq!(ctx.prior_outputs, vec![("first".to_string(), "alphabeta".to_string())]);
    }

    #[tokio::test]
    async fn test_timed_out_stage_is_fatal_with_timeout_cause() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = stub_agent(tmp.path(), "sleep 30");
        let (runner, registry, hub) = test_runner(agent, Duration::from_secs(2));
        let id = registered_job(&registry, tmp.path()).await;
        let broker = hub.create(id);

        let mut ctx = context_for(tmp.path());
        let (_tx, mut rx) = watch::channel(false);
        let stages = vec![plain_stage("stuck", true)];
        let cause = runner
            .run_stages(id, &mut ctx, &stages, &broker, &mut rx)
            .await
            .unwrap_err();
        assert!(cause.contains("no output within"), "cause: {}", cause);
    }

    #[tokio::test]
    async fn test_non_fatal_failure_records_warning_and_continues() {
        let tmp = tempfile::tempdir().unwrap();
        // Fails only when the prompt mentions verification work.
        let agent = stub_agent(
            tmp.path(),
            &format!(
                "case \"$*\" in *verify*) exit 1;; esac\necho '{}'",
                assistant_line("fine")
            ),
        );
        let (runner, registry, hub) = test_runner(agent, Duration::from_secs(10));
        let id = registered_job(&registry, tmp.path()).await;
        let broker = hub.create(id);

        fn verify_prompt(_: &StageContext) -> String {
            "verify everything".to_string()
        }
        let stages = vec![
            Stage {
                name: "check",
                title: "check",
                fatal: false,
                prompt: verify_prompt,
                artifacts: &[],
                markers: &[],
            },
            plain_stage("after", true),
        ];

        let mut ctx = context_for(tmp.path());
        let (_tx, mut rx) = watch::channel(false);
        runner
            .run_stages(id, &mut ctx, &stages, &broker, &mut rx)
            .await
            .unwrap();

        let job = registry.get(id).await.unwrap();
        assert_eq!(job.warnings.len(), 1);
        assert!(job.warnings[0].contains("check"));
        // The following stage still ran.
        assert_eq!(ctx.prior_outputs.len(), 1);
        assert_eq!(ctx.prior_outputs[0].0, "after");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = stub_agent(tmp.path(), "sleep 30");
        let (runner, registry, hub) = test_runner(agent, Duration::from_secs(60));
        let id = registered_job(&registry, tmp.path()).await;
        let broker = hub.create(id);

        let (tx, mut rx) = watch::channel(false);
        let mut ctx = context_for(tmp.path());
        let stages = vec![plain_stage("slow", true)];

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(true);
        });

        let cause = runner
            .run_stages(id, &mut ctx, &stages, &broker, &mut rx)
            .await
            .unwrap_err();
        assert_eq!(cause, "cancelled by operator");
    }

    #[tokio::test]
    async fn test_cancel_during_preparation_fails_job() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = stub_agent(tmp.path(), "true");
        let (runner, registry, hub) = test_runner(agent, Duration::from_secs(10));
        let id = registered_job(&registry, tmp.path()).await;
        hub.create(id);

        // Signal before the workspace setup gets going; the job must fail
        // without ever reaching a stage.
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        runner.run_job(id, vec![plain_stage("never", true)], rx).await;

        let job = registry.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("cancelled by operator"));
    }

    #[tokio::test]
    async fn test_wait_for_cancel_pends_when_sender_is_gone() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let waited =
            tokio::time::timeout(Duration::from_millis(50), wait_for_cancel(&mut rx)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_fatal_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = stub_agent(tmp.path(), &format!("echo '{}'", assistant_line("done")));
        let (runner, registry, hub) = test_runner(agent, Duration::from_secs(10));
        let id = registered_job(&registry, tmp.path()).await;
        let broker = hub.create(id);

        let stages = vec![Stage {
            name: "artifacty",
            title: "artifacty",
            fatal: true,
            prompt: empty_prompt,
            artifacts: &["never_written.md"],
            markers: &[],
        }];
        let mut ctx = context_for(tmp.path());
        let (_tx, mut rx) = watch::channel(false);
        let cause = runner
            .run_stages(id, &mut ctx, &stages, &broker, &mut rx)
            .await
            .unwrap_err();
        assert!(cause.contains("never_written.md"), "cause: {}", cause);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_do_not_share_state() {
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        let agent_ok = stub_agent(tmp_a.path(), &format!("echo '{}'", assistant_line("ok")));
        let agent_bad = stub_agent(tmp_b.path(), "exit 7");

        let (runner_a, registry, hub) = test_runner(agent_ok, Duration::from_secs(10));
        // Second runner shares the registry and hub.
        let config_b = ReviveConfig {
            agent: AgentConfig {
                command: agent_bad.display().to_string(),
                model: "test-model".to_string(),
                timeout: Duration::from_secs(10),
            },
            sandbox: None,
            verification_fatal: false,
            clone_timeout: Duration::from_secs(30),
        };
        let runner_b = Arc::new(PipelineRunner::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            config_b,
            None,
        ));
        let id_a = registered_job(&registry, tmp_a.path()).await;
        let id_b = registered_job(&registry, tmp_b.path()).await;
        let broker_a = hub.create(id_a);
        let broker_b = hub.create(id_b);

        let mut ctx_a = context_for(tmp_a.path());
        let mut ctx_b = context_for(tmp_b.path());
        let (_tx_a, mut rx_a) = watch::channel(false);
        let (_tx_b, mut rx_b) = watch::channel(false);
        let stages_a = vec![plain_stage("good", true)];
        let stages_b = vec![plain_stage("bad", false)];

        let (res_a, res_b) = tokio::join!(
            runner_a.run_stages(id_a, &mut ctx_a, &stages_a, &broker_a, &mut rx_a),
            runner_b.run_stages(id_b, &mut ctx_b, &stages_b, &broker_b, &mut rx_b),
        );
        res_a.unwrap();
        res_b.unwrap();

        let job_a = registry.get(id_a).await.unwrap();
        let job_b = registry.get(id_b).await.unwrap();
        assert!(job_a.warnings.is_empty());
        assert_eq!(job_b.warnings.len(), 1);
        assert_eq!(job_a.current_stage.as_deref(), Some("good"));
        assert_eq!(job_b.current_stage.as_deref(), Some("bad"));
    }

    #[test]
    fn test_completion_summary_names_stage_count_and_duration() {
        let line = completion_summary(4, chrono::Duration::seconds(95));
        assert_eq!(line, "\n\nIntegration complete: 4 stages in 95s\n");
        // Clock skew must not produce a negative duration.
        let skewed = completion_summary(1, chrono::Duration::seconds(-3));
        assert!(skewed.contains("in 0s"));
    }

    #[tokio::test]
    async fn test_cancel_without_live_handle_reports_false() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = stub_agent(tmp.path(), "true");
        let (runner, _, _) = test_runner(agent, Duration::from_secs(1));
        assert!(!runner.cancel(Uuid::new_v4()));
    }
}
