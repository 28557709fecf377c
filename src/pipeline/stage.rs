//! Stage definitions for the integration pipeline.
//!
//! Each stage is static configuration: a prompt builder plus the on-disk
//! evidence required to call the stage done. The runner drives the agent
//! with the prompt and then applies the checks.

use std::path::{Path, PathBuf};

use crate::errors::StageError;

/// Rules prepended to every stage prompt.
const GLOBAL_CONTEXT: &str = "\
Global context:
You are an integration agent. You are given two repositories checked out on \
disk: a current 'base' repository and a 'legacy' repository whose code must \
be integrated into the base. High-level objectives:
- Do not make broad changes to the base repository's code or environment. \
Only make changes without which the legacy code can never run with the base \
(for example, installing a library the legacy code requires that the base \
environment lacks).
- You may modify legacy code for compatibility as long as no core feature of \
it changes.

IMPORTANT COMMAND EXECUTION RULES:
- Do not create files whose names start with '=' (like =1.2.0).
- When installing versioned packages, quote the spec: pip install \"package==1.2.0\".
- Activate the right environment explicitly before conda or pip commands.
- Avoid shell redirection operators unless necessary and the target path is known.
- If a command creates unexpected files, stop and use a different approach.

Specific work to do:
";

pub const MARKER_BASE_OK: &str = "base: env setup and unit tests successful";
pub const MARKER_LEGACY_OK: &str = "legacy: env setup and unit tests successful";

/// Immutable inputs a stage prompt is built from.
pub struct StageContext {
    pub base_repo: String,
    pub legacy_repo: String,
    pub work_dir: PathBuf,
    /// `(stage_name, full_output)` for every stage already completed, in
    /// execution order.
    pub prior_outputs: Vec<(String, String)>,
}

impl StageContext {
    pub fn base_dir(&self) -> PathBuf {
        self.work_dir.join("base")
    }

    pub fn legacy_dir(&self) -> PathBuf {
        self.work_dir.join("legacy")
    }
}

/// Static description of one pipeline stage.
pub struct Stage {
    pub name: &'static str,
    /// Human-readable heading shown in the live stream.
    pub title: &'static str,
    /// Whether a failure here fails the whole job.
    pub fatal: bool,
    pub prompt: fn(&StageContext) -> String,
    /// Files (relative to the work dir) that must exist afterwards.
    pub artifacts: &'static [&'static str],
    /// `(file, marker)` pairs: each file must contain its marker string.
    pub markers: &'static [(&'static str, &'static str)],
}

impl Stage {
    /// Verify the stage's on-disk evidence. Missing artifacts are reported
    /// together; markers are checked after artifacts.
    pub fn check(&self, work_dir: &Path) -> Result<(), StageError> {
        let missing: Vec<String> = self
            .artifacts
            .iter()
            .filter(|name| !work_dir.join(name).exists())
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(StageError::ArtifactsMissing {
                stage: self.name.to_string(),
                missing,
            });
        }
        for (file, marker) in self.markers {
            let content = std::fs::read_to_string(work_dir.join(file)).unwrap_or_default();
            if !content.contains(marker) {
                return Err(StageError::MarkerNotFound {
                    stage: self.name.to_string(),
                    marker: marker.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn build_prompt(&self, ctx: &StageContext) -> String {
        format!("{}{}", GLOBAL_CONTEXT, (self.prompt)(ctx))
    }
}

fn setup_base_prompt(ctx: &StageContext) -> String {
    let work_dir = ctx.work_dir.display();
    let base_dir = ctx.base_dir();
    let base_dir = base_dir.display();
    format!(
        "1. Read the repository at {base_dir} at a high level.\n\
         2. Write a file {work_dir}/summarize_base.md that summarizes what the repository is about.\n\
         3. Make a script {work_dir}/setup_base.sh that creates a conda environment env_base and installs the dependencies to run the base repository.\n\
         4. Run {work_dir}/setup_base.sh and make sure the environment is set up correctly. Delete env_base first if it already exists.\n\
         5. Write a single file {work_dir}/test_base.sh which tests that the base repository works properly.\n\
         6. Activate env_base and make {work_dir}/test_base.sh run correctly. If it does, append\n\
         '{MARKER_BASE_OK}'\n\
         else write\n\
         'base: env setup and unit tests failed'\n\
         in {work_dir}/agent_summary.txt\n"
    )
}

fn setup_legacy_prompt(ctx: &StageContext) -> String {
    let work_dir = ctx.work_dir.display();
    let legacy_dir = ctx.legacy_dir();
    let legacy_dir = legacy_dir.display();
    format!(
        "1. Make sure the legacy repository from {url} is checked out at {legacy_dir}.\n\
         2. Read the code and dependencies from {legacy_dir} and understand at a high level what it is. Summarize it in {work_dir}/summarize_legacy.md.\n\
         3. Write a single file {work_dir}/test_legacy.sh which tests that the legacy repository works properly.\n",
        url = ctx.legacy_repo,
    )
}

fn resolve_dependencies_prompt(ctx: &StageContext) -> String {
    let work_dir = ctx.work_dir.display();
    let legacy_dir = ctx.legacy_dir();
    let legacy_dir = legacy_dir.display();
    format!(
        "1. Make obvious changes to the code at {legacy_dir} so that it can run with the env_base environment.\n\
         2. Activate env_base and try to run {work_dir}/test_legacy.sh. If there are errors, iterate and fix the legacy code.\n\
         Do not install everything the legacy repository lists. Only add dependencies or modify env_base when absolutely necessary.\n\
         3. If you modify env_base, run {work_dir}/test_base.sh again to verify it still passes.\n\
         4. Verify {work_dir}/test_legacy.sh runs with env_base. If it does, append\n\
         '{MARKER_LEGACY_OK}'\n\
         else write\n\
         'legacy: env setup and unit tests failed'\n\
         in {work_dir}/agent_summary.txt\n\
         5. Make sure the base environment still works by running {work_dir}/test_base.sh. If not, iterate and fix it.\n"
    )
}

fn final_verification_prompt(ctx: &StageContext) -> String {
    let work_dir = ctx.work_dir.display();
    format!(
        "1. Activate env_base.\n\
         2. Run and verify {work_dir}/test_legacy.sh works correctly. If it does, append\n\
         '{MARKER_LEGACY_OK}'\n\
         else write\n\
         'legacy: env setup and unit tests failed'\n\
         in {work_dir}/final_summary.txt\n\
         3. Run and verify {work_dir}/test_base.sh works correctly. If it does, append\n\
         '{MARKER_BASE_OK}'\n\
         else write\n\
         'base: env setup and unit tests failed'\n\
         in {work_dir}/final_summary.txt\n"
    )
}

/// The built-in integration pipeline, in execution order.
pub fn default_stages(verification_fatal: bool) -> Vec<Stage> {
    vec![
        Stage {
            name: "setup_base",
            title: "Base environment setup",
            fatal: true,
            prompt: setup_base_prompt,
            artifacts: &["summarize_base.md", "setup_base.sh", "test_base.sh"],
            markers: &[("agent_summary.txt", MARKER_BASE_OK)],
        },
        Stage {
            name: "setup_legacy",
            title: "Legacy repository analysis",
            fatal: true,
            prompt: setup_legacy_prompt,
            artifacts: &["summarize_legacy.md", "test_legacy.sh"],
            markers: &[],
        },
        Stage {
            name: "resolve_dependencies",
            title: "Dependency resolution",
            fatal: true,
            prompt: resolve_dependencies_prompt,
            artifacts: &[],
            markers: &[("agent_summary.txt", MARKER_LEGACY_OK)],
        },
        Stage {
            name: "final_verification",
            title: "Final verification",
            fatal: verification_fatal,
            prompt: final_verification_prompt,
            artifacts: &[],
            markers: &[
                ("final_summary.txt", MARKER_BASE_OK),
                ("final_summary.txt", MARKER_LEGACY_OK),
            ],
        },
    ]
}
