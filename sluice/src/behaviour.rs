use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::Job;

/// Bitmask deciding when a behaviour fires.
///
/// `ON_EXIT` behaviours run after the success/failure pass, which makes
/// `ON_EXIT` different from `ON_SUCCESS | ON_FAILURE`: the latter fires once
/// in the outcome pass, whatever the outcome, and never again afterwards.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Trigger(u8);

impl Trigger {
    pub const ON_EXIT: Trigger = Trigger(1);
    pub const ON_SUCCESS: Trigger = Trigger(2);
    pub const ON_FAILURE: Trigger = Trigger(4);

    pub fn matches(self, status: Trigger) -> bool {
        self.0 & status.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Trigger {
    type Output = Trigger;

    fn bitor(self, rhs: Trigger) -> Trigger {
        Trigger(self.0 | rhs.0)
    }
}

/// What happens when a behaviour triggers. The argument shape is fixed per
/// action by construction.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Delete the per-attempt directory tree created for a `!cwd_matters`
    /// job, along with empty parents up to (but excluding) the job's cwd.
    CleanupAll,
    /// As `CleanupAll`, except files designated as outputs are kept.
    /// Output designation does not exist yet, so this currently deletes
    /// everything too.
    Cleanup,
    /// Run a command via the shell in the job's actual cwd.
    Run(String),
    /// Copy the given files from the job's actual cwd to a configured
    /// directory on the manager host. Accepted and serialized; the transfer
    /// itself is not performed yet.
    CopyToManager(Vec<String>),
}

/// Seam through which behaviours touch the world, so tests can observe
/// invocations without running shells or deleting directories.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    /// Run `command` through a shell in `cwd`, returning its exit code.
    async fn run_shell(&self, command: &str, cwd: &Path) -> anyhow::Result<i32>;

    /// Recursively delete a directory tree.
    async fn remove_tree(&self, path: &Path) -> std::io::Result<()>;

    /// Delete a single directory; fails when non-empty.
    async fn remove_empty_dir(&self, path: &Path) -> std::io::Result<()>;

    /// Transfer files to the manager host.
    async fn copy_to_manager(&self, files: &[String], cwd: &Path) -> anyhow::Result<()>;
}

/// The real runner: shells out and touches the filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShellRunner;

#[async_trait]
impl ActionRunner for ShellRunner {
    async fn run_shell(&self, command: &str, cwd: &Path) -> anyhow::Result<i32> {
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn remove_tree(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }

    async fn remove_empty_dir(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::remove_dir(path).await
    }

    async fn copy_to_manager(&self, files: &[String], cwd: &Path) -> anyhow::Result<()> {
        tracing::debug!(count = files.len(), cwd = %cwd.display(), "copy_to_manager requested; transfer not performed");
        Ok(())
    }
}

/// Something that should happen in response to a job's command exiting a
/// certain way.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Behaviour {
    pub when: Trigger,
    pub action: Action,
}

impl Behaviour {
    pub fn new(when: Trigger, action: Action) -> Self {
        Self { when, action }
    }

    /// Carry out the action if `status` matches this behaviour's trigger.
    pub async fn trigger(
        &self,
        status: Trigger,
        job: &Job,
        runner: &dyn ActionRunner,
    ) -> anyhow::Result<()> {
        if !self.when.matches(status) {
            return Ok(());
        }

        match &self.action {
            Action::CleanupAll => cleanup(job, false, runner).await,
            Action::Cleanup => cleanup(job, true, runner).await,
            Action::Run(command) => run(job, command, runner).await,
            Action::CopyToManager(files) => {
                runner
                    .copy_to_manager(files, Path::new(job.working_dir()))
                    .await
            }
        }
    }
}

impl std::fmt::Display for Behaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut mapping = JsonMapping::default();
        mapping.push(self);
        f.write_str(&serde_json::to_string(&mapping).map_err(|_| std::fmt::Error)?)
    }
}

/// Wipe the per-attempt directory as aggressively as possible, then remove
/// empty parents up to but excluding the job's cwd. `keep_outputs` is the
/// stub for output preservation; no mechanism designates outputs yet, so
/// everything is deleted either way.
async fn cleanup(job: &Job, keep_outputs: bool, runner: &dyn ActionRunner) -> anyhow::Result<()> {
    let _ = keep_outputs;

    let Some(actual_cwd) = job.actual_cwd.as_deref() else {
        // a cwd_matters job: the user's directory is not ours to delete
        return Ok(());
    };

    // the parent holds the attempt's tmp tree; delete the whole thing
    let attempt_dir = match Path::new(actual_cwd).parent() {
        Some(parent) => PathBuf::from(parent),
        None => return Ok(()),
    };
    runner.remove_tree(&attempt_dir).await?;

    // parents shared with other jobs may be non-empty, which ends the walk
    let cwd = Path::new(&job.cwd);
    let mut current = attempt_dir;
    while let Some(parent) = current.parent() {
        if parent == cwd {
            break;
        }
        if runner.remove_empty_dir(parent).await.is_err() {
            break;
        }
        current = PathBuf::from(parent);
    }
    Ok(())
}

async fn run(job: &Job, command: &str, runner: &dyn ActionRunner) -> anyhow::Result<()> {
    let mut command = command.to_string();
    if command.contains(" | ") {
        // surface early-stage failures in pipelines
        command = format!("set -o pipefail; {command}");
    }
    let code = runner
        .run_shell(&command, Path::new(job.working_dir()))
        .await?;
    if code != 0 {
        anyhow::bail!("behaviour command [{command}] exited {code}");
    }
    Ok(())
}

/// An ordered set of behaviours attached to a job.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Behaviours(pub Vec<Behaviour>);

impl Behaviours {
    pub fn new(behaviours: Vec<Behaviour>) -> Self {
        Self(behaviours)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Trigger each behaviour: first all those matching the outcome
    /// (`ON_SUCCESS` or `ON_FAILURE`), in declaration order, then all those
    /// matching `ON_EXIT`. Errors are collected, never short-circuiting, and
    /// returned as one composite.
    pub async fn trigger(
        &self,
        success: bool,
        job: &Job,
        runner: &dyn ActionRunner,
    ) -> Result<()> {
        if self.0.is_empty() {
            return Ok(());
        }

        let outcome = if success {
            Trigger::ON_SUCCESS
        } else {
            Trigger::ON_FAILURE
        };

        let mut errors = Vec::new();
        for status in [outcome, Trigger::ON_EXIT] {
            for behaviour in &self.0 {
                if let Err(err) = behaviour.trigger(status, job, runner).await {
                    errors.push(err.to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Behaviour(errors))
        }
    }

    /// Canonical JSON form, keyed by trigger.
    pub fn to_json(&self) -> String {
        let mut mapping = JsonMapping::default();
        for behaviour in &self.0 {
            mapping.push(behaviour);
        }
        serde_json::to_string(&mapping).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the canonical JSON form.
    pub fn from_json(s: &str) -> Result<Self> {
        let mapping: JsonMapping =
            serde_json::from_str(s).map_err(|e| Error::Protocol(format!("bad behaviours: {e}")))?;
        Ok(mapping.into_behaviours())
    }
}

impl std::fmt::Display for Behaviours {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_json())
    }
}

/// One entry in the JSON form; exactly one field is set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ActionViaJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    copy_to_manager: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cleanup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cleanup_all: Option<bool>,
}

impl ActionViaJson {
    fn from_action(action: &Action) -> Self {
        let mut entry = Self::default();
        match action {
            Action::Run(cmd) => entry.run = Some(cmd.clone()),
            Action::CopyToManager(files) => entry.copy_to_manager = Some(files.clone()),
            Action::Cleanup => entry.cleanup = Some(true),
            Action::CleanupAll => entry.cleanup_all = Some(true),
        }
        entry
    }

    fn into_action(self) -> Option<Action> {
        if let Some(cmd) = self.run {
            Some(Action::Run(cmd))
        } else if let Some(files) = self.copy_to_manager {
            Some(Action::CopyToManager(files))
        } else if self.cleanup == Some(true) {
            Some(Action::Cleanup)
        } else if self.cleanup_all == Some(true) {
            Some(Action::CleanupAll)
        } else {
            None
        }
    }
}

/// The JSON object form, keyed by trigger combination.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct JsonMapping {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    on_failure: Vec<ActionViaJson>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    on_success: Vec<ActionViaJson>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "on_failure|success")]
    on_failure_success: Vec<ActionViaJson>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    on_exit: Vec<ActionViaJson>,
}

impl JsonMapping {
    fn push(&mut self, behaviour: &Behaviour) {
        let entry = ActionViaJson::from_action(&behaviour.action);
        let both = Trigger::ON_FAILURE | Trigger::ON_SUCCESS;
        if behaviour.when == both {
            self.on_failure_success.push(entry);
        } else if behaviour.when == Trigger::ON_FAILURE {
            self.on_failure.push(entry);
        } else if behaviour.when == Trigger::ON_SUCCESS {
            self.on_success.push(entry);
        } else if behaviour.when == Trigger::ON_EXIT {
            self.on_exit.push(entry);
        }
    }

    fn into_behaviours(self) -> Behaviours {
        let mut out = Vec::new();
        let groups = [
            (Trigger::ON_FAILURE, self.on_failure),
            (Trigger::ON_SUCCESS, self.on_success),
            (Trigger::ON_FAILURE | Trigger::ON_SUCCESS, self.on_failure_success),
            (Trigger::ON_EXIT, self.on_exit),
        ];
        for (when, entries) in groups {
            for entry in entries {
                if let Some(action) = entry.into_action() {
                    out.push(Behaviour::new(when, action));
                }
            }
        }
        Behaviours(out)
    }
}
