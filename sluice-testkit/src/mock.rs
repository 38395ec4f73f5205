use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sluice::{ActionRunner, Requirements, RunnerScheduler};

/// What a behaviour asked the runner to do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunnerCall {
    Shell { command: String, cwd: String },
    RemoveTree(String),
    RemoveEmptyDir(String),
    CopyToManager(Vec<String>),
}

/// An [`ActionRunner`] that records invocations instead of touching the
/// world. Shell commands report a configurable exit code.
#[derive(Clone)]
pub struct RecordingRunner {
    calls: Arc<Mutex<Vec<RunnerCall>>>,
    shell_exit: Arc<Mutex<i32>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            shell_exit: Arc::new(Mutex::new(0)),
        }
    }

    pub fn set_shell_exit(&self, code: i32) {
        *self.shell_exit.lock() = code;
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionRunner for RecordingRunner {
    async fn run_shell(&self, command: &str, cwd: &Path) -> anyhow::Result<i32> {
        self.calls.lock().push(RunnerCall::Shell {
            command: command.to_string(),
            cwd: cwd.display().to_string(),
        });
        Ok(*self.shell_exit.lock())
    }

    async fn remove_tree(&self, path: &Path) -> std::io::Result<()> {
        self.calls
            .lock()
            .push(RunnerCall::RemoveTree(path.display().to_string()));
        Ok(())
    }

    async fn remove_empty_dir(&self, path: &Path) -> std::io::Result<()> {
        self.calls
            .lock()
            .push(RunnerCall::RemoveEmptyDir(path.display().to_string()));
        // parents are usually shared, and so non-empty
        Err(std::io::Error::new(std::io::ErrorKind::Other, "not empty"))
    }

    async fn copy_to_manager(&self, files: &[String], _cwd: &Path) -> anyhow::Result<()> {
        self.calls
            .lock()
            .push(RunnerCall::CopyToManager(files.to_vec()));
        Ok(())
    }
}

/// One `ensure_runners` call as seen by the mock scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerCall {
    pub group: String,
    pub count: usize,
    pub requirements: Requirements,
}

/// A [`RunnerScheduler`] that records what it was asked for.
#[derive(Clone, Default)]
pub struct MockScheduler {
    calls: Arc<Mutex<Vec<SchedulerCall>>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().clone()
    }

    /// The most recent count requested for a group.
    pub fn last_count_for(&self, group: &str) -> Option<usize> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|call| call.group == group)
            .map(|call| call.count)
    }
}

#[async_trait]
impl RunnerScheduler for MockScheduler {
    async fn ensure_runners(
        &self,
        group: &str,
        count: usize,
        reqs: &Requirements,
    ) -> anyhow::Result<()> {
        self.calls.lock().push(SchedulerCall {
            group: group.to_string(),
            count,
            requirements: reqs.clone(),
        });
        Ok(())
    }
}
