use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::behaviour::Behaviours;

/// Lifecycle states of a job, mirrored by the queue's sub-queues.
///
/// `Reserved` and `Running` both live in the `run` sub-queue; the
/// distinction is only visible in reported state strings.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Delayed,
    Ready,
    Reserved,
    Running,
    Buried,
    Dependent,
    Complete,
    Removed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Ready => "ready",
            JobState::Reserved => "reserved",
            JobState::Running => "running",
            JobState::Buried => "buried",
            JobState::Dependent => "dependent",
            JobState::Complete => "complete",
            JobState::Removed => "removed",
        }
    }

    /// Whether this state satisfies dependencies on the job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Removed)
    }

    /// Sub-queue name used for grouped state counts on the status page.
    pub fn sub_queue(&self) -> &'static str {
        match self {
            JobState::Delayed => "delay",
            JobState::Reserved | JobState::Running => "run",
            JobState::Buried => "bury",
            other => other.as_str(),
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job's stated resource expectation interacts with measured history.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverridePolicy {
    /// Learned usage wins.
    #[default]
    None,
    /// The stated expectation is a starting suggestion.
    Suggest,
    /// The stated expectation always wins.
    Force,
}

impl OverridePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverridePolicy::None => "none",
            OverridePolicy::Suggest => "suggest",
            OverridePolicy::Force => "force",
        }
    }
}

/// Resource expectation for a job, and the input to scheduler grouping.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Requirements {
    /// Expected peak memory in megabytes.
    pub ram_mb: u32,
    /// Expected number of cores.
    pub cores: u32,
    /// Expected scratch disk in gigabytes.
    pub disk_gb: u32,
    /// Expected wall time.
    pub time: Duration,
    /// How the expectation interacts with measured history.
    #[serde(rename = "override")]
    pub override_policy: OverridePolicy,
    /// Optional hardware selector (for example a node flavour or tag).
    pub hardware: Option<String>,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            ram_mb: 1000,
            cores: 1,
            disk_gb: 0,
            time: Duration::from_secs(3600),
            override_policy: OverridePolicy::None,
            hardware: None,
        }
    }
}

impl Requirements {
    /// Stable identifier of this resource class.
    ///
    /// Jobs with equal scheduler groups can share runners; time is bucketed
    /// to the hour so near-identical expectations coalesce.
    pub fn scheduler_group(&self) -> String {
        let secs = self.time.as_secs();
        let time_bucket = secs.div_ceil(3600).max(1) * 3600;
        let hardware = self.hardware.as_deref().unwrap_or("");
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.ram_mb,
            self.cores,
            self.disk_gb,
            time_bucket,
            self.override_policy.as_str(),
            hardware
        )
    }
}

/// A single dependency declared by a job: either a direct job key or a
/// dep-group label satisfied when every member of the group is terminal.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dependency {
    Key(String),
    Group(String),
}

impl Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dependency::Key(k) => write!(f, "key:{k}"),
            Dependency::Group(g) => write!(f, "group:{g}"),
        }
    }
}

/// What a client submits to create a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    /// Shell command to run.
    pub cmd: String,
    /// Working directory base.
    pub cwd: String,
    /// When true the command runs directly in `cwd` and `cwd` is part of the
    /// job's identity; when false a fresh subdirectory is created per attempt.
    pub cwd_matters: bool,
    /// Opaque mount descriptor (serialized JSON) handed through to runners.
    pub mount_config: Option<String>,
    /// Captured environment overrides, `KEY=VALUE` form.
    pub env: Vec<String>,
    pub requirements: Requirements,
    /// 0 (lowest) to 255 (highest).
    pub priority: u8,
    /// Automatic retry cap; the job is buried after `retries + 1` failures.
    pub retries: u32,
    /// Dep-groups this job satisfies.
    pub dep_groups: Vec<String>,
    /// Groups or keys that must complete first.
    pub dependencies: Vec<Dependency>,
    /// User-facing reporting label.
    pub rep_group: String,
    pub behaviours: Behaviours,
}

impl JobSpec {
    pub fn new(cmd: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: cwd.into(),
            cwd_matters: false,
            mount_config: None,
            env: Vec::new(),
            requirements: Requirements::default(),
            priority: 0,
            retries: 3,
            dep_groups: Vec::new(),
            dependencies: Vec::new(),
            rep_group: "manually_added".to_string(),
            behaviours: Behaviours::default(),
        }
    }

    pub fn with_cwd_matters(mut self, matters: bool) -> Self {
        self.cwd_matters = matters;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_rep_group(mut self, rep_group: impl Into<String>) -> Self {
        self.rep_group = rep_group.into();
        self
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_dep_groups(mut self, groups: Vec<String>) -> Self {
        self.dep_groups = groups;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Dependency>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_behaviours(mut self, behaviours: Behaviours) -> Self {
        self.behaviours = behaviours;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// The key this spec will be deduplicated under.
    pub fn key(&self) -> String {
        job_key(&self.cmd, &self.cwd, self.cwd_matters)
    }
}

/// Stable fingerprint identifying a job for deduplication and reference.
///
/// Covers `(cwd, cmd)` when the working directory matters, else `cmd` alone,
/// so the same command submitted from two throwaway directories collapses to
/// one job.
pub fn job_key(cmd: &str, cwd: &str, cwd_matters: bool) -> String {
    let mut hasher = Sha256::new();
    if cwd_matters {
        hasher.update(cwd.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(cmd.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// A single command to be executed, with resource expectations, retry and
/// dependency control, and post-exit behaviours.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub key: String,
    pub cmd: String,
    pub cwd: String,
    pub cwd_matters: bool,
    /// Assigned at reservation time when `cwd_matters` is false: a fresh
    /// subdirectory under `cwd` for this attempt.
    pub actual_cwd: Option<String>,
    pub mount_config: Option<String>,
    pub env: Vec<String>,
    pub requirements: Requirements,
    pub priority: u8,
    pub retries: u32,
    /// Number of times the job has been reserved.
    pub attempts: u32,
    /// Remaining failures before the job is buried.
    pub until_buried: u32,
    pub dep_groups: Vec<String>,
    pub dependencies: Vec<Dependency>,
    pub rep_group: String,
    pub behaviours: Behaviours,
    /// Derived resource-class identifier used by the scheduler bridge.
    pub scheduler_group: String,
    pub state: JobState,

    // accounting, populated on completion
    pub peak_ram_mb: u32,
    pub cpu_time: Duration,
    pub walltime: Duration,
    pub exited: bool,
    pub exit_code: i32,
    pub fail_reason: String,
    pub host: String,
    pub pid: u32,
}

impl Job {
    pub fn from_spec(spec: JobSpec) -> Self {
        let key = spec.key();
        let scheduler_group = spec.requirements.scheduler_group();
        Self {
            key,
            cmd: spec.cmd,
            cwd: spec.cwd,
            cwd_matters: spec.cwd_matters,
            actual_cwd: None,
            mount_config: spec.mount_config,
            env: spec.env,
            requirements: spec.requirements,
            priority: spec.priority,
            retries: spec.retries,
            attempts: 0,
            until_buried: spec.retries + 1,
            dep_groups: spec.dep_groups,
            dependencies: spec.dependencies,
            rep_group: spec.rep_group,
            behaviours: spec.behaviours,
            scheduler_group,
            state: JobState::Ready,
            peak_ram_mb: 0,
            cpu_time: Duration::ZERO,
            walltime: Duration::ZERO,
            exited: false,
            exit_code: 0,
            fail_reason: String::new(),
            host: String::new(),
            pid: 0,
        }
    }

    /// The directory the command actually runs in.
    pub fn working_dir(&self) -> &str {
        self.actual_cwd.as_deref().unwrap_or(&self.cwd)
    }

    /// Record the outcome of an attempt.
    pub fn record_exit(&mut self, accounting: &Accounting) {
        self.exited = true;
        self.exit_code = accounting.exit_code;
        self.peak_ram_mb = accounting.peak_ram_mb;
        self.cpu_time = accounting.cpu_time;
        self.walltime = accounting.walltime;
        self.host = accounting.host.clone();
        self.pid = accounting.pid;
    }
}

/// Measured facts about a finished attempt, reported by the runner.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Accounting {
    pub exit_code: i32,
    pub peak_ram_mb: u32,
    pub cpu_time: Duration,
    pub walltime: Duration,
    pub host: String,
    pub pid: u32,
}
