//! Sluice - workflow management and command running.
//!
//! A manager accepts command-line jobs over TCP, persists and schedules
//! them, leases them to runners, watches their outcomes, retries or buries
//! failures, and reports live status to browsers over WebSocket.
//!
//! # Core Concepts
//!
//! - **Job**: A single shell command with resource expectations, retry and
//!   dependency control, and post-exit [`Behaviours`]. Jobs are deduplicated
//!   by a stable key derived from the command (and working directory, when
//!   it matters).
//!
//! - **Queue**: The in-memory [`Queue`] holds every job in exactly one
//!   lifecycle sub-queue (`delay`, `ready`, `run`, `bury`, `dependent`) with
//!   priority/FIFO ordering, reservation leases and a dependency graph.
//!
//! - **Behaviours**: Declarative side effects that fire after a job's
//!   command exits: cleanup of per-attempt directories, follow-up commands,
//!   and file transfer back to the manager.
//!
//! - **Persistence**: The [`JobStore`] façade keeps a live-job journal and
//!   an archive of completed jobs in an embedded key/value store, so a
//!   restarted manager resumes where it left off.
//!
//! - **Scheduler bridge**: Ready work is grouped by resource class and the
//!   external [`RunnerScheduler`] collaborator is asked to keep enough
//!   runners alive for each group.
//!
//! - **Status**: Every state transition fans out through the
//!   [`StatusBroadcaster`] to WebSocket observers, which can also drive
//!   bulk retry and remove.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sluice::{Manager, ManagerConfig, RocksStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = ManagerConfig::default();
//!     let store = Arc::new(RocksStore::open(&cfg.data_dir)?);
//!     let manager = Manager::new(cfg, store, my_scheduler());
//!     manager.serve().await
//! }
//! ```
//!
//! Runners and tooling connect with [`Client`], reserve jobs for their
//! scheduler group, touch their leases while working, and report outcomes
//! with `complete`, `release` or `bury`.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support

/// Post-exit behaviours: triggers, actions and the execution seam.
pub mod behaviour;

/// The scheduler bridge and the external runner-scheduler trait.
pub mod bridge;

/// Client side of the TCP protocol.
pub mod client;

/// Deployment selection and manager/queue configuration.
pub mod config;

/// Typed errors surfaced to clients.
pub mod error;

/// Status event fan-out.
pub mod events;

/// The job model: specs, keys, states, resources and accounting.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus metrics instrumentation.
pub mod metrics;

/// Wire protocol types and framing.
pub mod protocol;

/// The in-memory multi-state queue engine.
pub mod queue;

/// Reporting-group reverse index.
pub mod repgroup;

/// The manager: assembly, accept loop, drain and shutdown.
pub mod server;

/// Graceful-shutdown signalling.
pub mod shutdown;

/// The persistence façade and its embedded store.
pub mod store;

/// The status web interface and WebSocket handler.
pub mod web;

pub use behaviour::{Action, ActionRunner, Behaviour, Behaviours, ShellRunner, Trigger};
pub use bridge::{RunnerScheduler, SchedulerBridge};
pub use client::Client;
pub use config::{Deployment, ManagerConfig, QueueConfig};
pub use error::{Error, Result};
pub use events::{StatusBroadcaster, StatusEvent};
pub use job::{job_key, Accounting, Dependency, Job, JobSpec, JobState, OverridePolicy, Requirements};
pub use protocol::{AddedJob, Request, Response, ServerStats};
pub use queue::{AddOutcome, AddRequest, ItemStats, Queue, QueueEvent, QueueStats};
pub use repgroup::RepGroupIndex;
pub use server::{Manager, QueueHandle, CMDS_QUEUE};
pub use shutdown::ShutdownToken;
pub use store::{JobOutput, JobStore, RocksStore, StoreError, StoreResult};
