//! The manager: named queues, persistence write-through, behaviour
//! execution, the TCP accept loop and graceful drain/shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::behaviour::{ActionRunner, ShellRunner};
use crate::bridge::{RunnerScheduler, SchedulerBridge};
use crate::config::{ManagerConfig, QueueConfig};
use crate::error::{Error, Result};
use crate::events::{StatusBroadcaster, StatusEvent};
use crate::job::{Accounting, Job, JobSpec, JobState};
use crate::protocol::{self, AddedJob, Request, Response, ServerStats};
use crate::queue::{AddRequest, ItemStats, Queue, QueueEvent};
use crate::repgroup::RepGroupIndex;
use crate::shutdown::ShutdownToken;
use crate::store::{JobOutput, JobStore, StoreResult};

/// The queue clients submit commands to; the status interface reports on it.
pub const CMDS_QUEUE: &str = "cmds";

/// A named queue with its reporting-group index.
#[derive(Clone)]
pub struct QueueHandle {
    pub queue: Queue<Job>,
    pub index: Arc<RepGroupIndex>,
}

/// Central manager owning the queues and their surrounding services.
pub struct Manager {
    cfg: ManagerConfig,
    store: Arc<dyn JobStore>,
    bridge: Arc<SchedulerBridge>,
    broadcaster: Arc<StatusBroadcaster>,
    runner: Arc<dyn ActionRunner>,
    queues: RwLock<HashMap<String, QueueHandle>>,
    shutdown: ShutdownToken,
    draining: AtomicBool,
}

impl Manager {
    pub fn new(
        cfg: ManagerConfig,
        store: Arc<dyn JobStore>,
        scheduler: Arc<dyn RunnerScheduler>,
    ) -> Arc<Self> {
        let broadcaster = Arc::new(StatusBroadcaster::new(cfg.event_capacity));
        Arc::new(Self {
            bridge: Arc::new(SchedulerBridge::new(scheduler)),
            broadcaster,
            runner: Arc::new(ShellRunner),
            store,
            queues: RwLock::new(HashMap::new()),
            shutdown: ShutdownToken::new(),
            draining: AtomicBool::new(false),
            cfg,
        })
    }

    /// Swap in a different behaviour executor (tests use a recording one).
    pub fn with_action_runner(
        cfg: ManagerConfig,
        store: Arc<dyn JobStore>,
        scheduler: Arc<dyn RunnerScheduler>,
        runner: Arc<dyn ActionRunner>,
    ) -> Arc<Self> {
        let broadcaster = Arc::new(StatusBroadcaster::new(cfg.event_capacity));
        Arc::new(Self {
            bridge: Arc::new(SchedulerBridge::new(scheduler)),
            broadcaster,
            runner,
            store,
            queues: RwLock::new(HashMap::new()),
            shutdown: ShutdownToken::new(),
            draining: AtomicBool::new(false),
            cfg,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Subscribe to enriched status events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.broadcaster.subscribe()
    }

    /// Fetch or create a named queue, spawning its housekeeper and event
    /// pump on first use.
    pub fn handle(&self, name: &str) -> QueueHandle {
        if let Some(handle) = self.queues.read().get(name) {
            return handle.clone();
        }
        let mut queues = self.queues.write();
        if let Some(handle) = queues.get(name) {
            return handle.clone();
        }
        let queue = Queue::new(
            name,
            QueueConfig::default()
                .with_release_backoff(self.cfg.release_backoff)
                .with_event_capacity(self.cfg.event_capacity),
        );
        let index = Arc::new(RepGroupIndex::new());
        let handle = QueueHandle {
            queue: queue.clone(),
            index: index.clone(),
        };
        queues.insert(name.to_string(), handle.clone());
        queue.spawn_housekeeper(self.shutdown.clone());
        spawn_event_pump(
            queue,
            index,
            self.store.clone(),
            self.broadcaster.clone(),
            self.bridge.clone(),
            self.shutdown.clone(),
        );
        handle
    }

    /// Recover live jobs from the store: each re-enters `dependent` or
    /// `ready` according to its saved dependencies.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let handle = self.handle(CMDS_QUEUE);
        let jobs = self
            .store
            .load_live()
            .map_err(|e| anyhow::anyhow!("recover live jobs: {e}"))?;
        let count = jobs.len();
        for job in jobs {
            self.bridge
                .note_requirements(&job.scheduler_group, &job.requirements);
            let key = job.key.clone();
            let rep_group = job.rep_group.clone();
            let request = AddRequest {
                key: key.clone(),
                priority: job.priority,
                reserve_group: job.scheduler_group.clone(),
                until_buried: job.until_buried.max(1),
                dep_groups: job.dep_groups.clone(),
                dependencies: job.dependencies.clone(),
                supersede: false,
                data: job,
            };
            match handle.queue.add(request) {
                Ok(_) => handle.index.set(&key, &rep_group),
                Err(err) => tracing::warn!(key = %key, error = %err, "failed to requeue live job"),
            }
        }
        if count > 0 {
            tracing::info!(count, "recovered live jobs from store");
        }
        Ok(())
    }

    /// Bind the client protocol and status interface and run until shutdown.
    pub async fn serve(self: Arc<Self>) -> anyhow::Result<()> {
        self.start().await?;

        let listener = TcpListener::bind(self.cfg.client_addr)
            .await
            .with_context(|| format!("bind client address {}", self.cfg.client_addr))?;
        tracing::info!(
            addr = %self.cfg.client_addr,
            deployment = %self.cfg.deployment,
            "client protocol listening"
        );

        crate::web::spawn(self.clone(), self.cfg.web_addr, self.shutdown.clone());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if self.is_draining() {
                            tracing::debug!(peer = %peer, "draining; refusing new connection");
                            continue;
                        }
                        let manager = self.clone();
                        tokio::spawn(handle_connection(manager, stream, peer));
                    }
                    Err(err) => tracing::warn!(error = %err, "accept failed"),
                }
            }
        }
        tracing::info!("manager shut down");
        Ok(())
    }

    /// Stop accepting new connections; shut down once nothing is running.
    pub fn drain(self: &Arc<Self>) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("draining: no new connections; waiting for running jobs");
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                if manager.shutdown.is_cancelled() {
                    break;
                }
                let running: usize = manager
                    .queues
                    .read()
                    .values()
                    .map(|h| h.queue.stats().running)
                    .sum();
                if running == 0 {
                    manager.shutdown.cancel();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, handle: &QueueHandle, request: Request) -> Response {
        match request {
            Request::BindQueue { .. } => {
                Response::Err(Error::Protocol("queue already bound".to_string()))
            }
            Request::Add { jobs, supersede } => match self.add_jobs(handle, jobs, supersede).await
            {
                Ok(added) => Response::Added(added),
                Err(err) => Response::Err(err),
            },
            Request::Reserve { reserve_group, ttl } => {
                match self.reserve(handle, &reserve_group, ttl) {
                    Ok(job) => Response::Reserved(job),
                    Err(err) => Response::Err(err),
                }
            }
            Request::Touch { key, ttl } => self.ok_or(self.touch(handle, &key, ttl)),
            Request::Release {
                key,
                reason,
                accounting,
            } => self.ok_or(self.release(handle, &key, &reason, accounting)),
            Request::Bury {
                key,
                fail_reason,
                accounting,
            } => self.ok_or(self.bury(handle, &key, &fail_reason, accounting)),
            Request::Kick { key } => self.ok_or(self.kick(handle, &key)),
            Request::Remove { key } => self.ok_or(self.remove_job(handle, &key).await),
            Request::Complete {
                key,
                accounting,
                stdout,
                stderr,
            } => self.ok_or(
                self.complete_job(handle, &key, accounting, &stdout, &stderr)
                    .await,
            ),
            Request::GetByKeys { keys } => Response::Jobs(self.get_by_keys(handle, &keys)),
            Request::GetByRepGroup {
                rep_group,
                limit,
                state,
            } => Response::Jobs(self.get_by_rep_group(handle, &rep_group, limit, state)),
            Request::GetIncomplete => Response::Jobs(self.get_incomplete(handle)),
            Request::GetComplete { rep_group } => {
                Response::Jobs(self.get_complete(&rep_group))
            }
            Request::Stats => Response::Stats(ServerStats {
                queue: handle.queue.name().to_string(),
                stats: handle.queue.stats(),
                draining: self.is_draining(),
            }),
            Request::Drain => {
                self.drain();
                Response::Ok
            }
            Request::Shutdown => Response::Ok,
        }
    }

    fn ok_or(&self, result: Result<()>) -> Response {
        match result {
            Ok(()) => Response::Ok,
            Err(err) => Response::Err(err),
        }
    }

    /// Submit jobs. Duplicate keys are collapsed onto the existing job,
    /// which only picks up the new reporting group.
    pub async fn add_jobs(
        self: &Arc<Self>,
        handle: &QueueHandle,
        specs: Vec<JobSpec>,
        supersede: bool,
    ) -> Result<Vec<AddedJob>> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let job = Job::from_spec(spec);
            let key = job.key.clone();
            let rep_group = job.rep_group.clone();
            self.bridge
                .note_requirements(&job.scheduler_group, &job.requirements);

            let outcome = handle.queue.add(AddRequest {
                key: key.clone(),
                priority: job.priority,
                reserve_group: job.scheduler_group.clone(),
                until_buried: job.retries + 1,
                dep_groups: job.dep_groups.clone(),
                dependencies: job.dependencies.clone(),
                supersede,
                data: job.clone(),
            })?;

            if outcome.added {
                handle.index.set(&key, &rep_group);
                let mut to_save = job;
                to_save.state = outcome.state;
                if let Err(err) = self
                    .persist("save_live", || self.store.save_live(&to_save))
                    .await
                {
                    handle.queue.rollback_add(&key);
                    handle.index.remove(&key);
                    return Err(err);
                }
                #[cfg(feature = "metrics")]
                crate::metrics::record_job_added(handle.queue.name());
                results.push(AddedJob {
                    key,
                    already_existed: false,
                });
            } else {
                let _ = handle
                    .queue
                    .update_data(&key, |j| j.rep_group = rep_group.clone());
                handle.index.set(&key, &rep_group);
                results.push(AddedJob {
                    key,
                    already_existed: true,
                });
            }
        }
        Ok(results)
    }

    /// Reserve the best matching ready job, leasing it for the clamped TTL.
    pub fn reserve(
        &self,
        handle: &QueueHandle,
        reserve_group: &str,
        ttl: Duration,
    ) -> Result<Option<Job>> {
        let ttl = self.clamp_ttl(ttl)?;
        let Some((key, _)) = handle.queue.reserve(reserve_group, ttl)? else {
            return Ok(None);
        };
        let mut reserved = None;
        handle.queue.update_data(&key, |job| {
            job.attempts += 1;
            job.state = JobState::Reserved;
            if !job.cwd_matters {
                let base = job.cwd.trim_end_matches('/');
                job.actual_cwd = Some(format!(
                    "{base}/.sluice_work/{key}/{attempt}/cwd",
                    attempt = job.attempts
                ));
            }
            reserved = Some(job.clone());
        })?;
        let mut job = reserved.ok_or_else(|| Error::NotFound(key.clone()))?;
        if let Ok((_, stats)) = handle.queue.get(&key) {
            job.until_buried = stats.until_buried;
        }
        Ok(Some(job))
    }

    pub fn touch(&self, handle: &QueueHandle, key: &str, ttl: Duration) -> Result<()> {
        let ttl = self.clamp_ttl(ttl)?;
        handle.queue.touch(key, ttl).map(|_| ())
    }

    pub fn release(
        &self,
        handle: &QueueHandle,
        key: &str,
        reason: &str,
        accounting: Option<Accounting>,
    ) -> Result<()> {
        handle.queue.update_data(key, |job| {
            job.fail_reason = reason.to_string();
            if let Some(accounting) = &accounting {
                job.record_exit(accounting);
            }
        })?;
        handle.queue.release(key)?;
        Ok(())
    }

    pub fn bury(
        &self,
        handle: &QueueHandle,
        key: &str,
        fail_reason: &str,
        accounting: Option<Accounting>,
    ) -> Result<()> {
        handle.queue.update_data(key, |job| {
            job.fail_reason = fail_reason.to_string();
            if let Some(accounting) = &accounting {
                job.record_exit(accounting);
            }
        })?;
        handle.queue.bury(key)
    }

    pub fn kick(&self, handle: &QueueHandle, key: &str) -> Result<()> {
        handle.queue.kick(key)?;
        handle.queue.update_data(key, |job| {
            job.until_buried = job.retries + 1;
        })
    }

    /// Remove a job outright. Refused while dependents await it; the live
    /// record is deleted first so the in-memory state never outlives disk.
    pub async fn remove_job(self: &Arc<Self>, handle: &QueueHandle, key: &str) -> Result<()> {
        let (job, _) = handle.queue.get(key)?;
        if handle.queue.has_dependents(key)? {
            return Err(Error::HasDependents(key.to_string()));
        }
        self.persist("delete_live", || self.store.delete_live(key))
            .await?;
        let stats = match handle.queue.remove(key) {
            Ok(stats) => stats,
            Err(err) => {
                let _ = self.store.save_live(&job);
                return Err(err);
            }
        };
        handle.index.remove(key);
        if stats.state == JobState::Delayed {
            self.bridge.decrement_group_count(&job.scheduler_group).await;
        }
        Ok(())
    }

    /// Record a finished attempt: trigger behaviours, archive, then make the
    /// completion visible. A behaviour error is returned but the completion
    /// stands; a persistence error aborts the transition entirely.
    pub async fn complete_job(
        self: &Arc<Self>,
        handle: &QueueHandle,
        key: &str,
        accounting: Accounting,
        stdout: &str,
        stderr: &str,
    ) -> Result<()> {
        let (mut job, stats) = handle.queue.get(key)?;
        match stats.state {
            JobState::Reserved | JobState::Running => {}
            other => return Err(Error::wrong_state(key, other, "reserved or running")),
        }

        job.record_exit(&accounting);
        let success = accounting.exit_code == 0;
        if !success && job.fail_reason.is_empty() {
            job.fail_reason = format!("command exited {}", accounting.exit_code);
        }

        let behaviour_result = job
            .behaviours
            .trigger(success, &job, self.runner.as_ref())
            .await;

        job.state = JobState::Complete;
        job.until_buried = stats.until_buried;
        self.persist("archive", || self.store.archive(&job, stdout, stderr))
            .await?;
        handle.queue.complete(key)?;
        handle.index.remove(key);
        #[cfg(feature = "metrics")]
        crate::metrics::record_job_completed(handle.queue.name(), success);
        behaviour_result
    }

    pub fn get_by_keys(&self, handle: &QueueHandle, keys: &[String]) -> Vec<Job> {
        keys.iter()
            .filter_map(|key| match handle.queue.get(key) {
                Ok((job, stats)) => Some(synced(job, &stats)),
                Err(_) => self.store.complete_by_key(key).ok().flatten(),
            })
            .collect()
    }

    /// Jobs carrying a reporting group, queued and archived. With a nonzero
    /// `limit`, at most that many examples are kept per distinct
    /// `(state, exit code, fail reason)` grouping.
    pub fn get_by_rep_group(
        &self,
        handle: &QueueHandle,
        rep_group: &str,
        limit: usize,
        state: Option<JobState>,
    ) -> Vec<Job> {
        let mut jobs: Vec<Job> = handle
            .index
            .keys_for(rep_group)
            .iter()
            .filter_map(|key| {
                handle
                    .queue
                    .get(key)
                    .ok()
                    .map(|(job, stats)| synced(job, &stats))
            })
            .collect();

        if state.is_none() || state == Some(JobState::Complete) {
            jobs.extend(self.get_complete(rep_group));
        }
        if let Some(state) = state {
            jobs.retain(|job| job.state == state);
        }

        if limit > 0 {
            let mut kept: HashMap<(JobState, i32, String), usize> = HashMap::new();
            jobs.retain(|job| {
                let taken = kept
                    .entry((job.state, job.exit_code, job.fail_reason.clone()))
                    .or_insert(0);
                *taken += 1;
                *taken <= limit
            });
        }
        jobs
    }

    /// One example job per distinct `(state, exit code, fail reason)`
    /// grouping, with the count of similar jobs it stands for.
    pub fn examples_by_rep_group(
        &self,
        handle: &QueueHandle,
        rep_group: &str,
        state: Option<JobState>,
    ) -> Vec<(Job, usize)> {
        let jobs = self.get_by_rep_group(handle, rep_group, 0, state);
        let mut examples: Vec<(Job, usize)> = Vec::new();
        let mut seen: HashMap<(JobState, i32, String), usize> = HashMap::new();
        for job in jobs {
            let group = (job.state, job.exit_code, job.fail_reason.clone());
            match seen.get(&group) {
                Some(&index) => examples[index].1 += 1,
                None => {
                    seen.insert(group, examples.len());
                    examples.push((job, 0));
                }
            }
        }
        examples
    }

    pub fn get_incomplete(&self, handle: &QueueHandle) -> Vec<Job> {
        handle
            .queue
            .snapshot()
            .into_iter()
            .map(|(job, stats)| synced(job, &stats))
            .collect()
    }

    pub fn get_complete(&self, rep_group: &str) -> Vec<Job> {
        match self.store.complete_by_rep_group(rep_group) {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::warn!(rep_group = %rep_group, error = %err, "complete lookup failed");
                Vec::new()
            }
        }
    }

    /// Full detail for one job, live or archived, with its output blobs.
    pub fn job_detail(&self, handle: &QueueHandle, key: &str) -> Option<(Job, JobOutput)> {
        if let Ok((job, stats)) = handle.queue.get(key) {
            return Some((synced(job, &stats), JobOutput::default()));
        }
        let job = self.store.complete_by_key(key).ok().flatten()?;
        let output = self.store.output(key).ok().flatten().unwrap_or_default();
        Some((job, output))
    }

    /// Kick every buried job matching the selectors, restoring its full
    /// retry budget; stops after the first match unless `all`.
    pub fn retry_matching(
        &self,
        handle: &QueueHandle,
        rep_group: &str,
        exit_code: i32,
        fail_reason: &str,
        all: bool,
    ) -> usize {
        let mut kicked = 0;
        for key in handle.index.keys_for(rep_group) {
            let Ok((job, stats)) = handle.queue.get(&key) else {
                continue;
            };
            if stats.state != JobState::Buried
                || job.exit_code != exit_code
                || job.fail_reason != fail_reason
            {
                continue;
            }
            if handle.queue.kick(&key).is_ok() {
                let _ = handle.queue.update_data(&key, |j| {
                    j.until_buried = j.retries + 1;
                });
                kicked += 1;
                if !all {
                    break;
                }
            }
        }
        kicked
    }

    /// Remove every matching buried, delayed or dependent job, skipping any
    /// with outstanding dependents; stops after the first unless `all`.
    pub async fn remove_matching(
        self: &Arc<Self>,
        handle: &QueueHandle,
        rep_group: &str,
        exit_code: i32,
        fail_reason: &str,
        all: bool,
    ) -> usize {
        let mut removed = 0;
        for key in handle.index.keys_for(rep_group) {
            let Ok((job, stats)) = handle.queue.get(&key) else {
                continue;
            };
            if !matches!(
                stats.state,
                JobState::Buried | JobState::Delayed | JobState::Dependent
            ) || job.exit_code != exit_code
                || job.fail_reason != fail_reason
            {
                continue;
            }
            match self.remove_job(handle, &key).await {
                Ok(()) => {
                    removed += 1;
                    if !all {
                        break;
                    }
                }
                Err(Error::HasDependents(_)) => continue,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "bulk remove failed");
                    break;
                }
            }
        }
        removed
    }

    fn clamp_ttl(&self, ttl: Duration) -> Result<Duration> {
        if ttl.is_zero() {
            return Err(Error::TtlRefused);
        }
        Ok(ttl.min(self.cfg.max_reserve_ttl))
    }

    /// Run a store write with a bounded retry budget before declaring the
    /// transition failed.
    async fn persist(&self, op: &str, mut write: impl FnMut() -> StoreResult<()>) -> Result<()> {
        let mut detail = String::new();
        for attempt in 0..=self.cfg.persistence_retries {
            match write() {
                Ok(()) => return Ok(()),
                Err(err) => {
                    detail = err.to_string();
                    if attempt < self.cfg.persistence_retries {
                        tokio::time::sleep(Duration::from_millis(50u64 << attempt.min(4))).await;
                    }
                }
            }
        }
        tracing::error!(op = %op, detail = %detail, "persistence failed after retries");
        Err(Error::PersistenceFailed {
            op: op.to_string(),
            detail,
        })
    }
}

/// Refresh the payload's reported fields from the queue's authoritative
/// bookkeeping.
fn synced(mut job: Job, stats: &ItemStats) -> Job {
    job.state = stats.state;
    job.until_buried = stats.until_buried;
    job
}

/// Follow a queue's transitions: enrich them for status observers, write
/// live records through, and keep the scheduler bridge in sync.
fn spawn_event_pump(
    queue: Queue<Job>,
    index: Arc<RepGroupIndex>,
    store: Arc<dyn JobStore>,
    broadcaster: Arc<StatusBroadcaster>,
    bridge: Arc<SchedulerBridge>,
    shutdown: ShutdownToken,
) {
    let mut rx = queue.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(QueueEvent { key, from, to }) => {
                        let rep_group = index.group_of(&key).unwrap_or_default();
                        broadcaster.publish(StatusEvent::new(&key, from, to, rep_group));
                        if !to.is_terminal() {
                            if let Ok((job, stats)) = queue.get(&key) {
                                let job = synced(job, &stats);
                                if let Err(err) = store.save_live(&job) {
                                    tracing::warn!(key = %key, error = %err, "live write-through failed");
                                }
                            }
                        }
                        bridge.sync(queue.group_counts()).await;
                        #[cfg(feature = "metrics")]
                        crate::metrics::set_queue_depth(queue.name(), &queue.stats());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event pump lagged");
                        bridge.sync(queue.group_counts()).await;
                    }
                }
            }
        }
    });
}

/// One client connection: bind to a queue, then loop on commands under a
/// rolling read deadline.
async fn handle_connection(manager: Arc<Manager>, stream: TcpStream, peer: SocketAddr) {
    let read_timeout = manager.cfg.client_read_timeout;
    let mut framed = protocol::framed(stream);

    let handle = match tokio::time::timeout(read_timeout, framed.next()).await {
        Ok(Some(Ok(frame))) => match protocol::decode::<Request>(&frame) {
            Ok(Request::BindQueue { name }) => {
                let handle = manager.handle(&name);
                if send(&mut framed, &Response::Ok).await.is_err() {
                    return;
                }
                handle
            }
            Ok(_) | Err(_) => {
                let _ = send(
                    &mut framed,
                    &Response::Err(Error::Protocol(
                        "first message must bind a queue".to_string(),
                    )),
                )
                .await;
                return;
            }
        },
        _ => return,
    };

    loop {
        let read = tokio::select! {
            _ = manager.shutdown.cancelled() => {
                tracing::debug!(peer = %peer, "closing client for shutdown");
                break;
            }
            read = tokio::time::timeout(read_timeout, framed.next()) => read,
        };
        match read {
            Err(_) => {
                tracing::debug!(peer = %peer, "client idle beyond read deadline; closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                tracing::debug!(peer = %peer, error = %err, "client read failed");
                break;
            }
            Ok(Some(Ok(frame))) => {
                let request = match protocol::decode::<Request>(&frame) {
                    Ok(request) => request,
                    Err(err) => {
                        // undecodable frame: answer with the error, then close
                        let _ = send(&mut framed, &Response::Err(err)).await;
                        break;
                    }
                };
                let shutdown_after = matches!(request, Request::Shutdown);
                let response = manager.dispatch(&handle, request).await;
                if send(&mut framed, &response).await.is_err() {
                    break;
                }
                if shutdown_after {
                    manager.shutdown.cancel();
                    break;
                }
            }
        }
    }
}

async fn send(
    framed: &mut tokio_util::codec::Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    response: &Response,
) -> Result<()> {
    let bytes = protocol::encode(response)?;
    framed
        .send(bytes)
        .await
        .map_err(|e| Error::Protocol(format!("send: {e}")))
}
