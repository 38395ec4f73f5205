//! The in-memory multi-state queue: sub-queues per lifecycle state,
//! priority/FIFO ordering, time-driven transitions and a dependency graph.
//!
//! All operations are synchronous against the engine lock; timer-driven
//! transitions run in a housekeeper task and take the same lock, so they are
//! indistinguishable from external calls. Every transition is published on
//! the queue's broadcast channel in commit order.

mod item;

pub use item::{AddOutcome, AddRequest, ItemStats, QueueEvent, QueueStats};

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{broadcast, Notify};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::job::{Dependency, JobState};
use crate::shutdown::ShutdownToken;
use item::{Item, ReadyEntry, TimedEntry};

fn to_chrono(d: Duration) -> chrono::Duration {
    // a year is as good as forever for a reservation deadline
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(31_536_000))
}

/// A named queue of payloads keyed by string.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Queue<T> {
    name: Arc<String>,
    inner: Arc<RwLock<Inner<T>>>,
    events: broadcast::Sender<QueueEvent>,
    changed: Arc<Notify>,
}

struct Inner<T> {
    cfg: QueueConfig,
    items: HashMap<String, Item<T>>,
    /// Keys that reached `complete` or `removed`; consulted for dependency
    /// satisfaction after the live item is gone.
    terminal: HashMap<String, JobState>,
    /// One max-heap per reserve group.
    ready: HashMap<String, BinaryHeap<ReadyEntry>>,
    delay: BinaryHeap<Reverse<TimedEntry>>,
    run: BinaryHeap<Reverse<TimedEntry>>,
    bury: HashSet<String>,
    dependent: HashSet<String>,
    /// dep-group label -> keys that ever declared it.
    group_members: HashMap<String, HashSet<String>>,
    /// Edges from awaited key / group to the keys awaiting them. Edges are
    /// kept after resolution so newly entering items can be checked.
    dependents_by_key: HashMap<String, HashSet<String>>,
    dependents_by_group: HashMap<String, HashSet<String>>,
    complete_count: usize,
    removed_count: usize,
    seq: u64,
    events: broadcast::Sender<QueueEvent>,
}

impl<T: Clone + Send + Sync + 'static> Queue<T> {
    pub fn new(name: impl Into<String>, cfg: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(cfg.event_capacity.max(1));
        let inner = Inner {
            cfg,
            items: HashMap::new(),
            terminal: HashMap::new(),
            ready: HashMap::new(),
            delay: BinaryHeap::new(),
            run: BinaryHeap::new(),
            bury: HashSet::new(),
            dependent: HashSet::new(),
            group_members: HashMap::new(),
            dependents_by_key: HashMap::new(),
            dependents_by_group: HashMap::new(),
            complete_count: 0,
            removed_count: 0,
            seq: 0,
            events: events.clone(),
        };
        Self {
            name: Arc::new(name.into()),
            inner: Arc::new(RwLock::new(inner)),
            events,
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to state transitions, in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Insert a payload under a new key.
    ///
    /// A key already queued (other than buried) is left untouched and
    /// reported with `added: false`. A buried or terminal key is an error
    /// unless the caller opts in to supersede it.
    pub fn add(&self, req: AddRequest<T>) -> Result<AddOutcome> {
        let mut inner = self.inner.write();

        let existing_state = inner.items.get(&req.key).map(|item| item.state);
        if let Some(state) = existing_state {
            if state == JobState::Buried {
                if !req.supersede {
                    return Err(Error::DuplicateAdd(req.key));
                }
                inner.bury.remove(&req.key);
                inner.items.remove(&req.key);
            } else {
                return Ok(AddOutcome {
                    key: req.key.clone(),
                    added: false,
                    state,
                });
            }
        } else if inner.terminal.contains_key(&req.key) {
            if !req.supersede {
                return Err(Error::DuplicateAdd(req.key));
            }
            inner.terminal.remove(&req.key);
        }

        let satisfied = req
            .dependencies
            .iter()
            .all(|dep| inner.dep_satisfied(dep));
        let state = if satisfied {
            JobState::Ready
        } else {
            JobState::Dependent
        };

        let item = Item {
            data: req.data,
            priority: req.priority,
            reserve_group: req.reserve_group,
            state,
            entered_at: Utc::now(),
            until_buried: req.until_buried,
            initial_until_buried: req.until_buried,
            deadline: None,
            release_at: None,
            dep_groups: req.dep_groups.clone(),
            dependencies: req.dependencies.clone(),
            epoch: 0,
        };
        inner.items.insert(req.key.clone(), item);

        for group in &req.dep_groups {
            inner
                .group_members
                .entry(group.clone())
                .or_default()
                .insert(req.key.clone());
        }
        for dep in &req.dependencies {
            match dep {
                Dependency::Key(k) => inner
                    .dependents_by_key
                    .entry(k.clone())
                    .or_default()
                    .insert(req.key.clone()),
                Dependency::Group(g) => inner
                    .dependents_by_group
                    .entry(g.clone())
                    .or_default()
                    .insert(req.key.clone()),
            };
        }

        if state == JobState::Ready {
            inner.set_ready(&req.key);
        } else {
            inner.dependent.insert(req.key.clone());
        }
        inner.emit(&req.key, None, state);

        // dependencies cover future group members too: anything ready that
        // awaits one of this item's groups is blocked again
        let mut to_block = Vec::new();
        for group in &req.dep_groups {
            if let Some(awaiting) = inner.dependents_by_group.get(group) {
                for dkey in awaiting {
                    if dkey == &req.key {
                        continue;
                    }
                    if inner
                        .items
                        .get(dkey)
                        .is_some_and(|i| i.state == JobState::Ready)
                    {
                        to_block.push(dkey.clone());
                    }
                }
            }
        }
        for dkey in to_block {
            inner.block(&dkey);
        }

        Ok(AddOutcome {
            key: req.key,
            added: true,
            state,
        })
    }

    /// Fetch a live item's payload and stats.
    pub fn get(&self, key: &str) -> Result<(T, ItemStats)> {
        let inner = self.inner.read();
        inner
            .items
            .get(key)
            .map(|item| (item.data.clone(), item.stats()))
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// The terminal state a departed key reached, if any.
    pub fn terminal_state(&self, key: &str) -> Option<JobState> {
        self.inner.read().terminal.get(key).copied()
    }

    /// Mutate a live item's payload in place.
    pub fn update_data(&self, key: &str, f: impl FnOnce(&mut T)) -> Result<()> {
        let mut inner = self.inner.write();
        let item = inner
            .items
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        f(&mut item.data);
        Ok(())
    }

    /// Atomically move the best-priority ready item whose reserve group
    /// matches into `reserved` with a deadline of now + ttl. An empty group
    /// matches any. Ties break FIFO on entry into ready.
    pub fn reserve(&self, reserve_group: &str, ttl: Duration) -> Result<Option<(String, T)>> {
        let mut inner = self.inner.write();
        let key = if reserve_group.is_empty() {
            inner.pop_best_any()
        } else {
            inner.pop_best(reserve_group)
        };
        let Some(key) = key else {
            return Ok(None);
        };

        let deadline = Utc::now() + to_chrono(ttl);
        let Some(item) = inner.items.get_mut(&key) else {
            return Ok(None);
        };
        item.state = JobState::Reserved;
        item.epoch += 1;
        item.deadline = Some(deadline);
        item.release_at = None;
        let epoch = item.epoch;
        let data = item.data.clone();

        inner.run.push(Reverse(TimedEntry {
            at: deadline,
            key: key.clone(),
            epoch,
        }));
        inner.emit(&key, Some(JobState::Ready), JobState::Reserved);
        drop(inner);
        self.changed.notify_one();
        Ok(Some((key, data)))
    }

    /// Extend a reservation. The first touch promotes `reserved` to
    /// `running`. Fails once the existing deadline has already passed.
    pub fn touch(&self, key: &str, ttl: Duration) -> Result<DateTime<Utc>> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let deadline = now + to_chrono(ttl);

        let item = inner
            .items
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let from = item.state;
        match from {
            JobState::Reserved | JobState::Running => {}
            other => return Err(Error::wrong_state(key, other, "reserved or running")),
        }
        if item.deadline.is_none_or(|d| d < now) {
            return Err(Error::ReservationExpired(key.to_string()));
        }
        item.state = JobState::Running;
        item.deadline = Some(deadline);
        item.epoch += 1;
        let epoch = item.epoch;

        inner.run.push(Reverse(TimedEntry {
            at: deadline,
            key: key.to_string(),
            epoch,
        }));
        if from == JobState::Reserved {
            inner.emit(key, Some(from), JobState::Running);
        }
        drop(inner);
        self.changed.notify_one();
        Ok(deadline)
    }

    /// Give up a reservation: the item's remaining failure budget is
    /// decremented, and it moves back towards `ready` (through `delay` when
    /// a backoff is configured) or into `bury` once the budget is spent.
    pub fn release(&self, key: &str) -> Result<JobState> {
        let mut inner = self.inner.write();
        let state = inner.release_item(key, Utc::now())?;
        drop(inner);
        self.changed.notify_one();
        Ok(state)
    }

    /// Move a reserved item to `bury`, requiring operator action to revive.
    pub fn bury(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let item = inner
            .items
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let from = item.state;
        match from {
            JobState::Reserved | JobState::Running => {}
            other => return Err(Error::wrong_state(key, other, "reserved or running")),
        }
        inner.set_buried(key);
        inner.emit(key, Some(from), JobState::Buried);
        Ok(())
    }

    /// Revive a buried item into `ready` with a full failure budget.
    /// Kicking a key that is already back in `ready` is a no-op.
    pub fn kick(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let item = inner
            .items
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        match item.state {
            JobState::Buried => {
                item.until_buried = item.initial_until_buried;
                inner.bury.remove(key);
                inner.set_ready(key);
                inner.emit(key, Some(JobState::Buried), JobState::Ready);
                Ok(())
            }
            JobState::Ready => Ok(()),
            other => Err(Error::wrong_state(key, other, "buried")),
        }
    }

    /// Delete an item from whichever sub-queue holds it. Refused while other
    /// items in `dependent` await this key or a group it belongs to, since
    /// removal is terminal and would wrongly satisfy them.
    pub fn remove(&self, key: &str) -> Result<ItemStats> {
        let mut inner = self.inner.write();
        let stats = inner
            .items
            .get(key)
            .map(|item| item.stats())
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if inner.has_dependents_of(key) {
            return Err(Error::HasDependents(key.to_string()));
        }
        match stats.state {
            JobState::Buried => {
                inner.bury.remove(key);
            }
            JobState::Dependent => {
                inner.dependent.remove(key);
            }
            _ => {}
        }
        inner.items.remove(key);
        inner.terminal.insert(key.to_string(), JobState::Removed);
        inner.removed_count += 1;
        inner.emit(key, Some(stats.state), JobState::Removed);
        Ok(stats)
    }

    /// Erase an item as though its add never happened: no terminal record is
    /// left behind, so dependents are not satisfied and the key stays free.
    /// Used to roll back an insert whose persistence write failed.
    pub(crate) fn rollback_add(&self, key: &str) {
        let mut inner = self.inner.write();
        let Some(item) = inner.items.remove(key) else {
            return;
        };
        match item.state {
            JobState::Buried => {
                inner.bury.remove(key);
            }
            JobState::Dependent => {
                inner.dependent.remove(key);
            }
            _ => {}
        }
        for group in &item.dep_groups {
            if let Some(members) = inner.group_members.get_mut(group) {
                members.remove(key);
            }
        }
        for dep in &item.dependencies {
            match dep {
                Dependency::Key(k) => {
                    if let Some(awaiting) = inner.dependents_by_key.get_mut(k) {
                        awaiting.remove(key);
                    }
                }
                Dependency::Group(g) => {
                    if let Some(awaiting) = inner.dependents_by_group.get_mut(g) {
                        awaiting.remove(key);
                    }
                }
            }
        }
        inner.emit(key, Some(item.state), JobState::Removed);
    }

    /// Terminal success: drop the live item, remember the key as complete
    /// and run a dependency-resolution pass over everything awaiting it.
    pub fn complete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let item = inner
            .items
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let from = item.state;
        match from {
            JobState::Reserved | JobState::Running => {}
            other => return Err(Error::wrong_state(key, other, "reserved or running")),
        }
        let dep_groups = item.dep_groups.clone();

        inner.items.remove(key);
        inner.terminal.insert(key.to_string(), JobState::Complete);
        inner.complete_count += 1;
        inner.emit(key, Some(from), JobState::Complete);
        inner.resolve_dependents(key, &dep_groups);
        Ok(())
    }

    /// Whether any item in `dependent` awaits this key, directly or through
    /// a dep-group it belongs to.
    pub fn has_dependents(&self, key: &str) -> Result<bool> {
        let inner = self.inner.read();
        if !inner.items.contains_key(key) && !inner.terminal.contains_key(key) {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(inner.has_dependents_of(key))
    }

    /// Counts per sub-queue.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.read();
        let mut stats = QueueStats {
            complete: inner.complete_count,
            removed: inner.removed_count,
            ..QueueStats::default()
        };
        for item in inner.items.values() {
            match item.state {
                JobState::Delayed => stats.delayed += 1,
                JobState::Ready => stats.ready += 1,
                JobState::Reserved | JobState::Running => stats.running += 1,
                JobState::Buried => stats.buried += 1,
                JobState::Dependent => stats.dependent += 1,
                JobState::Complete | JobState::Removed => {}
            }
        }
        stats
    }

    /// Ready plus dependent counts per reserve group, for runner scaling.
    pub fn group_counts(&self) -> HashMap<String, usize> {
        let inner = self.inner.read();
        let mut counts = HashMap::new();
        for item in inner.items.values() {
            if matches!(item.state, JobState::Ready | JobState::Dependent) {
                *counts.entry(item.reserve_group.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Clone out every live item.
    pub fn snapshot(&self) -> Vec<(T, ItemStats)> {
        let inner = self.inner.read();
        inner
            .items
            .values()
            .map(|item| (item.data.clone(), item.stats()))
            .collect()
    }

    /// Perform all due timer transitions, returning the next deadline.
    pub fn process_timeouts(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut inner = self.inner.write();

        while let Some(key) = inner.pop_due_delayed(now) {
            inner.set_ready(&key);
            inner.emit(&key, Some(JobState::Delayed), JobState::Ready);
        }

        while let Some(key) = inner.pop_due_run(now) {
            tracing::warn!(queue = %self.name, key = %key, "reservation deadline passed; auto-releasing");
            let _ = inner.release_item(&key, now);
        }

        let next_delay = inner.next_valid_deadline_delayed();
        let next_run = inner.next_valid_deadline_run();
        match (next_delay, next_run) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drive timer transitions until shutdown: sleep to the next deadline,
    /// waking early whenever the queue changes.
    pub fn spawn_housekeeper(&self, shutdown: ShutdownToken) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                let next = queue.process_timeouts(Utc::now());
                let sleep_for = match next {
                    Some(at) => (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(Duration::from_secs(60)),
                    None => Duration::from_secs(60),
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = queue.changed.notified() => {}
                    _ = tokio::time::sleep(sleep_for) => {}
                }
            }
            tracing::debug!(queue = %queue.name, "housekeeper shutting down");
        })
    }
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn emit(&self, key: &str, from: Option<JobState>, to: JobState) {
        let _ = self.events.send(QueueEvent {
            key: key.to_string(),
            from,
            to,
        });
    }

    fn dep_satisfied(&self, dep: &Dependency) -> bool {
        match dep {
            Dependency::Key(k) => !self.items.contains_key(k),
            Dependency::Group(g) => self
                .group_members
                .get(g)
                .is_none_or(|members| members.iter().all(|k| !self.items.contains_key(k))),
        }
    }

    fn deps_satisfied_for(&self, key: &str) -> bool {
        let Some(item) = self.items.get(key) else {
            return false;
        };
        item.dependencies.iter().all(|dep| self.dep_satisfied(dep))
    }

    fn has_dependents_of(&self, key: &str) -> bool {
        let awaiting_in_dependent = |keys: &HashSet<String>| {
            keys.iter().any(|k| {
                self.items
                    .get(k)
                    .is_some_and(|i| i.state == JobState::Dependent)
            })
        };
        if self
            .dependents_by_key
            .get(key)
            .is_some_and(awaiting_in_dependent)
        {
            return true;
        }
        if let Some(item) = self.items.get(key) {
            for group in &item.dep_groups {
                if self
                    .dependents_by_group
                    .get(group)
                    .is_some_and(awaiting_in_dependent)
                {
                    return true;
                }
            }
        }
        false
    }

    /// Move an item into `ready` with a fresh FIFO position.
    fn set_ready(&mut self, key: &str) {
        self.seq += 1;
        let seq = self.seq;
        let Some(item) = self.items.get_mut(key) else {
            return;
        };
        item.state = JobState::Ready;
        item.entered_at = Utc::now();
        item.epoch += 1;
        item.deadline = None;
        item.release_at = None;
        let entry = ReadyEntry {
            priority: item.priority,
            seq,
            key: key.to_string(),
            epoch: item.epoch,
        };
        let group = item.reserve_group.clone();
        self.ready.entry(group).or_default().push(entry);
    }

    fn set_buried(&mut self, key: &str) {
        let Some(item) = self.items.get_mut(key) else {
            return;
        };
        item.state = JobState::Buried;
        item.epoch += 1;
        item.deadline = None;
        item.release_at = None;
        self.bury.insert(key.to_string());
    }

    fn set_delayed(&mut self, key: &str, until: DateTime<Utc>) {
        let Some(item) = self.items.get_mut(key) else {
            return;
        };
        item.state = JobState::Delayed;
        item.epoch += 1;
        item.deadline = None;
        item.release_at = Some(until);
        let epoch = item.epoch;
        self.delay.push(Reverse(TimedEntry {
            at: until,
            key: key.to_string(),
            epoch,
        }));
    }

    /// Push a ready item back to `dependent` (a new dep-group member arrived).
    fn block(&mut self, key: &str) {
        let Some(item) = self.items.get_mut(key) else {
            return;
        };
        if item.state != JobState::Ready {
            return;
        }
        item.state = JobState::Dependent;
        item.epoch += 1;
        self.dependent.insert(key.to_string());
        self.emit(key, Some(JobState::Ready), JobState::Dependent);
    }

    fn release_item(&mut self, key: &str, now: DateTime<Utc>) -> Result<JobState> {
        let item = self
            .items
            .get_mut(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let from = item.state;
        match from {
            JobState::Reserved | JobState::Running => {}
            other => return Err(Error::wrong_state(key, other, "reserved or running")),
        }
        item.until_buried = item.until_buried.saturating_sub(1);
        let exhausted = item.until_buried == 0;
        let backoff = self.cfg.release_backoff;

        let to = if exhausted {
            self.set_buried(key);
            JobState::Buried
        } else if backoff > Duration::ZERO {
            self.set_delayed(key, now + to_chrono(backoff));
            JobState::Delayed
        } else {
            self.set_ready(key);
            JobState::Ready
        };
        self.emit(key, Some(from), to);
        Ok(to)
    }

    /// Wake everything in `dependent` whose last outstanding dependency was
    /// the departing key.
    fn resolve_dependents(&mut self, key: &str, dep_groups: &[String]) {
        let mut candidates: HashSet<String> = self
            .dependents_by_key
            .get(key)
            .cloned()
            .unwrap_or_default();
        for group in dep_groups {
            if let Some(awaiting) = self.dependents_by_group.get(group) {
                candidates.extend(awaiting.iter().cloned());
            }
        }

        let mut to_ready: Vec<String> = candidates
            .into_iter()
            .filter(|c| {
                self.items
                    .get(c)
                    .is_some_and(|i| i.state == JobState::Dependent)
                    && self.deps_satisfied_for(c)
            })
            .collect();
        to_ready.sort();
        for c in to_ready {
            self.dependent.remove(&c);
            self.set_ready(&c);
            self.emit(&c, Some(JobState::Dependent), JobState::Ready);
        }
    }

    fn pop_best(&mut self, group: &str) -> Option<String> {
        let Inner { ready, items, .. } = self;
        let heap = ready.get_mut(group)?;
        while let Some(entry) = heap.pop() {
            let valid = items
                .get(&entry.key)
                .is_some_and(|i| i.state == JobState::Ready && i.epoch == entry.epoch);
            if valid {
                return Some(entry.key);
            }
        }
        None
    }

    fn pop_best_any(&mut self) -> Option<String> {
        let mut best: Option<(String, u8, u64)> = None;
        {
            let Inner { ready, items, .. } = &mut *self;
            for (group, heap) in ready.iter_mut() {
                while let Some(top) = heap.peek() {
                    let valid = items
                        .get(&top.key)
                        .is_some_and(|i| i.state == JobState::Ready && i.epoch == top.epoch);
                    if valid {
                        break;
                    }
                    heap.pop();
                }
                if let Some(top) = heap.peek() {
                    let better = match &best {
                        None => true,
                        Some((_, priority, seq)) => {
                            top.priority > *priority
                                || (top.priority == *priority && top.seq < *seq)
                        }
                    };
                    if better {
                        best = Some((group.clone(), top.priority, top.seq));
                    }
                }
            }
        }
        let (group, _, _) = best?;
        self.pop_best(&group)
    }

    fn pop_due_delayed(&mut self, now: DateTime<Utc>) -> Option<String> {
        loop {
            let stale = {
                let Reverse(top) = self.delay.peek()?;
                match self.items.get(&top.key) {
                    Some(i) if i.state == JobState::Delayed && i.epoch == top.epoch => {
                        if top.at > now {
                            return None;
                        }
                        false
                    }
                    _ => true,
                }
            };
            let popped = self.delay.pop();
            if !stale {
                return popped.map(|Reverse(e)| e.key);
            }
        }
    }

    fn pop_due_run(&mut self, now: DateTime<Utc>) -> Option<String> {
        loop {
            let stale = {
                let Reverse(top) = self.run.peek()?;
                match self.items.get(&top.key) {
                    Some(i)
                        if matches!(i.state, JobState::Reserved | JobState::Running)
                            && i.epoch == top.epoch =>
                    {
                        if top.at > now {
                            return None;
                        }
                        false
                    }
                    _ => true,
                }
            };
            let popped = self.run.pop();
            if !stale {
                return popped.map(|Reverse(e)| e.key);
            }
        }
    }

    fn next_valid_deadline_delayed(&mut self) -> Option<DateTime<Utc>> {
        loop {
            let stale = {
                let Reverse(top) = self.delay.peek()?;
                match self.items.get(&top.key) {
                    Some(i) if i.state == JobState::Delayed && i.epoch == top.epoch => {
                        return Some(top.at)
                    }
                    _ => true,
                }
            };
            if stale {
                self.delay.pop();
            }
        }
    }

    fn next_valid_deadline_run(&mut self) -> Option<DateTime<Utc>> {
        loop {
            let stale = {
                let Reverse(top) = self.run.peek()?;
                match self.items.get(&top.key) {
                    Some(i)
                        if matches!(i.state, JobState::Reserved | JobState::Running)
                            && i.epoch == top.epoch =>
                    {
                        return Some(top.at)
                    }
                    _ => true,
                }
            };
            if stale {
                self.run.pop();
            }
        }
    }
}
