use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Dependency, JobState};

/// The queue's wrapper around a payload: sub-queue membership, ordering
/// bookkeeping, the reservation deadline while reserved, and the declared
/// dependency edges.
#[derive(Clone, Debug)]
pub(super) struct Item<T> {
    pub data: T,
    pub priority: u8,
    pub reserve_group: String,
    pub state: JobState,
    pub entered_at: DateTime<Utc>,
    /// Remaining failures before the item is buried.
    pub until_buried: u32,
    /// What `until_buried` resets to on kick.
    pub initial_until_buried: u32,
    /// Reservation deadline while in `reserved`/`running`.
    pub deadline: Option<DateTime<Utc>>,
    /// When a delayed item returns to `ready`.
    pub release_at: Option<DateTime<Utc>>,
    pub dep_groups: Vec<String>,
    pub dependencies: Vec<Dependency>,
    /// Bumped on every transition to invalidate stale heap entries.
    pub epoch: u64,
}

impl<T> Item<T> {
    pub fn stats(&self) -> ItemStats {
        ItemStats {
            state: self.state,
            priority: self.priority,
            reserve_group: self.reserve_group.clone(),
            entered_at: self.entered_at,
            until_buried: self.until_buried,
            deadline: self.deadline,
            release_at: self.release_at,
        }
    }
}

/// Point-in-time facts about a queued item.
#[derive(Clone, Debug)]
pub struct ItemStats {
    pub state: JobState,
    pub priority: u8,
    pub reserve_group: String,
    pub entered_at: DateTime<Utc>,
    pub until_buried: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub release_at: Option<DateTime<Utc>>,
}

/// What a caller supplies to enqueue a payload.
#[derive(Clone, Debug)]
pub struct AddRequest<T> {
    pub key: String,
    pub data: T,
    pub priority: u8,
    /// Partition for `reserve`; runners reserve with their scheduler group.
    pub reserve_group: String,
    /// Failures allowed before burial (`retries + 1`).
    pub until_buried: u32,
    /// Dep-groups this item satisfies for others.
    pub dep_groups: Vec<String>,
    /// What this item waits on.
    pub dependencies: Vec<Dependency>,
    /// Replace an existing buried or terminal item under the same key.
    pub supersede: bool,
}

/// Result of an `add`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddOutcome {
    pub key: String,
    /// False when the key already existed; the existing item is untouched.
    pub added: bool,
    pub state: JobState,
}

/// A single state transition, published in commit order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub key: String,
    /// `None` for a newly added item.
    pub from: Option<JobState>,
    pub to: JobState,
}

/// Counts per sub-queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub delayed: usize,
    pub ready: usize,
    pub running: usize,
    pub buried: usize,
    pub dependent: usize,
    pub complete: usize,
    pub removed: usize,
}

impl QueueStats {
    /// Items currently held in memory.
    pub fn live(&self) -> usize {
        self.delayed + self.ready + self.running + self.buried + self.dependent
    }
}

/// Max-heap entry for the `ready` sub-queue: highest priority first, FIFO on
/// entry sequence among equals.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct ReadyEntry {
    pub priority: u8,
    pub seq: u64,
    pub key: String,
    pub epoch: u64,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap entry (via `Reverse`) for the `delay` and `run` sub-queues.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct TimedEntry {
    pub at: DateTime<Utc>,
    pub key: String,
    pub epoch: u64,
}

impl Ord for TimedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.epoch.cmp(&other.epoch))
    }
}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
