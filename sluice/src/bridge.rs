//! Bridge between the queue and the external runner scheduler: groups
//! schedulable jobs by resource class and asks the collaborator to keep
//! enough runners alive for each group. The collaborator never calls back
//! into the queue; runners it starts connect as ordinary clients and reserve
//! with their group name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::job::Requirements;

/// The external scheduler collaborator (LSF, OpenStack, Kubernetes, local).
///
/// `ensure_runners` is idempotent: calling it repeatedly with the same count
/// must not spawn extra runners.
#[async_trait]
pub trait RunnerScheduler: Send + Sync {
    async fn ensure_runners(
        &self,
        group: &str,
        count: usize,
        reqs: &Requirements,
    ) -> anyhow::Result<()>;
}

/// Tracks per-group schedulable counts and relays changes to the scheduler.
pub struct SchedulerBridge {
    scheduler: Arc<dyn RunnerScheduler>,
    /// Representative requirements per scheduler group, learned at add time.
    requirements: Mutex<HashMap<String, Requirements>>,
    /// Counts last reported to the scheduler.
    reported: Mutex<HashMap<String, usize>>,
}

impl SchedulerBridge {
    pub fn new(scheduler: Arc<dyn RunnerScheduler>) -> Self {
        Self {
            scheduler,
            requirements: Mutex::new(HashMap::new()),
            reported: Mutex::new(HashMap::new()),
        }
    }

    /// Remember what a group's jobs need, so later `ensure_runners` calls
    /// can describe the runner to provision.
    pub fn note_requirements(&self, group: &str, reqs: &Requirements) {
        self.requirements
            .lock()
            .entry(group.to_string())
            .or_insert_with(|| reqs.clone());
    }

    /// Reconcile the scheduler with the current schedulable counts,
    /// contacting it only for groups whose count changed. Groups that
    /// disappeared are reported as zero so their runners can be released.
    pub async fn sync(&self, counts: HashMap<String, usize>) {
        let changed: Vec<(String, usize)> = {
            let mut reported = self.reported.lock();
            let mut changed = Vec::new();
            for (group, count) in &counts {
                if reported.get(group) != Some(count) {
                    changed.push((group.clone(), *count));
                }
            }
            for group in reported.keys() {
                if !counts.contains_key(group) {
                    changed.push((group.clone(), 0));
                }
            }
            for (group, count) in &changed {
                if *count == 0 {
                    reported.remove(group);
                } else {
                    reported.insert(group.clone(), *count);
                }
            }
            changed
        };

        for (group, count) in changed {
            self.ensure(&group, count).await;
        }
    }

    /// Hint that one fewer runner is needed now, fired when a job leaves
    /// `delay` other than by becoming ready in the same group.
    pub async fn decrement_group_count(&self, group: &str) {
        let count = {
            let mut reported = self.reported.lock();
            match reported.get_mut(group) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let count = *count;
                    if count == 0 {
                        reported.remove(group);
                    }
                    count
                }
                None => return,
            }
        };
        self.ensure(group, count).await;
    }

    async fn ensure(&self, group: &str, count: usize) {
        let reqs = {
            let requirements = self.requirements.lock();
            match requirements.get(group) {
                Some(reqs) => reqs.clone(),
                None => {
                    tracing::warn!(group = %group, "no requirements recorded for group; skipping scheduler call");
                    return;
                }
            }
        };
        if let Err(err) = self.scheduler.ensure_runners(group, count, &reqs).await {
            tracing::error!(group = %group, count, error = %err, "scheduler ensure_runners failed");
        }
    }
}
