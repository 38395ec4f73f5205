use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use sluice::{Job, JobOutput, JobStore, StoreError, StoreResult};

/// An in-memory [`JobStore`] with the same two-space semantics as the
/// embedded store, plus failure injection for persistence-error tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    live: Arc<Mutex<HashMap<String, Job>>>,
    complete: Arc<Mutex<HashMap<String, Job>>>,
    output: Arc<Mutex<HashMap<String, (String, String)>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, to exercise `PersistenceFailed`.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn complete_count(&self) -> usize {
        self.complete.lock().len()
    }

    fn check_writable(&self) -> StoreResult<()> {
        if *self.fail_writes.lock() {
            Err(StoreError::Io("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl JobStore for MemoryStore {
    fn save_live(&self, job: &Job) -> StoreResult<()> {
        self.check_writable()?;
        self.live.lock().insert(job.key.clone(), job.clone());
        Ok(())
    }

    fn delete_live(&self, key: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.live.lock().remove(key);
        Ok(())
    }

    fn load_live(&self) -> StoreResult<Vec<Job>> {
        Ok(self.live.lock().values().cloned().collect())
    }

    fn archive(&self, job: &Job, stdout: &str, stderr: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.complete.lock().insert(job.key.clone(), job.clone());
        self.output
            .lock()
            .insert(job.key.clone(), (stdout.to_string(), stderr.to_string()));
        self.live.lock().remove(&job.key);
        Ok(())
    }

    fn complete_by_key(&self, key: &str) -> StoreResult<Option<Job>> {
        Ok(self.complete.lock().get(key).cloned())
    }

    fn complete_by_rep_group(&self, rep_group: &str) -> StoreResult<Vec<Job>> {
        Ok(self
            .complete
            .lock()
            .values()
            .filter(|job| job.rep_group == rep_group)
            .cloned()
            .collect())
    }

    fn output(&self, key: &str) -> StoreResult<Option<JobOutput>> {
        Ok(self
            .output
            .lock()
            .get(key)
            .map(|(stdout, stderr)| JobOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }))
    }
}
