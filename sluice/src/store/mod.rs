//! Durable storage behind the queue: a live-job space written through on
//! every mutating transition, and a complete-job space written once at
//! archival and never deleted except by explicit rotation.

mod rocks;

pub use rocks::RocksStore;

use thiserror::Error;

use crate::job::Job;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(String),
    #[error("store encoding: {0}")]
    Encoding(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Captured stdout/stderr of a completed job, stored out-of-band and
/// streamed on demand.
#[derive(Clone, Debug, Default)]
pub struct JobOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The persistence façade.
///
/// Implementations must make `archive` atomic: the complete record, the
/// output blobs and the deletion of the live record land together or not at
/// all, so a crash can never lose a job between the two spaces.
pub trait JobStore: Send + Sync {
    /// Upsert the live record for a queued job.
    fn save_live(&self, job: &Job) -> StoreResult<()>;

    /// Drop a live record (job removed without completing).
    fn delete_live(&self, key: &str) -> StoreResult<()>;

    /// All live records, for startup recovery.
    fn load_live(&self) -> StoreResult<Vec<Job>>;

    /// Move a job to the complete space, storing its output blobs and
    /// deleting the live record in the same write.
    fn archive(&self, job: &Job, stdout: &str, stderr: &str) -> StoreResult<()>;

    /// A completed job by key.
    fn complete_by_key(&self, key: &str) -> StoreResult<Option<Job>>;

    /// All completed jobs carrying a reporting group.
    fn complete_by_rep_group(&self, rep_group: &str) -> StoreResult<Vec<Job>>;

    /// The stored output blobs for a completed job.
    fn output(&self, key: &str) -> StoreResult<Option<JobOutput>>;
}

pub(crate) fn encode_job(job: &Job) -> StoreResult<Vec<u8>> {
    bincode::serialize(job).map_err(|e| StoreError::Encoding(e.to_string()))
}

pub(crate) fn decode_job(bytes: &[u8]) -> StoreResult<Job> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Encoding(e.to_string()))
}
