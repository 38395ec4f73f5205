use std::path::Path;

use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};

use super::{decode_job, encode_job, JobOutput, JobStore, StoreError, StoreResult};
use crate::job::Job;

const CF_LIVE: &str = "live";
const CF_COMPLETE: &str = "complete";
const CF_OUTPUT: &str = "output";

/// Embedded RocksDB-backed job store.
///
/// The two logical spaces map to column families, with a third family for
/// out-of-band stdout/stderr blobs keyed by job key.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, path, [CF_LIVE, CF_COMPLETE, CF_OUTPUT])
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> StoreResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Io(format!("missing column family {name}")))
    }
}

impl JobStore for RocksStore {
    fn save_live(&self, job: &Job) -> StoreResult<()> {
        let cf = self.cf(CF_LIVE)?;
        self.db
            .put_cf(cf, job.key.as_bytes(), encode_job(job)?)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn delete_live(&self, key: &str) -> StoreResult<()> {
        let cf = self.cf(CF_LIVE)?;
        self.db
            .delete_cf(cf, key.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn load_live(&self) -> StoreResult<Vec<Job>> {
        let cf = self.cf(CF_LIVE)?;
        let mut jobs = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            jobs.push(decode_job(&value)?);
        }
        Ok(jobs)
    }

    fn archive(&self, job: &Job, stdout: &str, stderr: &str) -> StoreResult<()> {
        let live = self.cf(CF_LIVE)?;
        let complete = self.cf(CF_COMPLETE)?;
        let output = self.cf(CF_OUTPUT)?;

        let blobs = bincode::serialize(&(stdout, stderr))
            .map_err(|e| StoreError::Encoding(e.to_string()))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(complete, job.key.as_bytes(), encode_job(job)?);
        batch.put_cf(output, job.key.as_bytes(), blobs);
        batch.delete_cf(live, job.key.as_bytes());
        self.db
            .write(batch)
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn complete_by_key(&self, key: &str) -> StoreResult<Option<Job>> {
        let cf = self.cf(CF_COMPLETE)?;
        let value = self
            .db
            .get_cf(cf, key.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        value.map(|bytes| decode_job(&bytes)).transpose()
    }

    fn complete_by_rep_group(&self, rep_group: &str) -> StoreResult<Vec<Job>> {
        let cf = self.cf(CF_COMPLETE)?;
        let mut jobs = Vec::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            let job = decode_job(&value)?;
            if job.rep_group == rep_group {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn output(&self, key: &str) -> StoreResult<Option<JobOutput>> {
        let cf = self.cf(CF_OUTPUT)?;
        let Some(bytes) = self
            .db
            .get_cf(cf, key.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?
        else {
            return Ok(None);
        };
        let (stdout, stderr): (String, String) =
            bincode::deserialize(&bytes).map_err(|e| StoreError::Encoding(e.to_string()))?;
        Ok(Some(JobOutput { stdout, stderr }))
    }
}
