use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobState;

/// Errors surfaced to clients as tagged values.
///
/// Every variant serializes, so the protocol layer can carry errors across
/// the wire unchanged and clients can match on them.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {key} is {actual}, expected {expected}")]
    WrongState {
        key: String,
        actual: JobState,
        expected: String,
    },

    #[error("job {0} has outstanding dependents")]
    HasDependents(String),

    #[error("job {0} already exists buried or completed; pass supersede to replace it")]
    DuplicateAdd(String),

    #[error("reservation expired for job {0}")]
    ReservationExpired(String),

    #[error("requested ttl refused")]
    TtlRefused,

    /// Fatal for the transition that required the write; the in-memory
    /// state is left untouched.
    #[error("persistence failed during {op}: {detail}")]
    PersistenceFailed { op: String, detail: String },

    /// Composite, non-fatal: the job's terminal transition stands even when
    /// some of its behaviours failed.
    #[error("{} behaviour(s) had errors: {}", .0.len(), .0.join("; "))]
    Behaviour(Vec<String>),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub(crate) fn wrong_state(key: impl Into<String>, actual: JobState, expected: &str) -> Self {
        Self::WrongState {
            key: key.into(),
            actual,
            expected: expected.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
