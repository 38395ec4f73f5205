//! The TCP client protocol: length-prefixed frames carrying bincode-encoded
//! tagged requests and responses. The first frame on a connection binds it
//! to a named queue; every later frame is one command.

use std::time::Duration;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{Error, Result};
use crate::job::{Accounting, Job, JobSpec, JobState};
use crate::queue::QueueStats;

/// One command frame from a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    /// Must be the first message on a connection.
    BindQueue { name: String },
    Add { jobs: Vec<JobSpec>, supersede: bool },
    Reserve { reserve_group: String, ttl: Duration },
    Touch { key: String, ttl: Duration },
    Release {
        key: String,
        reason: String,
        /// Measured facts about the failed attempt, when the runner has them.
        accounting: Option<Accounting>,
    },
    Bury {
        key: String,
        fail_reason: String,
        accounting: Option<Accounting>,
    },
    Kick { key: String },
    Remove { key: String },
    Complete {
        key: String,
        accounting: Accounting,
        stdout: String,
        stderr: String,
    },
    GetByKeys { keys: Vec<String> },
    GetByRepGroup {
        rep_group: String,
        limit: usize,
        state: Option<JobState>,
    },
    GetIncomplete,
    GetComplete { rep_group: String },
    Stats,
    Drain,
    Shutdown,
}

/// One reply frame from the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Added(Vec<AddedJob>),
    Reserved(Option<Job>),
    Jobs(Vec<Job>),
    Stats(ServerStats),
    Err(Error),
}

/// Per-job outcome of an `Add`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AddedJob {
    pub key: String,
    /// True when the key was already queued; the existing job is untouched.
    pub already_existed: bool,
}

/// Server-side counters for the bound queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerStats {
    pub queue: String,
    pub stats: QueueStats,
    pub draining: bool,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::Protocol(format!("encode: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Protocol(format!("decode: {e}")))
}

/// Wrap a TCP stream in the protocol's length-delimited framing.
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(stream, LengthDelimitedCodec::new())
}
