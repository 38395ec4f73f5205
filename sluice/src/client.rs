//! Client side of the TCP protocol, used by runners, tooling and tests.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{Error, Result};
use crate::job::{Accounting, Job, JobSpec, JobState};
use crate::protocol::{self, AddedJob, Request, Response, ServerStats};

/// Interval between polls while synthesizing a blocking reserve.
const RESERVE_POLL: Duration = Duration::from_millis(100);

/// A connection to a manager, bound to one named queue.
pub struct Client {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Client {
    /// Connect and bind to the named queue.
    pub async fn connect(addr: impl ToSocketAddrs, queue: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Protocol(format!("connect: {e}")))?;
        let mut client = Self {
            framed: protocol::framed(stream),
        };
        match client
            .call(&Request::BindQueue {
                name: queue.to_string(),
            })
            .await?
        {
            Response::Ok => Ok(client),
            other => Err(Error::Protocol(format!("unexpected bind reply: {other:?}"))),
        }
    }

    async fn call(&mut self, request: &Request) -> Result<Response> {
        self.framed
            .send(protocol::encode(request)?)
            .await
            .map_err(|e| Error::Protocol(format!("send: {e}")))?;
        let frame = match self.framed.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(Error::Protocol(format!("recv: {e}"))),
            None => return Err(Error::Protocol("connection closed".to_string())),
        };
        match protocol::decode::<Response>(&frame)? {
            Response::Err(err) => Err(err),
            response => Ok(response),
        }
    }

    async fn expect_ok(&mut self, request: &Request) -> Result<()> {
        match self.call(request).await? {
            Response::Ok => Ok(()),
            other => Err(Error::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Submit jobs, returning one `(key, already_existed)` per job.
    pub async fn add(&mut self, jobs: Vec<JobSpec>) -> Result<Vec<AddedJob>> {
        match self
            .call(&Request::Add {
                jobs,
                supersede: false,
            })
            .await?
        {
            Response::Added(added) => Ok(added),
            other => Err(Error::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Reserve the best ready job in `reserve_group` (empty matches any),
    /// holding it for `ttl` unless touched.
    pub async fn reserve(&mut self, reserve_group: &str, ttl: Duration) -> Result<Option<Job>> {
        match self
            .call(&Request::Reserve {
                reserve_group: reserve_group.to_string(),
                ttl,
            })
            .await?
        {
            Response::Reserved(job) => Ok(job),
            other => Err(Error::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Reserve, short-polling for up to `wait` when nothing is ready yet.
    pub async fn reserve_wait(
        &mut self,
        reserve_group: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(job) = self.reserve(reserve_group, ttl).await? {
                return Ok(Some(job));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESERVE_POLL.min(wait)).await;
        }
    }

    pub async fn touch(&mut self, key: &str, ttl: Duration) -> Result<()> {
        self.expect_ok(&Request::Touch {
            key: key.to_string(),
            ttl,
        })
        .await
    }

    /// Give the job back for retry, optionally recording the failed
    /// attempt's accounting first.
    pub async fn release(
        &mut self,
        key: &str,
        reason: &str,
        accounting: Option<Accounting>,
    ) -> Result<()> {
        self.expect_ok(&Request::Release {
            key: key.to_string(),
            reason: reason.to_string(),
            accounting,
        })
        .await
    }

    /// Bury the job for operator attention, optionally recording the failed
    /// attempt's accounting first.
    pub async fn bury(
        &mut self,
        key: &str,
        fail_reason: &str,
        accounting: Option<Accounting>,
    ) -> Result<()> {
        self.expect_ok(&Request::Bury {
            key: key.to_string(),
            fail_reason: fail_reason.to_string(),
            accounting,
        })
        .await
    }

    pub async fn kick(&mut self, key: &str) -> Result<()> {
        self.expect_ok(&Request::Kick {
            key: key.to_string(),
        })
        .await
    }

    pub async fn remove(&mut self, key: &str) -> Result<()> {
        self.expect_ok(&Request::Remove {
            key: key.to_string(),
        })
        .await
    }

    /// Report a finished attempt. The server triggers the job's behaviours
    /// and archives it; a `Behaviour` error means the job still completed.
    pub async fn complete(
        &mut self,
        key: &str,
        accounting: Accounting,
        stdout: &str,
        stderr: &str,
    ) -> Result<()> {
        self.expect_ok(&Request::Complete {
            key: key.to_string(),
            accounting,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })
        .await
    }

    pub async fn get_by_keys(&mut self, keys: Vec<String>) -> Result<Vec<Job>> {
        self.jobs(&Request::GetByKeys { keys }).await
    }

    pub async fn get_by_rep_group(
        &mut self,
        rep_group: &str,
        limit: usize,
        state: Option<JobState>,
    ) -> Result<Vec<Job>> {
        self.jobs(&Request::GetByRepGroup {
            rep_group: rep_group.to_string(),
            limit,
            state,
        })
        .await
    }

    pub async fn get_incomplete(&mut self) -> Result<Vec<Job>> {
        self.jobs(&Request::GetIncomplete).await
    }

    pub async fn get_complete(&mut self, rep_group: &str) -> Result<Vec<Job>> {
        self.jobs(&Request::GetComplete {
            rep_group: rep_group.to_string(),
        })
        .await
    }

    pub async fn stats(&mut self) -> Result<ServerStats> {
        match self.call(&Request::Stats).await? {
            Response::Stats(stats) => Ok(stats),
            other => Err(Error::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Stop the server accepting new work, keeping existing jobs.
    pub async fn drain(&mut self) -> Result<()> {
        self.expect_ok(&Request::Drain).await
    }

    /// Shut the server down gracefully.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.expect_ok(&Request::Shutdown).await
    }

    async fn jobs(&mut self, request: &Request) -> Result<Vec<Job>> {
        match self.call(request).await? {
            Response::Jobs(jobs) => Ok(jobs),
            other => Err(Error::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }
}
