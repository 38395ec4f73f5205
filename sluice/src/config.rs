use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Named deployment a manager runs under.
///
/// The deployment selects default ports, data directories and log paths so a
/// development manager can run alongside a production one on the same host.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Deployment {
    Production,
    Development,
}

impl Deployment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Deployment::Production => "production",
            Deployment::Development => "development",
        }
    }
}

impl std::fmt::Display for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a manager instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub deployment: Deployment,
    /// Address the TCP client protocol listens on.
    pub client_addr: SocketAddr,
    /// Address the status web interface listens on.
    pub web_addr: SocketAddr,
    /// Directory holding the embedded job database.
    pub data_dir: PathBuf,
    /// Path the manager logs to.
    pub log_path: PathBuf,
    /// Upper bound on reservation leases; client TTLs are clamped to this.
    pub max_reserve_ttl: Duration,
    /// Rolling read deadline on client connections.
    pub client_read_timeout: Duration,
    /// Backoff applied when a failed job is released for retry.
    pub release_backoff: Duration,
    /// Capacity of the status broadcast channel per subscriber.
    pub event_capacity: usize,
    /// How many times a persistence write is retried before the transition
    /// is abandoned with `PersistenceFailed`.
    pub persistence_retries: u32,
}

impl ManagerConfig {
    /// Defaults for the given deployment.
    pub fn for_deployment(deployment: Deployment) -> Self {
        let (client_port, web_port, dir) = match deployment {
            Deployment::Production => (11301, 11302, ".sluice/production"),
            Deployment::Development => (21301, 21302, ".sluice/development"),
        };
        Self {
            deployment,
            client_addr: SocketAddr::from(([127, 0, 0, 1], client_port)),
            web_addr: SocketAddr::from(([127, 0, 0, 1], web_port)),
            data_dir: PathBuf::from(dir).join("db"),
            log_path: PathBuf::from(dir).join("log"),
            max_reserve_ttl: Duration::from_secs(3600),
            client_read_timeout: Duration::from_secs(300),
            release_backoff: Duration::from_secs(30),
            event_capacity: 1024,
            persistence_retries: 3,
        }
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = addr;
        self
    }

    pub fn with_web_addr(mut self, addr: SocketAddr) -> Self {
        self.web_addr = addr;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_release_backoff(mut self, backoff: Duration) -> Self {
        self.release_backoff = backoff;
        self
    }

    pub fn with_max_reserve_ttl(mut self, ttl: Duration) -> Self {
        self.max_reserve_ttl = ttl;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::for_deployment(Deployment::Development)
    }
}

/// Tuning knobs for a single queue.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Backoff applied when a failed job is released for retry; zero moves
    /// the item straight back to ready.
    pub release_backoff: Duration,
    /// Capacity of the queue's transition event channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            release_backoff: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }
}

impl QueueConfig {
    pub fn with_release_backoff(mut self, backoff: Duration) -> Self {
        self.release_backoff = backoff;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}
