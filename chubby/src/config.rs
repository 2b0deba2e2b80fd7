use crate::ClientId;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LEASE_LENGTH: Duration = Duration::from_secs(12);
pub const DEFAULT_LEASE_EXTENSION: Duration = Duration::from_secs(12);
pub const JEOPARDY_DURATION: Duration = Duration::from_secs(45);

pub const DEFAULT_SERVER_ADDRS: [&str; 5] = [
    "127.0.0.1:5379",
    "127.0.0.1:6379",
    "127.0.0.1:7379",
    "127.0.0.1:8379",
    "127.0.0.1:9379",
];

// Timing contract shared by servers and clients.
//
// Both sides must agree on `lease_length`, `lease_extension` and
// `jeopardy`; the remaining fields only tune how often each side wakes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    pub lease_length: Duration,
    pub lease_extension: Duration,
    pub jeopardy: Duration,
    pub monitor_tick: Duration,
    pub expiry_warning: Duration,
    pub probe_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_length: DEFAULT_LEASE_LENGTH,
            lease_extension: DEFAULT_LEASE_EXTENSION,
            jeopardy: JEOPARDY_DURATION,
            monitor_tick: Duration::from_secs(1),
            expiry_warning: Duration::from_secs(1),
            probe_interval: Duration::from_millis(250),
        }
    }
}

impl LeaseConfig {
    pub fn fast() -> Self {
        Self {
            lease_length: Duration::from_millis(1000),
            lease_extension: Duration::from_millis(1000),
            jeopardy: Duration::from_millis(3000),
            monitor_tick: Duration::from_millis(50),
            expiry_warning: Duration::from_millis(300),
            probe_interval: Duration::from_millis(50),
        }
    }
}

/// Command line of a server process.
#[derive(Parser, Debug, Clone)]
#[command(name = "chubby-server", version, about = "Chubby-style lock service node")]
pub struct ServerConfig {
    /// Address client RPCs are served on
    #[arg(long, env = "CHUBBY_LISTEN", default_value = "127.0.0.1:5379")]
    pub listen: String,

    /// Directory holding the replicated log
    #[arg(long, env = "CHUBBY_RAFT_DIR", default_value = "./")]
    pub raft_dir: PathBuf,

    /// Address the replication transport binds to
    #[arg(long, env = "CHUBBY_RAFT_BIND", default_value = "127.0.0.1:15379")]
    pub raft_bind: String,

    /// Node id; generated when omitted
    #[arg(long = "id", env = "CHUBBY_NODE_ID")]
    pub node_id: Option<String>,

    /// Join an existing cluster through the server at this address; client
    /// calls to this node are then redirected to that cluster's leader
    #[arg(long, env = "CHUBBY_JOIN")]
    pub join: Option<String>,

    /// Keep the log in memory only
    #[arg(long, env = "CHUBBY_INMEM")]
    pub inmem: bool,
}

impl ServerConfig {
    pub fn bootstrap(&self) -> bool {
        self.join.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: ClientId,
    pub servers: Vec<String>,
    pub lease: LeaseConfig,
}

impl ClientConfig {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            servers: DEFAULT_SERVER_ADDRS.iter().map(|s| (*s).to_string()).collect(),
            lease: LeaseConfig::default(),
        }
    }

    #[must_use]
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }
}
