use crate::{error::Fault, ClientId, LockMode, LockPath, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const INIT_SESSION: &str = "/rpc/init_session";
pub const KEEP_ALIVE: &str = "/rpc/keep_alive";
pub const OPEN_LOCK: &str = "/rpc/open_lock";
pub const DELETE_LOCK: &str = "/rpc/delete_lock";
pub const TRY_ACQUIRE_LOCK: &str = "/rpc/try_acquire_lock";
pub const RELEASE_LOCK: &str = "/rpc/release_lock";
pub const JOIN: &str = "/rpc/join";
pub const STATUS: &str = "/status";

pub type Reply<T> = std::result::Result<T, Fault>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSessionRequest {
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitSessionResponse {
    pub leader_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub client_id: ClientId,
    // Locks the client believes it holds; only sent while in jeopardy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locks: Option<BTreeMap<LockPath, LockMode>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub lease_length: Duration,
    // The session is gone; the client should stop renewing.
    #[serde(default)]
    pub expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenLockRequest {
    pub client_id: ClientId,
    pub path: LockPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteLockRequest {
    pub client_id: ClientId,
    pub path: LockPath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryAcquireLockRequest {
    pub client_id: ClientId,
    pub path: LockPath,
    pub mode: LockMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryAcquireLockResponse {
    pub is_successful: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseLockRequest {
    pub client_id: ClientId,
    pub path: LockPath,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EmptyResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub raft_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub node_id: NodeId,
    pub listen: String,
    pub is_leader: bool,
    pub leader: Option<String>,
    pub sessions: usize,
    pub locks: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
}
