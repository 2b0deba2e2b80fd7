use crate::{Error, NodeId, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const LOG_FILE_NAME: &str = "chubby.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[async_trait]
pub trait ReplicatedStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn apply(&self, command: Command) -> Result<()>;

    fn is_leader(&self) -> bool;

    fn leader(&self) -> Option<String>;

    async fn join(&self, node_id: &NodeId, addr: &str) -> Result<()>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.apply(Command::Set {
            key: key.to_string(),
            value,
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.apply(Command::Delete {
            key: key.to_string(),
        })
        .await
    }
}

#[derive(Debug, Default)]
struct CommitLog {
    entries: Vec<Vec<u8>>,
    file: Option<File>,
}

#[derive(Debug, Default)]
struct ClusterInner {
    data: DashMap<String, Vec<u8>>,
    log: Mutex<CommitLog>,
    members: DashMap<NodeId, String>,
    leader: RwLock<Option<NodeId>>,
    // Master of the cluster this one joined, when no local node leads.
    remote_leader: RwLock<Option<String>>,
}

// Every node handed out by `MemoryCluster::node` shares one committed log
// and one key/value map, while leadership is moved explicitly. Volatile
// per-node state (sessions, lock modes) lives outside and is lost on a
// leadership change exactly as it would be across real processes.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE_NAME);
        let cluster = Self::new();

        if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            let mut replayed = 0usize;
            loop {
                match bincode::deserialize_from::<_, Command>(&mut reader) {
                    Ok(command) => {
                        cluster.apply_committed(&command);
                        cluster
                            .inner
                            .log
                            .lock()
                            .entries
                            .push(bincode::serialize(&command)?);
                        replayed += 1;
                    }
                    // A torn tail from a crash mid-append reads as EOF too.
                    Err(e) => {
                        if let bincode::ErrorKind::Io(io) = e.as_ref() {
                            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                                break;
                            }
                        }
                        return Err(e.into());
                    }
                }
            }
            info!(entries = replayed, path = %path.display(), "replayed committed log");
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        cluster.inner.log.lock().file = Some(file);
        Ok(cluster)
    }

    pub fn node(&self, node_id: NodeId, addr: impl Into<String>) -> MemoryStore {
        self.inner.members.insert(node_id.clone(), addr.into());
        MemoryStore {
            node_id,
            cluster: self.clone(),
        }
    }

    pub fn elect(&self, node_id: &NodeId) {
        info!(node = %node_id, "leader elected");
        *self.inner.leader.write() = Some(node_id.clone());
    }

    pub fn step_down(&self) {
        if let Some(old) = self.inner.leader.write().take() {
            info!(node = %old, "leader stepped down");
        }
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.leader.read().clone()
    }

    pub fn leader_addr(&self) -> Option<String> {
        match self.leader_id() {
            Some(leader) => self.inner.members.get(&leader).map(|addr| addr.clone()),
            None => self.inner.remote_leader.read().clone(),
        }
    }

    pub fn follow(&self, leader_addr: impl Into<String>) {
        let leader_addr = leader_addr.into();
        info!(leader = %leader_addr, "following remote leader");
        *self.inner.remote_leader.write() = Some(leader_addr);
    }

    pub fn members(&self) -> Vec<(NodeId, String)> {
        self.inner
            .members
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn log_len(&self) -> usize {
        self.inner.log.lock().entries.len()
    }

    fn commit(&self, command: &Command) -> Result<()> {
        let entry = bincode::serialize(command)?;
        let mut log = self.inner.log.lock();
        if let Some(file) = log.file.as_mut() {
            file.write_all(&entry)?;
            file.sync_data()?;
        }
        log.entries.push(entry);
        self.apply_committed(command);
        debug!(index = log.entries.len(), ?command, "committed");
        Ok(())
    }

    fn apply_committed(&self, command: &Command) {
        match command {
            Command::Set { key, value } => {
                self.inner.data.insert(key.clone(), value.clone());
            }
            Command::Delete { key } => {
                self.inner.data.remove(key);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    node_id: NodeId,
    cluster: MemoryCluster,
}

impl MemoryStore {
    pub fn standalone(addr: impl Into<String>) -> Self {
        let cluster = MemoryCluster::new();
        let store = cluster.node(NodeId::random(), addr);
        cluster.elect(&store.node_id);
        store
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader {
                leader: self.leader(),
            })
        }
    }
}

#[async_trait]
impl ReplicatedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.cluster.inner.data.get(key).map(|v| v.clone()))
    }

    async fn apply(&self, command: Command) -> Result<()> {
        self.ensure_leader()?;
        self.cluster.commit(&command)
    }

    fn is_leader(&self) -> bool {
        self.cluster.leader_id().as_ref() == Some(&self.node_id)
    }

    fn leader(&self) -> Option<String> {
        self.cluster.leader_addr()
    }

    async fn join(&self, node_id: &NodeId, addr: &str) -> Result<()> {
        self.ensure_leader()?;
        info!(node = %node_id, addr, "node joined");
        self.cluster
            .inner
            .members
            .insert(node_id.clone(), addr.to_string());
        Ok(())
    }
}
