use crate::{
    config::{ClientConfig, LeaseConfig},
    handler::{serve, ServerState},
    storage::MemoryCluster,
    ClientId, NodeId, Result,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct TestNode {
    pub node_id: NodeId,
    pub addr: String,
    pub state: ServerState,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestNode {
    pub fn crash(&self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

// A cell of servers sharing one `MemoryCluster`, with leadership moved by
// hand. Node 0 starts as master.
#[derive(Debug)]
pub struct TestCluster {
    cluster: MemoryCluster,
    nodes: Vec<TestNode>,
    lease: LeaseConfig,
}

impl TestCluster {
    pub async fn start(size: usize, lease: LeaseConfig) -> Result<Self> {
        let cluster = MemoryCluster::new();
        let mut nodes = Vec::with_capacity(size);

        for i in 0..size {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?.to_string();
            let node_id = NodeId::new(format!("node{i}"));
            let store = cluster.node(node_id.clone(), addr.clone());
            let state = ServerState::new(node_id.clone(), addr.clone(), Arc::new(store), lease);
            let shutdown = CancellationToken::new();
            let handle = tokio::spawn(serve(listener, state.clone(), shutdown.clone()));
            nodes.push(TestNode {
                node_id,
                addr,
                state,
                shutdown,
                handle,
            });
        }

        if let Some(first) = nodes.first() {
            cluster.elect(&first.node_id);
        }
        Ok(Self {
            cluster,
            nodes,
            lease,
        })
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn addrs(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.addr.clone()).collect()
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    pub fn leader(&self) -> Option<usize> {
        let leader = self.cluster.leader_id()?;
        self.nodes.iter().position(|node| node.node_id == leader)
    }

    pub fn elect(&self, index: usize) {
        self.cluster.elect(&self.nodes[index].node_id);
    }

    pub fn step_down(&self) {
        self.cluster.step_down();
    }

    pub fn crash(&self, index: usize) {
        if self.leader() == Some(index) {
            self.cluster.step_down();
        }
        self.nodes[index].crash();
    }

    pub fn client_config(&self, client_id: &str) -> ClientConfig {
        ClientConfig::new(ClientId::new(client_id))
            .with_servers(self.addrs())
            .with_lease(self.lease)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.crash();
        }
    }
}
