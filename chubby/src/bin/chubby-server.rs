use chubby::{
    client::RpcClient,
    config::{LeaseConfig, ServerConfig},
    handler::{serve, ServerState},
    storage::MemoryCluster,
    NodeId, Result,
};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::parse();
    let node_id = config.node_id.clone().map_or_else(NodeId::random, NodeId::new);

    info!("Chubby server starting...");
    info!("Node id: {}", node_id);
    info!("Client address: {}", config.listen);

    let cluster = if config.inmem {
        MemoryCluster::new()
    } else {
        MemoryCluster::open(&config.raft_dir)?
    };
    let store = cluster.node(node_id.clone(), config.listen.clone());

    if config.bootstrap() {
        cluster.elect(&node_id);
        info!("Bootstrapped single-node cluster");
    } else if let Some(contact) = &config.join {
        info!("Joining cluster through {}", contact);
        let mut rpc = RpcClient::new(contact.clone());
        if let Err(e) = rpc.join(&node_id, &config.raft_bind).await {
            let Some(redirect) = e.redirect() else {
                return Err(e);
            };
            rpc = RpcClient::new(redirect);
            rpc.join(&node_id, &config.raft_bind).await?;
        }
        let leader = rpc
            .status()
            .await?
            .leader
            .unwrap_or_else(|| rpc.addr().to_string());
        cluster.follow(leader);
    }

    let listener = TcpListener::bind(&config.listen).await?;
    let state = ServerState::new(
        node_id,
        config.listen.clone(),
        Arc::new(store),
        LeaseConfig::default(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down"),
            Err(e) => warn!("Could not listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    info!("API endpoints:");
    info!("  POST /rpc/*   - lock service RPCs");
    info!("  GET  /status  - node status");

    serve(listener, state, shutdown).await
}
