use chubby::{
    client::{ClientSession, RpcClient},
    config::{ClientConfig, DEFAULT_SERVER_ADDRS},
    ClientId, LockMode, LockPath, Result,
};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chubby-client", version, about = "Demo clients for the lock service")]
struct Cli {
    /// ID of this client
    #[arg(long, env = "CHUBBY_CLIENT_ID", default_value = "simple_client_1")]
    client_id: String,

    /// Candidate server addresses, comma separated
    #[arg(long = "servers", value_delimiter = ',', default_values = DEFAULT_SERVER_ADDRS)]
    servers: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep a session alive until interrupted
    Hold,
    /// Spin on an exclusive lock until it is granted
    Acquire {
        #[arg(long, default_value = "Lock/Lock1")]
        path: String,
    },
    /// Shared acquire/release in a loop, reporting throughput
    Churn {
        #[arg(long, default_value_t = 100)]
        locks: usize,
    },
    /// Take an exclusive lock as leader, hold it, then step down
    Elect {
        #[arg(long, default_value = "Lock/Lock1")]
        path: String,
        #[arg(long, default_value_t = 55)]
        hold_secs: u64,
    },
    /// Print every candidate server's status as JSON
    Status,
}

impl Cli {
    fn config(&self) -> ClientConfig {
        ClientConfig::new(ClientId::new(self.client_id.clone())).with_servers(self.servers.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        Command::Hold => hold(config).await,
        Command::Acquire { path } => acquire(config, LockPath::new(path)).await,
        Command::Churn { locks } => churn(config, locks).await,
        Command::Elect { path, hold_secs } => {
            elect(config, LockPath::new(path), Duration::from_secs(hold_secs)).await
        }
        Command::Status => status(&config.servers).await,
    }
}

async fn status(servers: &[String]) -> Result<()> {
    for addr in servers {
        match RpcClient::new(addr.clone()).status().await {
            Ok(status) => match serde_json::to_string_pretty(&status) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("Could not encode status of {}: {}", addr, e),
            },
            Err(e) => warn!("{} unreachable: {}", addr, e),
        }
    }
    Ok(())
}

async fn hold(config: ClientConfig) -> Result<()> {
    let session = ClientSession::init(config).await?;
    info!("Session open with {}", session.server_addr());

    tokio::select! {
        () = session.expired() => warn!("Session expired"),
        _ = tokio::signal::ctrl_c() => session.close(),
    }
    Ok(())
}

async fn acquire(config: ClientConfig, path: LockPath) -> Result<()> {
    let session = ClientSession::init(config).await?;
    session.open_lock(&path).await?;

    let start = Instant::now();
    while !session.try_acquire_lock(&path, LockMode::Exclusive).await? {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    info!("Acquired {} after {:?}", path, start.elapsed());

    tokio::signal::ctrl_c().await?;
    session.close();
    Ok(())
}

async fn churn(config: ClientConfig, lock_count: usize) -> Result<()> {
    let counter = Arc::new(AtomicU64::new(0));
    let reporter = Arc::clone(&counter);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.tick().await;
        loop {
            tick.tick().await;
            info!(
                "Performed {} operations in the last second",
                reporter.swap(0, Ordering::Relaxed)
            );
        }
    });

    let paths: Vec<LockPath> = (0..lock_count)
        .map(|i| LockPath::new(format!("lock_{i}_{}", config.client_id)))
        .collect();

    loop {
        let session = ClientSession::init(config.clone()).await?;
        for path in &paths {
            session.open_lock(path).await?;
        }

        let outcome: Result<()> = async {
            loop {
                for path in &paths {
                    if session.try_acquire_lock(path, LockMode::Shared).await? {
                        session.release_lock(path).await?;
                        counter.fetch_add(1, Ordering::Relaxed);
                    } else {
                        warn!("Failed to acquire {}, continuing", path);
                    }
                }
            }
        }
        .await;

        match outcome {
            Err(e) if e.is_session_expired() => {
                warn!("Session expired, starting a new one");
                // Let the master finish tearing down the old session.
                tokio::time::sleep(config.lease.lease_length).await;
            }
            Err(e) => {
                error!("Churn failed: {}", e);
                return Err(e);
            }
            Ok(()) => return Ok(()),
        }
    }
}

async fn elect(config: ClientConfig, path: LockPath, hold_for: Duration) -> Result<()> {
    let session = ClientSession::init(config).await?;
    session.open_lock(&path).await?;

    if !session.try_acquire_lock(&path, LockMode::Exclusive).await? {
        warn!("Another client is leader for {}", path);
        session.close();
        return Ok(());
    }
    info!("Elected leader for {}, holding for {:?}", path, hold_for);

    tokio::time::sleep(hold_for).await;
    session.release_lock(&path).await?;
    info!("Stepped down");
    session.close();
    Ok(())
}
