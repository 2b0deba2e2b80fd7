pub mod transport;

pub use transport::RpcClient;

use crate::{
    config::{ClientConfig, LeaseConfig},
    message::KeepAliveResponse,
    ClientId, Error, LockError, LockMode, LockPath, Result,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    // Lease ran out locally; the session ends at `deadline` unless a server
    // takes it over first.
    Jeopardy { deadline: Instant },
    Expired,
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    start_time: Instant,
    lease_length: Duration,
}

impl Lease {
    fn deadline(&self) -> Instant {
        self.start_time + self.lease_length
    }
}

type KeepAliveResult = (u64, Result<KeepAliveResponse>);

#[derive(Debug)]
struct Inner {
    client_id: ClientId,
    config: LeaseConfig,
    candidates: Vec<String>,
    http: reqwest::Client,
    server: RwLock<RpcClient>,
    lease: Mutex<Lease>,
    locks: Mutex<BTreeMap<LockPath, LockMode>>,
    phase: watch::Sender<SessionPhase>,
    shutdown: CancellationToken,
}

impl Inner {
    fn server(&self) -> RpcClient {
        self.server.read().clone()
    }

    fn lease_deadline(&self) -> Instant {
        self.lease.lock().deadline()
    }

    fn held_locks(&self) -> BTreeMap<LockPath, LockMode> {
        self.locks.lock().clone()
    }

    fn expire(&self) {
        self.phase.send_replace(SessionPhase::Expired);
        self.shutdown.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

impl ClientSession {
    pub async fn init(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::new();
        let start_time = Instant::now();
        let server = connect(&config, &http).await?;
        info!(client = %config.client_id, server = %server.addr(), "session established");

        let (phase, _) = watch::channel(SessionPhase::Active);
        let inner = Arc::new(Inner {
            client_id: config.client_id,
            config: config.lease,
            candidates: config.servers,
            http,
            server: RwLock::new(server),
            lease: Mutex::new(Lease {
                start_time,
                lease_length: config.lease.lease_length,
            }),
            locks: Mutex::new(BTreeMap::new()),
            phase,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(monitor(Arc::clone(&inner)));
        Ok(Self { inner })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.borrow()
    }

    pub fn is_expired(&self) -> bool {
        self.phase() == SessionPhase::Expired
    }

    pub fn in_jeopardy(&self) -> bool {
        matches!(self.phase(), SessionPhase::Jeopardy { .. })
    }

    pub fn server_addr(&self) -> String {
        self.inner.server.read().addr().to_string()
    }

    pub fn lease_length(&self) -> Duration {
        self.inner.lease.lock().lease_length
    }

    pub fn held_locks(&self) -> BTreeMap<LockPath, LockMode> {
        self.inner.held_locks()
    }

    pub async fn expired(&self) {
        let mut phase = self.inner.phase.subscribe();
        // Sender lives in `inner`, which `self` keeps alive.
        let _ = phase.wait_for(|p| *p == SessionPhase::Expired).await;
    }

    pub fn close(&self) {
        if !self.is_expired() {
            info!(client = %self.inner.client_id, "closing session");
        }
        self.inner.expire();
    }

    async fn wait_until_usable(&self) -> Result<()> {
        let mut phase = self.inner.phase.subscribe();
        loop {
            let current = *phase.borrow_and_update();
            match current {
                SessionPhase::Active => return Ok(()),
                SessionPhase::Expired => return Err(self.expired_error()),
                SessionPhase::Jeopardy { .. } => {}
            }
            if phase.changed().await.is_err() {
                return Err(self.expired_error());
            }
        }
    }

    fn expired_error(&self) -> Error {
        Error::SessionExpired {
            client: self.inner.client_id.clone(),
        }
    }

    // Run `op` against the current master, retrying only when the
    // connection dropped before the reply came back.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(RpcClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            self.wait_until_usable().await?;
            match op(self.inner.server()).await {
                Err(e) if e.is_transient() => {
                    debug!(client = %self.inner.client_id, error = %e, "retrying call");
                    sleep(self.inner.config.probe_interval).await;
                }
                other => return other,
            }
        }
    }

    pub async fn open_lock(&self, path: &LockPath) -> Result<()> {
        let client = &self.inner.client_id;
        self.call(|rpc| async move { rpc.open_lock(client, path).await })
            .await
    }

    pub async fn delete_lock(&self, path: &LockPath) -> Result<()> {
        let client = &self.inner.client_id;
        self.call(|rpc| async move { rpc.delete_lock(client, path).await })
            .await?;
        self.inner.locks.lock().remove(path);
        Ok(())
    }

    pub async fn try_acquire_lock(&self, path: &LockPath, mode: LockMode) -> Result<bool> {
        let client = &self.inner.client_id;
        if self.inner.locks.lock().contains_key(path) {
            return Err(LockError::AlreadyOwned {
                client: client.clone(),
                path: path.clone(),
            }
            .into());
        }

        let acquired = self
            .call(|rpc| async move { rpc.try_acquire_lock(client, path, mode).await })
            .await?;
        if acquired {
            self.inner.locks.lock().insert(path.clone(), mode);
        }
        Ok(acquired)
    }

    pub async fn release_lock(&self, path: &LockPath) -> Result<()> {
        let client = &self.inner.client_id;
        if !self.inner.locks.lock().contains_key(path) {
            return Err(LockError::NotOwned {
                client: client.clone(),
                path: path.clone(),
            }
            .into());
        }

        self.call(|rpc| async move { rpc.release_lock(client, path).await })
            .await?;
        self.inner.locks.lock().remove(path);
        Ok(())
    }
}

async fn connect(config: &ClientConfig, http: &reqwest::Client) -> Result<RpcClient> {
    for addr in &config.servers {
        let mut rpc = RpcClient::with_http(addr.clone(), http.clone());
        let mut hops = config.servers.len();

        loop {
            match rpc.init_session(&config.client_id).await {
                Ok(response) => {
                    if response.leader_address != rpc.addr() {
                        debug!(
                            contacted = %rpc.addr(),
                            leader = %response.leader_address,
                            "master reports a different address for itself"
                        );
                    }
                    return Ok(rpc);
                }
                Err(e) => {
                    if let (Some(leader), true) = (e.redirect(), hops > 0) {
                        debug!(from = %rpc.addr(), to = leader, "redirected to master");
                        rpc = RpcClient::with_http(leader, http.clone());
                        hops -= 1;
                        continue;
                    }
                    if !matches!(e, Error::NotLeader { .. } | Error::Transport { .. })
                        && !e.is_transient()
                    {
                        return Err(e);
                    }
                    debug!(addr = %rpc.addr(), error = %e, "candidate unavailable");
                    break;
                }
            }
        }
    }
    Err(Error::NoServerAvailable)
}

async fn monitor(inner: Arc<Inner>) {
    let (tx, mut rx) = mpsc::channel::<KeepAliveResult>(1);
    let mut generation = 0u64;
    let mut in_flight = false;
    // Dropping this abandons the outstanding KeepAlive.
    let mut outstanding: Option<DropGuard> = None;
    let mut next_keep_alive = Some(Instant::now());

    loop {
        if !in_flight && next_keep_alive.is_some_and(|at| at <= Instant::now()) {
            outstanding = Some(spawn_keep_alive(&inner, generation, tx.clone()));
            in_flight = true;
            next_keep_alive = None;
        }
        let lease_deadline = inner.lease_deadline();
        let retry_at = next_keep_alive.unwrap_or(lease_deadline);

        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => return,
            Some((sent_in, result)) = rx.recv() => {
                if sent_in != generation {
                    continue;
                }
                in_flight = false;
                drop(outstanding.take());
                match result {
                    Ok(response) if response.expired => {
                        warn!(client = %inner.client_id, "master ended the session");
                        inner.expire();
                        return;
                    }
                    Ok(response) => {
                        inner.lease.lock().lease_length = response.lease_length;
                        debug!(client = %inner.client_id, lease_length = ?response.lease_length, "lease extended");
                        next_keep_alive = Some(Instant::now());
                    }
                    Err(e) if e.is_transient() => {
                        debug!(client = %inner.client_id, error = %e, "keepalive interrupted");
                        next_keep_alive = Some(Instant::now() + inner.config.probe_interval);
                    }
                    Err(e) => {
                        // Nothing more to do until the lease timer decides.
                        warn!(client = %inner.client_id, error = %e, "keepalive failed");
                    }
                }
            }
            () = sleep_until(lease_deadline) => {
                drop(outstanding.take());
                if !ride_out_jeopardy(&inner).await {
                    return;
                }
                generation += 1;
                in_flight = false;
                next_keep_alive = Some(Instant::now());
            }
            () = sleep_until(retry_at), if next_keep_alive.is_some() => {}
        }
    }
}

fn spawn_keep_alive(
    inner: &Arc<Inner>,
    generation: u64,
    tx: mpsc::Sender<KeepAliveResult>,
) -> DropGuard {
    let rpc = inner.server();
    let client = inner.client_id.clone();
    let cancel = inner.shutdown.child_token();
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = stop.cancelled() => {}
            result = rpc.keep_alive(&client, None) => {
                // Receiver is gone once the monitor has exited.
                let _ = tx.send((generation, result)).await;
            }
        }
    });
    cancel.drop_guard()
}

async fn ride_out_jeopardy(inner: &Arc<Inner>) -> bool {
    let deadline = inner.lease_deadline() + inner.config.jeopardy;
    inner
        .phase
        .send_replace(SessionPhase::Jeopardy { deadline });
    warn!(client = %inner.client_id, "lease timed out, session in jeopardy");

    let stop = inner.shutdown.child_token();
    let (found_tx, found_rx) = oneshot::channel();
    tokio::spawn(find_master(Arc::clone(inner), stop.clone(), found_tx));

    let found = tokio::select! {
        biased;
        () = inner.shutdown.cancelled() => None,
        found = found_rx => found.ok(),
        () = sleep_until(deadline) => None,
    };
    stop.cancel();

    match found {
        Some((rpc, response, sent_at)) if !response.expired => {
            info!(client = %inner.client_id, server = %rpc.addr(), "session recovered from jeopardy");
            *inner.lease.lock() = Lease {
                start_time: sent_at,
                lease_length: response.lease_length,
            };
            *inner.server.write() = rpc;
            inner.phase.send_replace(SessionPhase::Active);
            true
        }
        Some((rpc, ..)) => {
            warn!(client = %inner.client_id, server = %rpc.addr(), "master could not restore the session");
            inner.expire();
            false
        }
        None => {
            if !inner.shutdown.is_cancelled() {
                warn!(client = %inner.client_id, "jeopardy ran out, session expired");
            }
            inner.expire();
            false
        }
    }
}

async fn find_master(
    inner: Arc<Inner>,
    stop: CancellationToken,
    found: oneshot::Sender<(RpcClient, KeepAliveResponse, Instant)>,
) {
    loop {
        for addr in &inner.candidates {
            let rpc = RpcClient::with_http(addr.clone(), inner.http.clone());
            let sent_at = Instant::now();
            let attempt = tokio::select! {
                () = stop.cancelled() => return,
                attempt = rpc.keep_alive(&inner.client_id, Some(inner.held_locks())) => attempt,
            };
            match attempt {
                Ok(response) => {
                    // Receiver is gone if the grace period ended meanwhile.
                    let _ = found.send((rpc, response, sent_at));
                    return;
                }
                Err(e) => debug!(client = %inner.client_id, %addr, error = %e, "candidate did not take the session"),
            }
        }
        tokio::select! {
            () = stop.cancelled() => return,
            () = sleep(inner.config.probe_interval) => {}
        }
    }
}
