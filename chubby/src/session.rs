// Server-side sessions: lease clock, KeepAlive rendezvous, teardown.

use crate::{
    config::LeaseConfig,
    lock::LockManager,
    message::KeepAliveResponse,
    ClientId, Error, LockError, LockMode, LockPath, Result,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct SessionState {
    start_time: Instant,
    lease_length: Duration,
    locks: BTreeMap<LockPath, LockMode>,
    terminated: bool,
    // Ticket of the newest parked KeepAlive; only it may take the extension.
    newest_waiter: u64,
    renewal_pending: bool,
}

impl SessionState {
    fn deadline(&self) -> Instant {
        self.start_time + self.lease_length
    }
}

// Lock operations and termination both run under `state`, so teardown sees
// a stable lock set and nothing is added to a session being drained.
#[derive(Debug)]
pub struct Session {
    client_id: ClientId,
    config: LeaseConfig,
    state: Mutex<SessionState>,
    renewal: Notify,
    lease_changed: Notify,
    terminated: CancellationToken,
    locks: Arc<LockManager>,
}

impl Session {
    fn new(client_id: ClientId, config: LeaseConfig, locks: Arc<LockManager>) -> Self {
        Self {
            client_id,
            config,
            state: Mutex::new(SessionState {
                start_time: Instant::now(),
                lease_length: config.lease_length,
                locks: BTreeMap::new(),
                terminated: false,
                newest_waiter: 0,
                renewal_pending: false,
            }),
            renewal: Notify::new(),
            lease_changed: Notify::new(),
            terminated: CancellationToken::new(),
            locks,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    pub async fn lease_length(&self) -> Duration {
        self.state.lock().await.lease_length
    }

    pub async fn deadline(&self) -> Instant {
        self.state.lock().await.deadline()
    }

    pub async fn held_locks(&self) -> BTreeMap<LockPath, LockMode> {
        self.state.lock().await.locks.clone()
    }

    // Sleeps toward `deadline - expiry_warning`, at most `monitor_tick` at a
    // time, and starts over whenever the lease moves.
    async fn monitor(self: Arc<Self>) {
        debug!(client = %self.client_id, "monitoring session");
        let mut signaled_for: Option<Instant> = None;

        loop {
            let deadline = self.deadline().await;
            let target = if signaled_for == Some(deadline) {
                deadline
            } else {
                deadline
                    .checked_sub(self.config.expiry_warning)
                    .unwrap_or(deadline)
            };
            let wake_at = target.min(Instant::now() + self.config.monitor_tick);

            tokio::select! {
                () = self.terminated.cancelled() => return,
                () = self.lease_changed.notified() => continue,
                () = tokio::time::sleep_until(wake_at) => {}
            }

            let deadline = self.deadline().await;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!(client = %self.client_id, "lease expired, terminating session");
                self.terminate().await;
                return;
            }
            if remaining <= self.config.expiry_warning && signaled_for != Some(deadline) {
                signaled_for = Some(deadline);
                self.signal_renewal().await;
            }
        }
    }

    async fn signal_renewal(&self) {
        let mut state = self.state.lock().await;
        state.renewal_pending = true;
        self.renewal.notify_waiters();
    }

    // Only the most recent caller is extended. An older call still parked
    // returns the current lease unchanged as soon as a newer one arrives.
    pub async fn keep_alive(&self) -> KeepAliveResponse {
        let ticket = {
            let mut state = self.state.lock().await;
            state.newest_waiter += 1;
            state.newest_waiter
        };
        self.renewal.notify_waiters();

        loop {
            let notified = self.renewal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.terminated {
                    break;
                }
                if state.newest_waiter != ticket {
                    debug!(client = %self.client_id, ticket, "keep-alive superseded");
                    return KeepAliveResponse {
                        lease_length: state.lease_length,
                        expired: false,
                    };
                }
                if state.renewal_pending {
                    state.renewal_pending = false;
                    state.lease_length += self.config.lease_extension;
                    self.lease_changed.notify_one();
                    info!(
                        client = %self.client_id,
                        lease_length = ?state.lease_length,
                        "session extended"
                    );
                    return KeepAliveResponse {
                        lease_length: state.lease_length,
                        expired: false,
                    };
                }
            }

            tokio::select! {
                biased;
                () = self.terminated.cancelled() => break,
                () = &mut notified => {}
            }
        }
        KeepAliveResponse {
            lease_length: self.lease_length().await,
            expired: true,
        }
    }

    pub async fn refresh(&self) -> Result<Duration> {
        let mut state = self.live_state().await?;
        state.start_time = Instant::now();
        state.lease_length = self.config.lease_length;
        state.renewal_pending = false;
        self.lease_changed.notify_one();
        info!(client = %self.client_id, "session lease refreshed");
        Ok(state.lease_length)
    }

    async fn live_state(&self) -> Result<tokio::sync::MutexGuard<'_, SessionState>> {
        let state = self.state.lock().await;
        if state.terminated {
            return Err(Error::SessionExpired {
                client: self.client_id.clone(),
            });
        }
        Ok(state)
    }

    pub async fn open_lock(&self, path: &LockPath) -> Result<()> {
        let _state = self.live_state().await?;
        self.locks.open_lock(path).await
    }

    pub async fn try_acquire_lock(&self, path: &LockPath, mode: LockMode) -> Result<bool> {
        let mut state = self.live_state().await?;
        if state.locks.contains_key(path) {
            return Err(LockError::AlreadyOwned {
                client: self.client_id.clone(),
                path: path.clone(),
            }
            .into());
        }
        let acquired = self
            .locks
            .try_acquire_lock(&self.client_id, path, mode)
            .await?;
        if acquired {
            state.locks.insert(path.clone(), mode);
        }
        Ok(acquired)
    }

    pub async fn release_lock(&self, path: &LockPath) -> Result<()> {
        let mut state = self.live_state().await?;
        if !state.locks.contains_key(path) {
            return Err(LockError::NotOwned {
                client: self.client_id.clone(),
                path: path.clone(),
            }
            .into());
        }
        self.locks.release_lock(&self.client_id, path).await?;
        state.locks.remove(path);
        Ok(())
    }

    pub async fn delete_lock(&self, path: &LockPath) -> Result<()> {
        let mut state = self.live_state().await?;
        self.locks.delete_lock(&self.client_id, path).await?;
        state.locks.remove(path);
        Ok(())
    }

    pub async fn terminate(&self) {
        let mut state = self.state.lock().await;
        if state.terminated {
            return;
        }
        state.terminated = true;
        self.terminated.cancel();

        for path in std::mem::take(&mut state.locks).into_keys() {
            if let Err(e) = self.locks.release_lock(&self.client_id, &path).await {
                warn!(client = %self.client_id, %path, error = %e, "failed to release lock during teardown");
            }
        }
        info!(client = %self.client_id, "terminated session");
    }
}

#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<ClientId, Arc<Session>>,
    locks: Arc<LockManager>,
    config: LeaseConfig,
}

impl SessionManager {
    pub fn new(locks: Arc<LockManager>, config: LeaseConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            locks,
            config,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn create_session(&self, client: &ClientId) -> Result<Arc<Session>> {
        let session = match self.sessions.entry(client.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_terminated() {
                    return Err(Error::SessionExists {
                        client: client.clone(),
                    });
                }
                let session = self.new_session(client);
                entry.insert(Arc::clone(&session));
                session
            }
            Entry::Vacant(entry) => {
                let session = self.new_session(client);
                entry.insert(Arc::clone(&session));
                session
            }
        };

        info!(%client, "created session");
        tokio::spawn(Arc::clone(&session).monitor());
        Ok(session)
    }

    fn new_session(&self, client: &ClientId) -> Arc<Session> {
        Arc::new(Session::new(
            client.clone(),
            self.config,
            Arc::clone(&self.locks),
        ))
    }

    pub fn session(&self, client: &ClientId) -> Option<Arc<Session>> {
        self.sessions.get(client).map(|entry| Arc::clone(entry.value()))
    }

    pub fn live_session(&self, client: &ClientId) -> Result<Arc<Session>> {
        match self.session(client) {
            Some(session) if !session.is_terminated() => Ok(session),
            Some(_) => Err(Error::SessionExpired {
                client: client.clone(),
            }),
            None => Err(Error::SessionNotFound {
                client: client.clone(),
            }),
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().is_terminated())
            .count()
    }

    pub async fn terminate_session(&self, client: &ClientId) -> Result<()> {
        let session = self.session(client).ok_or_else(|| Error::SessionNotFound {
            client: client.clone(),
        })?;
        session.terminate().await;
        Ok(())
    }

    // * known session, plain request: block until renewal or termination;
    // * jeopardy request, live session: restart its lease immediately;
    // * jeopardy request, no live session: new session plus lock recovery;
    // * plain request, unknown client: new session, then block as usual.
    pub async fn keep_alive(
        &self,
        client: &ClientId,
        claimed: Option<BTreeMap<LockPath, LockMode>>,
    ) -> Result<KeepAliveResponse> {
        let existing = self.session(client);
        match (existing, claimed) {
            (Some(session), None) => self.renew(&session).await,
            (Some(session), Some(_)) if !session.is_terminated() => Ok(KeepAliveResponse {
                lease_length: session.refresh().await?,
                expired: false,
            }),
            (_, Some(claimed)) => self.recover_session(client, &claimed).await,
            (None, None) => {
                let session = self.create_session(client)?;
                self.renew(&session).await
            }
        }
    }

    async fn renew(&self, session: &Session) -> Result<KeepAliveResponse> {
        let response = session.keep_alive().await;
        // Leadership may have moved while this call was parked.
        if !response.expired && !self.locks.store().is_leader() {
            return Err(Error::NotLeader {
                leader: self.locks.store().leader(),
            });
        }
        Ok(response)
    }

    // Rebuild a session the client had with a previous master, taking its
    // locks back in path order. Any lock that cannot be retaken ends the
    // new session; that is reported as `expired`, not as an error.
    async fn recover_session(
        &self,
        client: &ClientId,
        claimed: &BTreeMap<LockPath, LockMode>,
    ) -> Result<KeepAliveResponse> {
        let session = self.create_session(client)?;

        for (path, mode) in claimed {
            let outcome = session.try_acquire_lock(path, *mode).await;
            let failure = match outcome {
                Ok(true) => continue,
                Ok(false) => format!("held incompatibly by another client ({mode} requested)"),
                Err(e) => e.to_string(),
            };
            warn!(%client, %path, reason = %failure, "jeopardy recovery failed, ending session");
            session.terminate().await;
            return Ok(KeepAliveResponse {
                lease_length: session.lease_length().await,
                expired: true,
            });
        }

        info!(%client, locks = claimed.len(), "recovered session after failover");
        Ok(KeepAliveResponse {
            lease_length: session.lease_length().await,
            expired: false,
        })
    }
}
