use crate::{
    config::LeaseConfig,
    error::Fault,
    lock::LockManager,
    message::{
        self, DeleteLockRequest, EmptyResponse, InitSessionRequest, InitSessionResponse,
        JoinRequest, KeepAliveRequest, KeepAliveResponse, OpenLockRequest, ReleaseLockRequest,
        Reply, ServerStatus, TryAcquireLockRequest, TryAcquireLockResponse,
    },
    session::SessionManager,
    storage::ReplicatedStore,
    Error, NodeId, Result,
};
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ServerState {
    pub node_id: NodeId,
    pub listen: String,
    pub store: Arc<dyn ReplicatedStore>,
    pub sessions: Arc<SessionManager>,
    pub started_at: DateTime<Utc>,
    start_time: Instant,
}

impl ServerState {
    pub fn new(
        node_id: NodeId,
        listen: impl Into<String>,
        store: Arc<dyn ReplicatedStore>,
        lease: LeaseConfig,
    ) -> Self {
        let locks = Arc::new(LockManager::new(Arc::clone(&store)));
        Self {
            node_id,
            listen: listen.into(),
            store,
            sessions: Arc::new(SessionManager::new(locks, lease)),
            started_at: Utc::now(),
            start_time: Instant::now(),
        }
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.store.is_leader() {
            Ok(())
        } else {
            Err(Error::NotLeader {
                leader: self.store.leader(),
            })
        }
    }

    pub async fn init_session(&self, request: InitSessionRequest) -> Result<InitSessionResponse> {
        self.ensure_leader()?;
        self.sessions.create_session(&request.client_id)?;
        Ok(InitSessionResponse {
            leader_address: self.listen.clone(),
        })
    }

    pub async fn keep_alive(&self, request: KeepAliveRequest) -> Result<KeepAliveResponse> {
        self.ensure_leader()?;
        self.sessions
            .keep_alive(&request.client_id, request.locks)
            .await
    }

    pub async fn open_lock(&self, request: OpenLockRequest) -> Result<EmptyResponse> {
        self.ensure_leader()?;
        let session = self.sessions.live_session(&request.client_id)?;
        session.open_lock(&request.path).await?;
        Ok(EmptyResponse {})
    }

    pub async fn delete_lock(&self, request: DeleteLockRequest) -> Result<EmptyResponse> {
        self.ensure_leader()?;
        let session = self.sessions.live_session(&request.client_id)?;
        session.delete_lock(&request.path).await?;
        Ok(EmptyResponse {})
    }

    pub async fn try_acquire_lock(
        &self,
        request: TryAcquireLockRequest,
    ) -> Result<TryAcquireLockResponse> {
        self.ensure_leader()?;
        let session = self.sessions.live_session(&request.client_id)?;
        let is_successful = session.try_acquire_lock(&request.path, request.mode).await?;
        Ok(TryAcquireLockResponse { is_successful })
    }

    pub async fn release_lock(&self, request: ReleaseLockRequest) -> Result<EmptyResponse> {
        self.ensure_leader()?;
        let session = self.sessions.live_session(&request.client_id)?;
        session.release_lock(&request.path).await?;
        Ok(EmptyResponse {})
    }

    pub async fn join(&self, request: JoinRequest) -> Result<EmptyResponse> {
        self.store.join(&request.node_id, &request.raft_addr).await?;
        Ok(EmptyResponse {})
    }

    pub async fn status(&self) -> ServerStatus {
        ServerStatus {
            node_id: self.node_id.clone(),
            listen: self.listen.clone(),
            is_leader: self.store.is_leader(),
            leader: self.store.leader(),
            sessions: self.sessions.live_sessions(),
            locks: self.sessions.lock_manager().snapshot().await.len(),
            started_at: self.started_at,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

fn reply<T>(route: &str, result: Result<T>) -> Json<Reply<T>> {
    Json(result.map_err(|e| {
        debug!(route, error = %e, "request failed");
        Fault::from(e)
    }))
}

async fn init_session(
    State(state): State<ServerState>,
    Json(request): Json<InitSessionRequest>,
) -> Json<Reply<InitSessionResponse>> {
    reply(message::INIT_SESSION, state.init_session(request).await)
}

async fn keep_alive(
    State(state): State<ServerState>,
    Json(request): Json<KeepAliveRequest>,
) -> Json<Reply<KeepAliveResponse>> {
    reply(message::KEEP_ALIVE, state.keep_alive(request).await)
}

async fn open_lock(
    State(state): State<ServerState>,
    Json(request): Json<OpenLockRequest>,
) -> Json<Reply<EmptyResponse>> {
    reply(message::OPEN_LOCK, state.open_lock(request).await)
}

async fn delete_lock(
    State(state): State<ServerState>,
    Json(request): Json<DeleteLockRequest>,
) -> Json<Reply<EmptyResponse>> {
    reply(message::DELETE_LOCK, state.delete_lock(request).await)
}

async fn try_acquire_lock(
    State(state): State<ServerState>,
    Json(request): Json<TryAcquireLockRequest>,
) -> Json<Reply<TryAcquireLockResponse>> {
    reply(message::TRY_ACQUIRE_LOCK, state.try_acquire_lock(request).await)
}

async fn release_lock(
    State(state): State<ServerState>,
    Json(request): Json<ReleaseLockRequest>,
) -> Json<Reply<EmptyResponse>> {
    reply(message::RELEASE_LOCK, state.release_lock(request).await)
}

async fn join(
    State(state): State<ServerState>,
    Json(request): Json<JoinRequest>,
) -> Json<Reply<EmptyResponse>> {
    reply(message::JOIN, state.join(request).await)
}

async fn get_status(State(state): State<ServerState>) -> Json<ServerStatus> {
    Json(state.status().await)
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route(message::INIT_SESSION, post(init_session))
        .route(message::KEEP_ALIVE, post(keep_alive))
        .route(message::OPEN_LOCK, post(open_lock))
        .route(message::DELETE_LOCK, post(delete_lock))
        .route(message::TRY_ACQUIRE_LOCK, post(try_acquire_lock))
        .route(message::RELEASE_LOCK, post(release_lock))
        .route(message::JOIN, post(join))
        .route(message::STATUS, get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(node = %state.node_id, %addr, "serving lock service");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!(%addr, "server stopped");
    Ok(())
}
