use crate::{
    message::{
        self, DeleteLockRequest, EmptyResponse, InitSessionRequest, InitSessionResponse,
        JoinRequest, KeepAliveRequest, KeepAliveResponse, OpenLockRequest, ReleaseLockRequest,
        Reply, ServerStatus, TryAcquireLockRequest, TryAcquireLockResponse,
    },
    ClientId, Error, LockMode, LockPath, NodeId, Result,
};
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
    http: Client,
}

impl RpcClient {
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_http(addr, Client::new())
    }

    #[must_use]
    pub fn with_http(addr: impl Into<String>, http: Client) -> Self {
        Self {
            addr: addr.into(),
            http,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn url(&self, route: &str) -> String {
        format!("http://{}{}", self.addr, route)
    }

    fn classify(&self, err: &reqwest::Error) -> Error {
        if is_connection_closed(err) {
            Error::ConnectionClosed {
                addr: self.addr.clone(),
            }
        } else {
            Error::Transport {
                addr: self.addr.clone(),
                message: err.to_string(),
            }
        }
    }

    async fn call<Req, Resp>(&self, route: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        trace!(addr = %self.addr, route, "rpc");
        let response = self
            .http
            .post(self.url(route))
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport {
                addr: self.addr.clone(),
                message: format!("{status}: {body}"),
            });
        }

        let reply: Reply<Resp> = response.json().await.map_err(|e| self.classify(&e))?;
        reply.map_err(Error::from)
    }

    pub async fn init_session(&self, client_id: &ClientId) -> Result<InitSessionResponse> {
        let request = InitSessionRequest {
            client_id: client_id.clone(),
        };
        self.call(message::INIT_SESSION, &request).await
    }

    pub async fn keep_alive(
        &self,
        client_id: &ClientId,
        locks: Option<BTreeMap<LockPath, LockMode>>,
    ) -> Result<KeepAliveResponse> {
        let request = KeepAliveRequest {
            client_id: client_id.clone(),
            locks,
        };
        self.call(message::KEEP_ALIVE, &request).await
    }

    pub async fn open_lock(&self, client_id: &ClientId, path: &LockPath) -> Result<()> {
        let request = OpenLockRequest {
            client_id: client_id.clone(),
            path: path.clone(),
        };
        self.call::<_, EmptyResponse>(message::OPEN_LOCK, &request)
            .await
            .map(drop)
    }

    pub async fn delete_lock(&self, client_id: &ClientId, path: &LockPath) -> Result<()> {
        let request = DeleteLockRequest {
            client_id: client_id.clone(),
            path: path.clone(),
        };
        self.call::<_, EmptyResponse>(message::DELETE_LOCK, &request)
            .await
            .map(drop)
    }

    pub async fn try_acquire_lock(
        &self,
        client_id: &ClientId,
        path: &LockPath,
        mode: LockMode,
    ) -> Result<bool> {
        let request = TryAcquireLockRequest {
            client_id: client_id.clone(),
            path: path.clone(),
            mode,
        };
        let response: TryAcquireLockResponse =
            self.call(message::TRY_ACQUIRE_LOCK, &request).await?;
        Ok(response.is_successful)
    }

    pub async fn release_lock(&self, client_id: &ClientId, path: &LockPath) -> Result<()> {
        let request = ReleaseLockRequest {
            client_id: client_id.clone(),
            path: path.clone(),
        };
        self.call::<_, EmptyResponse>(message::RELEASE_LOCK, &request)
            .await
            .map(drop)
    }

    pub async fn join(&self, node_id: &NodeId, raft_addr: &str) -> Result<()> {
        let request = JoinRequest {
            node_id: node_id.clone(),
            raft_addr: raft_addr.to_string(),
        };
        self.call::<_, EmptyResponse>(message::JOIN, &request)
            .await
            .map(drop)
    }

    pub async fn status(&self) -> Result<ServerStatus> {
        let response = self
            .http
            .get(self.url(message::STATUS))
            .send()
            .await
            .map_err(|e| self.classify(&e))?;
        response.json().await.map_err(|e| self.classify(&e))
    }
}

// The peer hung up before a complete reply arrived.
fn is_connection_closed(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() {
                return true;
            }
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        source = e.source();
    }
    false
}
