use crate::{ClientId, LockMode, LockPath};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockError {
    #[error("lock at {path} has not been opened")]
    NotOpened { path: LockPath },

    #[error("client {client} already owns the lock at {path}")]
    AlreadyOwned { client: ClientId, path: LockPath },

    #[error("client {client} does not own the lock at {path}")]
    NotOwned { client: ClientId, path: LockPath },

    #[error("client {client} does not hold the lock at {path} in EXCLUSIVE mode")]
    NotExclusive { client: ClientId, path: LockPath },

    #[error("invalid lock mode {mode}: only EXCLUSIVE or SHARED can be requested")]
    InvalidMode { mode: LockMode },

    #[error("lock table invariant violated at {path}: {detail}")]
    Invariant { path: LockPath, detail: String },
}

impl LockError {
    pub fn is_precondition(&self) -> bool {
        !matches!(self, LockError::Invariant { .. })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("client {client} already has a session established with the master")]
    SessionExists { client: ClientId },

    #[error("no session for client {client}")]
    SessionNotFound { client: ClientId },

    #[error("session for client {client} expired")]
    SessionExpired { client: ClientId },

    #[error("could not connect to any server")]
    NoServerAvailable,

    #[error("connection to {addr} closed before the reply was read")]
    ConnectionClosed { addr: String },

    #[error("transport error talking to {addr}: {message}")]
    Transport { addr: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("server error: {0}")]
    Remote(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn redirect(&self) -> Option<&str> {
        match self {
            Error::NotLeader { leader } => leader.as_deref(),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ConnectionClosed { .. })
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            Error::SessionExpired { .. } | Error::SessionNotFound { .. }
        )
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Lock(e) if e.is_precondition())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// Transport and local failures collapse into `Internal`; the classes a
// client has to act on (redirect, precondition, expiry) keep their shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    NotLeader { leader: Option<String> },
    Lock(LockError),
    SessionExists { client: ClientId },
    SessionNotFound { client: ClientId },
    SessionExpired { client: ClientId },
    Internal { message: String },
}

impl From<&Error> for Fault {
    fn from(err: &Error) -> Self {
        match err {
            Error::NotLeader { leader } => Fault::NotLeader {
                leader: leader.clone(),
            },
            Error::Lock(e) => Fault::Lock(e.clone()),
            Error::SessionExists { client } => Fault::SessionExists {
                client: client.clone(),
            },
            Error::SessionNotFound { client } => Fault::SessionNotFound {
                client: client.clone(),
            },
            Error::SessionExpired { client } => Fault::SessionExpired {
                client: client.clone(),
            },
            other => Fault::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        Fault::from(&err)
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::NotLeader { leader } => Error::NotLeader { leader },
            Fault::Lock(e) => Error::Lock(e),
            Fault::SessionExists { client } => Error::SessionExists { client },
            Fault::SessionNotFound { client } => Error::SessionNotFound { client },
            Fault::SessionExpired { client } => Error::SessionExpired { client },
            Fault::Internal { message } => Error::Remote(message),
        }
    }
}
