use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Infrastructure failures inside a replica: encoding, the replicated log,
/// configuration loading and task plumbing.
#[derive(Error, Debug)]
pub enum ShardKvError {
    #[error("Raft error: {0}")]
    RaftError(#[from] raft::Error),

    #[error("Raft operation '{operation}' failed")]
    Raft {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel closed: {component}")]
    ChannelClosed { component: String },

    #[error("Replica not found: {name}")]
    ReplicaNotFound { name: String },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type ShardKvResult<T> = std::result::Result<T, ShardKvError>;

/// Error codes carried on the wire between clerks, groups and the controller.
///
/// `OK` is `Result::Ok`; every other code is a variant here.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KvError {
    #[error("ErrWrongLeader")]
    WrongLeader,

    #[error("ErrWrongGroup")]
    WrongGroup,

    #[error("ErrWrongConfig")]
    WrongConfig,

    #[error("ErrShardNotReady")]
    ShardNotReady,

    #[error("ErrTimeout")]
    Timeout,

    /// Never produced for `Get`, which answers missing keys with an empty value.
    #[error("ErrNoKey")]
    NoKey,
}

impl KvError {
    /// Leadership errors: no state changed, retry against another replica.
    pub fn is_leadership(&self) -> bool {
        matches!(self, KvError::WrongLeader)
    }

    /// Staleness errors: the caller must refresh its config view and re-route.
    pub fn is_stale(&self) -> bool {
        matches!(self, KvError::WrongGroup | KvError::WrongConfig)
    }

    /// Availability errors: retry after a short delay.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, KvError::ShardNotReady | KvError::Timeout)
    }
}

/// Outcome of a call over the in-process network
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The request or its reply was lost
    #[error("endpoint unreachable: {endpoint}")]
    Unreachable { endpoint: String },

    /// The server answered with an error code
    #[error(transparent)]
    Reply(#[from] KvError),
}

impl RpcError {
    /// Whether the caller should move on to another replica of the same cluster
    pub fn try_next_server(&self) -> bool {
        match self {
            RpcError::Unreachable { .. } => true,
            RpcError::Reply(e) => matches!(e, KvError::WrongLeader | KvError::Timeout),
        }
    }
}
