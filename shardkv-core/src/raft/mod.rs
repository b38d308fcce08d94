//! Replicated log layer
//!
//! Each replicated participant (the controller and every storage group) sits
//! on top of a [`ReplicatedLog`]: commands go in through `propose`, and every
//! committed entry comes back, in index order, on the participant's apply
//! channel. Two implementations are provided:
//!
//! - `memory` - deterministic in-process log with explicit leader control
//! - `core` - raft-rs nodes driven by a tick loop
//!
//! The raft-rs nodes keep their entries in `storage`, which also holds the
//! latest application snapshot, and exchange messages through `router`.

pub mod core;
pub mod memory;
pub mod router;
pub mod storage;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ShardKvResult;

pub use self::core::{RaftLog, RaftManager};
pub use self::memory::{MemoryLog, MemoryLogCluster};
pub use self::router::RaftRouter;

/// Where a proposed command landed in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

/// Entries delivered to the applier, strictly in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed command
    Command { index: u64, term: u64, data: Vec<u8> },
    /// State-machine snapshot covering every entry up to `index`
    Snapshot { index: u64, term: u64, data: Vec<u8> },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}

pub type ApplySender = mpsc::UnboundedSender<ApplyMsg>;
pub type ApplyReceiver = mpsc::UnboundedReceiver<ApplyMsg>;

/// Contract between a replicated participant and its consensus layer
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Append `data` if this replica leads; `None` when it does not
    async fn propose(&self, data: Vec<u8>) -> ShardKvResult<Option<Proposal>>;

    /// Whether this replica currently believes it is the leader
    async fn is_leader(&self) -> bool;

    /// Entries retained since the last snapshot
    fn log_size(&self) -> u64;

    /// Hand over a snapshot of the state after applying `index`; the log may
    /// discard every entry up to and including `index`
    async fn snapshot(&self, index: u64, data: Vec<u8>) -> ShardKvResult<()>;
}

// Internal utilities shared across modules
pub(crate) mod utils {
    use slog::{o, Drain, Logger};

    /// Create a Raft logger with consistent formatting
    pub fn create_raft_logger(name: &str, node_id: u64) -> Logger {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        let drain = slog::LevelFilter::new(drain, slog::Level::Warning).fuse();
        slog::Logger::root(
            drain,
            o!("participant" => name.to_string(), "node_id" => node_id, "module" => "raft"),
        )
    }
}
