//! RPC surface of the controller and the storage groups
//!
//! Servers implement [`CtrlerService`] or [`GroupService`]; callers reach them
//! by endpoint name through a [`LocalNetwork`].

pub mod local;

use async_trait::async_trait;

use crate::error::KvError;
use crate::shardctrler::common::{JoinArgs, LeaveArgs, MoveArgs, QueryArgs};
use crate::shardkv::common::{GetArgs, PullShardArgs, PullShardReply, PutAppendArgs, ShardGcArgs};
use crate::types::Config;

pub use local::LocalNetwork;

/// Shard controller RPCs
#[async_trait]
pub trait CtrlerService: Send + Sync {
    async fn query(&self, args: QueryArgs) -> Result<Config, KvError>;

    async fn join(&self, args: JoinArgs) -> Result<(), KvError>;

    async fn leave(&self, args: LeaveArgs) -> Result<(), KvError>;

    async fn move_shard(&self, args: MoveArgs) -> Result<(), KvError>;
}

/// Storage group RPCs, client-facing and inter-group
#[async_trait]
pub trait GroupService: Send + Sync {
    /// A missing key reads as the empty string
    async fn get(&self, args: GetArgs) -> Result<String, KvError>;

    async fn put_append(&self, args: PutAppendArgs) -> Result<(), KvError>;

    /// Copy of a shard's data and the session table, for its next owner
    async fn pull_shard(&self, args: PullShardArgs) -> Result<PullShardReply, KvError>;

    /// The next owner installed the shard; the caller may release it
    async fn shard_gc(&self, args: ShardGcArgs) -> Result<(), KvError>;
}
