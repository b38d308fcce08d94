//! Sharded, replicated key/value store
//!
//! A replicated shard controller assigns `NSHARDS` shards to replica groups.
//! Every group replicates its commands through its own log, moves shards
//! between configs by pulling them from the previous owner, and keeps
//! client requests exactly-once across leader changes and migrations.

pub mod applier;
pub mod cluster;
pub mod common;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod raft;
pub mod settings;
pub mod shardctrler;
pub mod shardkv;
pub mod transport;
pub mod types;

pub use cluster::LocalCluster;
pub use error::{KvError, RpcError, ShardKvError, ShardKvResult};
pub use settings::{LogBackend, Settings, SettingsBuilder};
pub use types::{key2shard, Config, GroupId, ShardId, ShardStatus, NSHARDS};
