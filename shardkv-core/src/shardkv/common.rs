//! Storage group RPC arguments and replicated commands

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{ClientId, Config, SeqId, Session, ShardId};

/// Sessions as stored by a group; the reply is the value the client got
pub type Sessions = HashMap<ClientId, Session<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutAppendOp {
    Put,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: ClientId,
    pub seq: SeqId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub client_id: ClientId,
    pub seq: SeqId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullShardArgs {
    pub shard: ShardId,
    /// Config under which the caller expects to own the shard
    pub config_num: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullShardReply {
    pub data: HashMap<String, String>,
    pub sessions: Sessions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGcArgs {
    pub shard: ShardId,
    pub config_num: u64,
}

/// Commands replicated through a group's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupCommand {
    Get(GetArgs),
    PutAppend(PutAppendArgs),
    /// Advance to the next controller config
    ConfigChange(Config),
    /// Data pulled from the previous owner of `shard`
    InstallShard {
        shard: ShardId,
        config_num: u64,
        data: HashMap<String, String>,
        sessions: Sessions,
    },
    /// Release a handed-off shard, or confirm an installed one
    GcShard { shard: ShardId, config_num: u64 },
}

impl GroupCommand {
    pub fn command_type(&self) -> &'static str {
        match self {
            GroupCommand::Get(_) => "get",
            GroupCommand::PutAppend(PutAppendArgs { op: PutAppendOp::Put, .. }) => "put",
            GroupCommand::PutAppend(PutAppendArgs { op: PutAppendOp::Append, .. }) => "append",
            GroupCommand::ConfigChange(_) => "config_change",
            GroupCommand::InstallShard { .. } => "install_shard",
            GroupCommand::GcShard { .. } => "gc_shard",
        }
    }
}
