//! Controller RPC arguments and replicated commands

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ClientId, GroupId, SeqId, ShardId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinArgs {
    /// New groups and their replica endpoints
    pub servers: BTreeMap<GroupId, Vec<String>>,
    pub client_id: ClientId,
    pub seq: SeqId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveArgs {
    pub gids: Vec<GroupId>,
    pub client_id: ClientId,
    pub seq: SeqId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveArgs {
    pub shard: ShardId,
    pub gid: GroupId,
    pub client_id: ClientId,
    pub seq: SeqId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryArgs {
    /// Config number to fetch; `None` (or a number past the history) means latest
    pub num: Option<u64>,
}

/// Commands replicated through the controller's log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlerOp {
    Join(JoinArgs),
    Leave(LeaveArgs),
    Move(MoveArgs),
    Query(QueryArgs),
}

impl CtrlerOp {
    pub fn op_type(&self) -> &'static str {
        match self {
            CtrlerOp::Join(_) => "join",
            CtrlerOp::Leave(_) => "leave",
            CtrlerOp::Move(_) => "move",
            CtrlerOp::Query(_) => "query",
        }
    }

    /// Client session of a mutating command
    pub fn session(&self) -> Option<(ClientId, SeqId)> {
        match self {
            CtrlerOp::Join(a) => Some((a.client_id, a.seq)),
            CtrlerOp::Leave(a) => Some((a.client_id, a.seq)),
            CtrlerOp::Move(a) => Some((a.client_id, a.seq)),
            CtrlerOp::Query(_) => None,
        }
    }
}
