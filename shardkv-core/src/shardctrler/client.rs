//! Controller clerk

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::common::{JoinArgs, LeaveArgs, MoveArgs, QueryArgs};
use crate::error::{KvError, RpcError};
use crate::transport::{CtrlerService, LocalNetwork};
use crate::types::{ClientId, Config, GroupId, SeqId, ShardId};

pub struct CtrlerClerk {
    network: Arc<LocalNetwork>,
    servers: Vec<String>,
    leader: usize,
    client_id: ClientId,
    seq: SeqId,
    retry_delay: Duration,
}

impl CtrlerClerk {
    pub fn new(network: Arc<LocalNetwork>, servers: Vec<String>, retry_delay: Duration) -> Self {
        Self {
            network,
            servers,
            leader: 0,
            client_id: rand::random(),
            seq: 0,
            retry_delay,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Config `num`, or the latest one for `None`
    pub async fn query(&mut self, num: Option<u64>) -> Config {
        let args = QueryArgs { num };
        // Queries never fail definitively.
        loop {
            if let Ok(config) = self
                .call(|s| async move { s.query(args).await })
                .await
            {
                return config;
            }
        }
    }

    pub async fn join(&mut self, servers: BTreeMap<GroupId, Vec<String>>) -> Result<(), KvError> {
        let args = JoinArgs {
            servers,
            client_id: self.client_id,
            seq: self.seq + 1,
        };
        let result = self
            .call(|s| {
                let args = args.clone();
                async move { s.join(args).await }
            })
            .await;
        self.seq += 1;
        result
    }

    pub async fn leave(&mut self, gids: Vec<GroupId>) -> Result<(), KvError> {
        let args = LeaveArgs {
            gids,
            client_id: self.client_id,
            seq: self.seq + 1,
        };
        let result = self
            .call(|s| {
                let args = args.clone();
                async move { s.leave(args).await }
            })
            .await;
        self.seq += 1;
        result
    }

    /// Rejected with `WrongGroup` if `gid` is not in the latest config or
    /// `shard` is out of range
    pub async fn move_shard(&mut self, shard: ShardId, gid: GroupId) -> Result<(), KvError> {
        let args = MoveArgs {
            shard,
            gid,
            client_id: self.client_id,
            seq: self.seq + 1,
        };
        let result = self
            .call(|s| {
                let args = args.clone();
                async move { s.move_shard(args).await }
            })
            .await;
        self.seq += 1;
        result
    }

    /// Try servers starting at the last known leader until one gives a
    /// definitive answer
    async fn call<T, F, Fut>(&mut self, call: F) -> Result<T, KvError>
    where
        F: Fn(Arc<dyn CtrlerService>) -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        loop {
            for offset in 0..self.servers.len() {
                let i = (self.leader + offset) % self.servers.len();
                match self.network.call_ctrler(&self.servers[i], &call).await {
                    Ok(reply) => {
                        self.leader = i;
                        return Ok(reply);
                    }
                    Err(e) if e.try_next_server() => {
                        debug!(server = %self.servers[i], error = %e, "trying next controller");
                    }
                    Err(RpcError::Reply(e)) => {
                        self.leader = i;
                        return Err(e);
                    }
                    Err(RpcError::Unreachable { .. }) => {}
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}
