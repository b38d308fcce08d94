//! Key/value clerk
//!
//! Routes each request to the group owning the key's shard under the
//! clerk's cached config, and re-queries the controller when a group says
//! the shard is not (or not yet) its own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::common::{GetArgs, PutAppendArgs, PutAppendOp};
use crate::error::{KvError, RpcError};
use crate::shardctrler::CtrlerClerk;
use crate::transport::{GroupService, LocalNetwork};
use crate::types::{key2shard, ClientId, Config, GroupId, SeqId};

pub struct Clerk {
    network: Arc<LocalNetwork>,
    ctrler: CtrlerClerk,
    config: Config,
    /// Last replica that answered, per group
    leaders: HashMap<GroupId, usize>,
    client_id: ClientId,
    seq: SeqId,
    retry_delay: Duration,
}

impl Clerk {
    pub fn new(network: Arc<LocalNetwork>, ctrler_servers: Vec<String>, retry_delay: Duration) -> Self {
        Self {
            ctrler: CtrlerClerk::new(Arc::clone(&network), ctrler_servers, retry_delay),
            network,
            config: Config::default(),
            leaders: HashMap::new(),
            client_id: rand::random(),
            seq: 0,
            retry_delay,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Current value of `key`; empty if it was never written
    pub async fn get(&mut self, key: &str) -> String {
        let args = GetArgs {
            key: key.to_string(),
            client_id: self.client_id,
            seq: self.seq,
        };
        self.request(key, |s| {
            let args = args.clone();
            async move { s.get(args).await }
        })
        .await
    }

    pub async fn put(&mut self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Put).await
    }

    pub async fn append(&mut self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Append).await
    }

    async fn put_append(&mut self, key: &str, value: &str, op: PutAppendOp) {
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            op,
            client_id: self.client_id,
            seq: self.seq + 1,
        };
        self.request(key, |s| {
            let args = args.clone();
            async move { s.put_append(args).await }
        })
        .await;
        self.seq += 1;
    }

    async fn request<T, F, Fut>(&mut self, key: &str, call: F) -> T
    where
        F: Fn(Arc<dyn GroupService>) -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        let shard = key2shard(key);
        loop {
            let gid = self.config.owner(shard);
            let servers = self.config.servers(gid).map(<[String]>::to_vec).unwrap_or_default();
            let start = self.leaders.get(&gid).copied().unwrap_or(0);

            for offset in 0..servers.len() {
                let i = (start + offset) % servers.len();
                match self.network.call_group(&servers[i], &call).await {
                    Ok(reply) => {
                        self.leaders.insert(gid, i);
                        return reply;
                    }
                    Err(e) if e.try_next_server() => continue,
                    Err(RpcError::Reply(KvError::ShardNotReady)) => {
                        // Migration in progress; come back to this replica.
                        self.leaders.insert(gid, i);
                        break;
                    }
                    Err(e) => {
                        debug!(gid, shard, error = %e, "refreshing config");
                        break;
                    }
                }
            }

            tokio::time::sleep(self.retry_delay).await;
            self.config = self.ctrler.query(None).await;
        }
    }
}
