//! Shard migration engine
//!
//! Leader-only loop. For every `Pulling` shard it fetches the data from the
//! shard's owner in the previous config and proposes `InstallShard`. For
//! every `GCing` shard it tells the previous owner to release its copy and,
//! once that is acknowledged, proposes `GcShard` to start serving normally.

use futures::future::join_all;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use super::common::{GroupCommand, PullShardArgs, ShardGcArgs};
use super::server::ShardKv;
use crate::transport::LocalNetwork;
use crate::types::{ShardId, ShardStatus};

/// One shard to move, with the replicas of the group that held it before
struct Transfer {
    shard: ShardId,
    config_num: u64,
    servers: Vec<String>,
}

pub(crate) async fn run_migration(server: Weak<ShardKv>, network: Arc<LocalNetwork>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(server) = server.upgrade() else {
            return;
        };
        if !server.is_leader().await {
            continue;
        }

        let pulls = transfers(&server, ShardStatus::Pulling);
        join_all(pulls.into_iter().map(|t| pull(&server, &network, t))).await;

        let acks = transfers(&server, ShardStatus::GCing);
        join_all(acks.into_iter().map(|t| acknowledge(&server, &network, t))).await;
    }
}

fn transfers(server: &ShardKv, status: ShardStatus) -> Vec<Transfer> {
    server.read(|s| {
        s.shards_in(status)
            .into_iter()
            .map(|shard| {
                let prev = s.prev_config();
                Transfer {
                    shard,
                    config_num: s.config().num,
                    servers: prev
                        .servers(prev.owner(shard))
                        .map(<[String]>::to_vec)
                        .unwrap_or_default(),
                }
            })
            .collect()
    })
}

async fn pull(server: &ShardKv, network: &LocalNetwork, transfer: Transfer) {
    let args = PullShardArgs {
        shard: transfer.shard,
        config_num: transfer.config_num,
    };
    for endpoint in &transfer.servers {
        match network
            .call_group(endpoint, |s| async move { s.pull_shard(args).await })
            .await
        {
            Ok(reply) => {
                let install = GroupCommand::InstallShard {
                    shard: transfer.shard,
                    config_num: transfer.config_num,
                    data: reply.data,
                    sessions: reply.sessions,
                };
                if let Err(e) = server.submit(install).await {
                    debug!(shard = transfer.shard, error = %e, "install not applied");
                }
                return;
            }
            Err(e) => {
                debug!(shard = transfer.shard, endpoint = %endpoint, error = %e, "pull failed");
            }
        }
    }
}

async fn acknowledge(server: &ShardKv, network: &LocalNetwork, transfer: Transfer) {
    let args = ShardGcArgs {
        shard: transfer.shard,
        config_num: transfer.config_num,
    };
    for endpoint in &transfer.servers {
        match network
            .call_group(endpoint, |s| async move { s.shard_gc(args).await })
            .await
        {
            Ok(()) => {
                let gc = GroupCommand::GcShard {
                    shard: transfer.shard,
                    config_num: transfer.config_num,
                };
                if let Err(e) = server.submit(gc).await {
                    debug!(shard = transfer.shard, error = %e, "gc not applied");
                }
                return;
            }
            Err(e) => {
                debug!(shard = transfer.shard, endpoint = %endpoint, error = %e, "gc ack failed");
            }
        }
    }
}
