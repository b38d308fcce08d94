// Shard controller behaviour through clerks and the RPC surface

mod common;

use pretty_assertions::assert_eq;
use std::collections::BTreeMap;

use common::memory_cluster;
use shardkv_core::shardctrler::common::JoinArgs;
use shardkv_core::transport::CtrlerService;
use shardkv_core::types::NO_GROUP;
use shardkv_core::{KvError, NSHARDS};

fn spread(counts: &BTreeMap<u64, usize>) -> usize {
    let max = counts.values().copied().max().unwrap_or(0);
    let min = counts.values().copied().min().unwrap_or(0);
    max - min
}

#[tokio::test]
async fn test_initial_config_is_empty() {
    let cluster = memory_cluster(&[1]);
    let config = cluster.ctrler_clerk().query(None).await;

    assert_eq!(config.num, 0);
    assert!(config.groups.is_empty());
    assert_eq!(config.shards, [NO_GROUP; NSHARDS]);
}

#[tokio::test]
async fn test_three_joins_balance_shards() {
    let cluster = memory_cluster(&[1, 2, 3]);
    let mut admin = cluster.ctrler_clerk();

    for gid in [1, 2, 3] {
        admin.join(cluster.join_args(&[gid]).unwrap()).await.unwrap();
    }

    let config = admin.query(None).await;
    assert_eq!(config.num, 3);
    assert!(config.is_well_formed());
    assert_eq!(config.groups.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

    let counts = config.shard_counts();
    assert_eq!(counts.values().sum::<usize>(), NSHARDS);
    assert!(spread(&counts) <= 1, "unbalanced: {:?}", counts);
}

#[tokio::test]
async fn test_query_returns_history() {
    let cluster = memory_cluster(&[1, 2]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[1]).unwrap()).await.unwrap();
    admin.join(cluster.join_args(&[2]).unwrap()).await.unwrap();

    let first = admin.query(Some(1)).await;
    assert_eq!(first.num, 1);
    assert_eq!(first.shards, [1; NSHARDS]);

    // A number past the history answers with the latest config.
    let latest = admin.query(Some(99)).await;
    assert_eq!(latest.num, 2);
    assert_eq!(latest, admin.query(None).await);
}

#[tokio::test]
async fn test_leave_reassigns_every_shard() {
    let cluster = memory_cluster(&[1, 2, 3]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[1, 2, 3]).unwrap()).await.unwrap();
    let before = admin.query(None).await;

    admin.leave(vec![2]).await.unwrap();
    let after = admin.query(None).await;

    assert_eq!(after.num, before.num + 1);
    assert!(!after.groups.contains_key(&2));
    assert!(after.shards.iter().all(|gid| *gid == 1 || *gid == 3));
    assert!(spread(&after.shard_counts()) <= 1);

    // Shards of the remaining groups stay where they were.
    for shard in 0..NSHARDS {
        if before.shards[shard] != 2 {
            assert_eq!(after.shards[shard], before.shards[shard], "shard {} moved", shard);
        }
    }
}

#[tokio::test]
async fn test_last_group_leaving_unassigns_shards() {
    let cluster = memory_cluster(&[1]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[1]).unwrap()).await.unwrap();
    admin.leave(vec![1]).await.unwrap();

    let config = admin.query(None).await;
    assert_eq!(config.num, 2);
    assert_eq!(config.shards, [NO_GROUP; NSHARDS]);
}

#[tokio::test]
async fn test_move_pins_shard_without_rebalancing() {
    let cluster = memory_cluster(&[1, 2]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[1, 2]).unwrap()).await.unwrap();
    let before = admin.query(None).await;

    let shard = before.shards_of(1)[0];
    admin.move_shard(shard, 2).await.unwrap();
    let after = admin.query(None).await;

    assert_eq!(after.num, before.num + 1);
    assert_eq!(after.shards[shard], 2);
    for other in (0..NSHARDS).filter(|s| *s != shard) {
        assert_eq!(after.shards[other], before.shards[other]);
    }
}

#[tokio::test]
async fn test_move_to_unknown_group_is_rejected() {
    let cluster = memory_cluster(&[1]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[1]).unwrap()).await.unwrap();

    assert_eq!(admin.move_shard(0, 42).await, Err(KvError::WrongGroup));
    assert_eq!(admin.move_shard(NSHARDS, 1).await, Err(KvError::WrongGroup));
    assert_eq!(admin.query(None).await.num, 1);
}

#[tokio::test]
async fn test_duplicate_join_is_applied_once() {
    let cluster = memory_cluster(&[1]);
    let leader = cluster.ctrler(0).unwrap();
    let args = JoinArgs {
        servers: cluster.join_args(&[1]).unwrap(),
        client_id: 7,
        seq: 1,
    };

    leader.join(args.clone()).await.unwrap();
    leader.join(args).await.unwrap();

    assert_eq!(leader.local_config().num, 1);
    assert_eq!(leader.local_history().len(), 2);
}

#[tokio::test]
async fn test_follower_rejects_requests() {
    let cluster = memory_cluster(&[1]);
    let follower = cluster.ctrler(1).unwrap();
    let args = JoinArgs {
        servers: cluster.join_args(&[1]).unwrap(),
        client_id: 7,
        seq: 1,
    };

    assert_eq!(follower.join(args).await, Err(KvError::WrongLeader));
}

#[tokio::test]
async fn test_clerk_follows_controller_leader_change() {
    let cluster = memory_cluster(&[1, 2]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[1]).unwrap()).await.unwrap();

    cluster.elect_ctrler(2).unwrap();
    admin.join(cluster.join_args(&[2]).unwrap()).await.unwrap();

    let config = admin.query(None).await;
    assert_eq!(config.num, 2);

    // Every replica applied the same history.
    common::wait_for_condition(
        || async {
            (0..3).all(|r| cluster.ctrler(r).unwrap().local_config().num == 2)
        },
        common::TEST_TIMEOUT,
    )
    .await
    .unwrap();
    let history = cluster.ctrler(0).unwrap().local_history();
    for r in 1..3 {
        assert_eq!(cluster.ctrler(r).unwrap().local_history(), history);
    }
}
