// Storage group behaviour: routing, exactly-once writes, shard migration
// and failures of group replicas

mod common;

use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use common::{
    check_keys, fast_builder, key_in_shard, memory_cluster, seed_keys, spread_key,
    wait_for_condition, wait_settled, TEST_TIMEOUT,
};
use shardkv_core::shardkv::common::{
    GetArgs, PullShardArgs, PutAppendArgs, PutAppendOp, ShardGcArgs,
};
use shardkv_core::transport::GroupService;
use shardkv_core::{key2shard, KvError, LocalCluster, LogBackend, ShardStatus, NSHARDS};

#[tokio::test]
async fn test_basic_put_get_append() {
    let cluster = memory_cluster(&[100]);
    cluster
        .ctrler_clerk()
        .join(cluster.join_args(&[100]).unwrap())
        .await
        .unwrap();

    let mut clerk = cluster.clerk();
    assert_eq!(clerk.get("missing").await, "");

    clerk.put("a", "1").await;
    clerk.append("a", "2").await;
    clerk.append("b", "x").await;
    assert_eq!(clerk.get("a").await, "12");
    assert_eq!(clerk.get("b").await, "x");

    clerk.put("a", "3").await;
    assert_eq!(clerk.get("a").await, "3");

    // Another clerk sees the same state.
    assert_eq!(cluster.clerk().get("a").await, "3");
}

#[tokio::test]
async fn test_retried_append_is_applied_once() {
    let cluster = memory_cluster(&[100]);
    cluster
        .ctrler_clerk()
        .join(cluster.join_args(&[100]).unwrap())
        .await
        .unwrap();
    wait_settled(&cluster).await;

    let leader = cluster.server(100, 0).unwrap();
    let append = PutAppendArgs {
        key: "k".to_string(),
        value: "x".to_string(),
        op: PutAppendOp::Append,
        client_id: 11,
        seq: 1,
    };
    leader.put_append(append.clone()).await.unwrap();
    leader.put_append(append.clone()).await.unwrap();

    // An older sequence number is answered without effect, too.
    let stale = PutAppendArgs { seq: 0, ..append };
    leader.put_append(stale).await.unwrap();

    let value = leader
        .get(GetArgs {
            key: "k".to_string(),
            client_id: 11,
            seq: 1,
        })
        .await
        .unwrap();
    assert_eq!(value, "x");
}

#[tokio::test]
async fn test_concurrent_duplicate_append_applies_once() {
    let cluster = memory_cluster(&[100]);
    cluster
        .ctrler_clerk()
        .join(cluster.join_args(&[100]).unwrap())
        .await
        .unwrap();
    wait_settled(&cluster).await;

    let leader = cluster.server(100, 0).unwrap();
    let append = PutAppendArgs {
        key: "k".to_string(),
        value: "x".to_string(),
        op: PutAppendOp::Append,
        client_id: 12,
        seq: 1,
    };
    // Both copies are in the log before either applies.
    let (first, second) = tokio::join!(
        leader.put_append(append.clone()),
        leader.put_append(append.clone())
    );
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));

    let value = leader
        .get(GetArgs {
            key: "k".to_string(),
            client_id: 12,
            seq: 2,
        })
        .await
        .unwrap();
    assert_eq!(value, "x");
    assert_eq!(cluster.clerk().get("k").await, "x");
}

#[tokio::test]
async fn test_wrong_group_and_wrong_leader() {
    let cluster = memory_cluster(&[100, 101]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[100, 101]).unwrap()).await.unwrap();
    wait_settled(&cluster).await;

    let config = admin.query(None).await;
    let key = key_in_shard(config.shards_of(100)[0], "routed");
    let args = GetArgs {
        key,
        client_id: 1,
        seq: 0,
    };

    let other = cluster.server(101, 0).unwrap();
    assert_eq!(other.get(args.clone()).await, Err(KvError::WrongGroup));

    let follower = cluster.server(100, 1).unwrap();
    assert_eq!(follower.get(args.clone()).await, Err(KvError::WrongLeader));

    let owner = cluster.server(100, 0).unwrap();
    assert_eq!(owner.get(args).await, Ok(String::new()));
}

#[tokio::test]
async fn test_join_migrates_shards() {
    let cluster = memory_cluster(&[100, 101, 102]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[100]).unwrap()).await.unwrap();
    let mut expected = seed_keys(&cluster, "join", 30).await;
    let shards: BTreeSet<usize> = expected.keys().map(|k| key2shard(k)).collect();
    assert_eq!(shards.len(), NSHARDS);

    admin.join(cluster.join_args(&[101]).unwrap()).await.unwrap();
    admin.join(cluster.join_args(&[102]).unwrap()).await.unwrap();
    wait_settled(&cluster).await;
    check_keys(&cluster, &expected).await;

    // Every group holds exactly its own shards, all serving.
    let config = admin.query(None).await;
    for gid in [100, 101, 102] {
        for server in cluster.servers(gid) {
            let statuses = server.read(|s| s.statuses());
            let owned: Vec<usize> = statuses.keys().copied().collect();
            assert_eq!(owned, config.shards_of(gid));
            assert!(statuses.values().all(|s| *s == ShardStatus::Serving));
        }
    }

    let mut clerk = cluster.clerk();
    for (key, value) in expected.iter_mut() {
        clerk.append(key, "+").await;
        value.push('+');
    }
    check_keys(&cluster, &expected).await;
}

#[tokio::test]
async fn test_leave_hands_shards_to_remaining_groups() {
    let cluster = memory_cluster(&[100, 101, 102]);
    let mut admin = cluster.ctrler_clerk();
    admin
        .join(cluster.join_args(&[100, 101, 102]).unwrap())
        .await
        .unwrap();
    let expected = seed_keys(&cluster, "leave", 30).await;

    admin.leave(vec![100]).await.unwrap();
    wait_settled(&cluster).await;
    check_keys(&cluster, &expected).await;

    // The departed group released everything it owned.
    for server in cluster.servers(100) {
        assert!(server.read(|s| s.statuses()).is_empty());
    }

    admin.leave(vec![101]).await.unwrap();
    wait_settled(&cluster).await;
    check_keys(&cluster, &expected).await;
    let config = admin.query(None).await;
    assert_eq!(config.shards_of(102).len(), NSHARDS);
}

#[tokio::test]
async fn test_move_migrates_single_shard() {
    let cluster = memory_cluster(&[100, 101]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[100, 101]).unwrap()).await.unwrap();
    wait_settled(&cluster).await;

    let mut clerk = cluster.clerk();
    let config = admin.query(None).await;
    let shard = config.shards_of(100)[0];
    let key = key_in_shard(shard, "move");
    clerk.put(&key, "before").await;

    admin.move_shard(shard, 101).await.unwrap();
    wait_settled(&cluster).await;

    assert_eq!(clerk.get(&key).await, "before");
    clerk.append(&key, "-after").await;
    assert_eq!(clerk.get(&key).await, "before-after");

    let new_owner = cluster.server(101, 0).unwrap();
    assert_eq!(new_owner.read(|s| s.status(shard)), Some(ShardStatus::Serving));
    for server in cluster.servers(100) {
        assert_eq!(server.read(|s| s.status(shard)), None);
    }
}

#[tokio::test]
async fn test_hand_off_rpcs_against_other_configs() {
    let cluster = memory_cluster(&[100, 101]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[100]).unwrap()).await.unwrap();
    admin.join(cluster.join_args(&[101]).unwrap()).await.unwrap();
    wait_settled(&cluster).await;

    let config = admin.query(None).await;
    assert_eq!(config.num, 2);
    let moved = config.shards_of(101)[0];
    let kept = config.shards_of(100)[0];
    let leader = cluster.server(100, 0).unwrap();

    // A request from an older config finds the hand-off already done.
    let stale = ShardGcArgs {
        shard: moved,
        config_num: 1,
    };
    assert_eq!(leader.shard_gc(stale).await, Ok(()));

    // A caller that is ahead has to wait for this group to catch up.
    let ahead = ShardGcArgs {
        shard: moved,
        config_num: 5,
    };
    assert_eq!(leader.shard_gc(ahead).await, Err(KvError::ShardNotReady));
    let pull = PullShardArgs {
        shard: moved,
        config_num: 5,
    };
    assert_eq!(leader.pull_shard(pull).await, Err(KvError::ShardNotReady));

    // Repeating the clean-up of a shard that is already gone changes nothing.
    for _ in 0..2 {
        let repeat = ShardGcArgs {
            shard: moved,
            config_num: 2,
        };
        assert_eq!(leader.shard_gc(repeat).await, Ok(()));
    }
    let statuses = leader.read(|s| s.statuses());
    assert_eq!(statuses.get(&moved), None);
    assert_eq!(statuses.get(&kept), Some(&ShardStatus::Serving));

    // Followers refuse the clean-up.
    let follower = cluster.server(100, 1).unwrap();
    let gc = ShardGcArgs {
        shard: moved,
        config_num: 2,
    };
    assert_eq!(follower.shard_gc(gc).await, Err(KvError::WrongLeader));
}

#[tokio::test]
async fn test_group_configs_advance_one_at_a_time() {
    let cluster = Arc::new(memory_cluster(&[100, 101, 102]));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let observer = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            loop {
                let nums: Vec<u64> = cluster
                    .servers(100)
                    .iter()
                    .map(|s| s.read(|st| st.config().num))
                    .collect();
                if tx.send(nums).is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[100]).unwrap()).await.unwrap();
    admin.join(cluster.join_args(&[101]).unwrap()).await.unwrap();
    admin.leave(vec![101]).await.unwrap();
    admin.join(cluster.join_args(&[102]).unwrap()).await.unwrap();
    wait_settled(&cluster).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    observer.abort();

    let mut last = vec![0u64; 3];
    while let Ok(nums) = rx.try_recv() {
        for (replica, num) in nums.into_iter().enumerate() {
            assert!(num >= last[replica], "config went back from {} to {}", last[replica], num);
            last[replica] = num;
        }
    }
    assert_eq!(last, vec![4, 4, 4]);

    // The controller history is contiguous on every replica.
    for r in 0..3 {
        let nums: Vec<u64> = cluster
            .ctrler(r)
            .unwrap()
            .local_history()
            .iter()
            .map(|c| c.num)
            .collect();
        assert_eq!(nums, vec![0, 1, 2, 3, 4]);
    }
}

#[tokio::test]
async fn test_concurrent_clerks_during_reconfiguration() {
    let cluster = Arc::new(memory_cluster(&[100, 101, 102]));
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[100]).unwrap()).await.unwrap();

    let mut writers = Vec::new();
    for w in 0..4 {
        let cluster = Arc::clone(&cluster);
        writers.push(tokio::spawn(async move {
            let mut clerk = cluster.clerk();
            let key = spread_key("writer", w);
            let mut expected = String::new();
            for i in 0..15 {
                let piece = format!("[{}.{}]", w, i);
                clerk.append(&key, &piece).await;
                expected.push_str(&piece);
            }
            (key, expected)
        }));
    }

    admin.join(cluster.join_args(&[101]).unwrap()).await.unwrap();
    admin.join(cluster.join_args(&[102]).unwrap()).await.unwrap();
    admin.leave(vec![100]).await.unwrap();

    let mut expected = BTreeMap::new();
    for writer in writers {
        let (key, value) = writer.await.unwrap();
        expected.insert(key, value);
    }
    wait_settled(&cluster).await;
    check_keys(&cluster, &expected).await;
}

#[tokio::test]
async fn test_unreliable_network_keeps_exactly_once() {
    let cluster = memory_cluster(&[100, 101]);
    let mut admin = cluster.ctrler_clerk();
    admin.join(cluster.join_args(&[100]).unwrap()).await.unwrap();

    cluster.network().set_unreliable(true);
    let mut clerk = cluster.clerk();
    let mut expected = BTreeMap::new();
    for i in 0..10 {
        let key = spread_key("u", i);
        clerk.put(&key, "a").await;
        clerk.append(&key, "b").await;
        expected.insert(key, "ab".to_string());
    }

    admin.join(cluster.join_args(&[101]).unwrap()).await.unwrap();
    for (key, value) in expected.iter_mut() {
        clerk.append(key, "c").await;
        value.push('c');
    }
    check_keys(&cluster, &expected).await;

    cluster.network().set_unreliable(false);
    wait_settled(&cluster).await;
    check_keys(&cluster, &expected).await;
}

#[tokio::test]
async fn test_leader_change_keeps_data() {
    let cluster = memory_cluster(&[100]);
    cluster
        .ctrler_clerk()
        .join(cluster.join_args(&[100]).unwrap())
        .await
        .unwrap();
    let mut expected = seed_keys(&cluster, "lc", 10).await;

    cluster.elect(100, 1).unwrap();
    let mut clerk = cluster.clerk();
    for (key, value) in expected.iter_mut() {
        clerk.append(key, "!").await;
        value.push('!');
    }
    check_keys(&cluster, &expected).await;
    assert!(cluster.server(100, 1).unwrap().is_leader().await);
    assert!(!cluster.server(100, 0).unwrap().is_leader().await);
}

#[tokio::test]
async fn test_partitioned_leader_loses_uncommitted_write() {
    let cluster = memory_cluster(&[100]);
    cluster
        .ctrler_clerk()
        .join(cluster.join_args(&[100]).unwrap())
        .await
        .unwrap();
    wait_settled(&cluster).await;

    let old_leader = cluster.server(100, 0).unwrap();
    cluster.disconnect(100, 0).unwrap();

    // The isolated leader accepts the write but can never commit it.
    let stranded = {
        let old_leader = Arc::clone(&old_leader);
        tokio::spawn(async move {
            old_leader
                .put_append(PutAppendArgs {
                    key: "p".to_string(),
                    value: "lost".to_string(),
                    op: PutAppendOp::Put,
                    client_id: 5,
                    seq: 1,
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cluster.elect(100, 1).unwrap();
    let mut clerk = cluster.clerk();
    clerk.put("p", "kept").await;

    let outcome = stranded.await.unwrap();
    assert!(
        matches!(outcome, Err(KvError::WrongLeader) | Err(KvError::Timeout)),
        "unexpected {:?}",
        outcome
    );

    cluster.connect(100, 0).unwrap();
    wait_for_condition(
        || async { old_leader.read(|s| s.peek("p").map(str::to_string)) == Some("kept".to_string()) },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();
    assert_eq!(clerk.get("p").await, "kept");
}

#[tokio::test]
async fn test_restart_from_snapshot() {
    let settings = fast_builder(LogBackend::Memory, &[100])
        .compaction_threshold(8)
        .build()
        .unwrap();
    let mut cluster = LocalCluster::start(settings).unwrap();
    cluster
        .ctrler_clerk()
        .join(cluster.join_args(&[100]).unwrap())
        .await
        .unwrap();
    let expected = seed_keys(&cluster, "snap", 40).await;

    wait_for_condition(|| async { cluster.snapshot_index(100).unwrap() > 0 }, TEST_TIMEOUT)
        .await
        .unwrap();

    cluster.crash(100, 2).unwrap();
    assert!(cluster.server(100, 2).is_none());
    cluster.restart(100, 2).unwrap();

    let restarted = cluster.server(100, 2).unwrap();
    let leader = cluster.server(100, 0).unwrap();
    wait_for_condition(
        || async { restarted.last_applied() >= leader.last_applied() },
        TEST_TIMEOUT,
    )
    .await
    .unwrap();
    for (key, value) in &expected {
        assert_eq!(restarted.read(|s| s.peek(key).map(str::to_string)), Some(value.clone()));
    }

    // Lose the leader as well; the restarted replica can take over.
    cluster.crash(100, 0).unwrap();
    cluster.elect(100, 2).unwrap();
    check_keys(&cluster, &expected).await;
}
