// Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use shardkv_core::{
    key2shard, GroupId, LocalCluster, LogBackend, Settings, SettingsBuilder, ShardId, ShardKvError,
    ShardKvResult,
};

/// Upper bound for any single wait in these tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings with short intervals so reconfigurations finish quickly
pub fn fast_settings(backend: LogBackend, groups: &[GroupId]) -> Settings {
    fast_builder(backend, groups)
        .build()
        .expect("test settings are valid")
}

pub fn fast_builder(backend: LogBackend, groups: &[GroupId]) -> SettingsBuilder {
    SettingsBuilder::new()
        .backend(backend)
        .request_timeout(Duration::from_millis(300))
        .config_poll_interval(Duration::from_millis(20))
        .migration_interval(Duration::from_millis(20))
        .client_retry_delay(Duration::from_millis(10))
        .controller_replicas(3)
        .groups(groups.iter().map(|gid| (*gid, 3)))
        .log_level("warn")
}

/// In-memory log cluster with three-replica groups `groups`
pub fn memory_cluster(groups: &[GroupId]) -> LocalCluster {
    LocalCluster::start(fast_settings(LogBackend::Memory, groups)).expect("cluster starts")
}

/// Wait for a condition with timeout
pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout: Duration) -> ShardKvResult<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition().await {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Err(ShardKvError::Timeout {
        operation: "wait_for_condition".to_string(),
        duration: timeout,
    })
}

/// True once every running replica of every group has applied config `num`
/// and finished all shard hand-offs
pub fn all_settled_at(cluster: &LocalCluster, num: u64) -> bool {
    cluster.gids().into_iter().all(|gid| {
        cluster
            .servers(gid)
            .iter()
            .all(|s| s.read(|st| st.config().num == num && st.is_settled()))
    })
}

/// Wait until the whole deployment has caught up with the controller's
/// latest config
pub async fn wait_settled(cluster: &LocalCluster) {
    let num = cluster
        .ctrler_clerk()
        .query(None)
        .await
        .num;
    wait_for_condition(|| async { all_settled_at(cluster, num) }, TEST_TIMEOUT)
        .await
        .unwrap_or_else(|_| panic!("groups did not settle at config {}", num));
}

/// Key that `key2shard` places in `shard`. Shards are picked by the first
/// byte, so the shard is encoded there.
pub fn key_in_shard(shard: ShardId, suffix: &str) -> String {
    let key = format!("{}-{}", (b'd' + shard as u8) as char, suffix);
    assert_eq!(key2shard(&key), shard);
    key
}

/// Key `i` of a set whose consecutive members cycle through every shard
pub fn spread_key(prefix: &str, i: usize) -> String {
    format!("{}{}-{}", (b'a' + (i % 26) as u8) as char, prefix, i)
}

/// Write `count` keys through a fresh clerk; returns the expected contents
pub async fn seed_keys(cluster: &LocalCluster, prefix: &str, count: usize) -> BTreeMap<String, String> {
    let mut clerk = cluster.clerk();
    let mut expected = BTreeMap::new();
    for i in 0..count {
        let key = spread_key(prefix, i);
        let value = format!("value-{}", i);
        clerk.put(&key, &value).await;
        expected.insert(key, value);
    }
    expected
}

/// Read every key back through a fresh clerk
pub async fn check_keys(cluster: &LocalCluster, expected: &BTreeMap<String, String>) {
    let mut clerk = cluster.clerk();
    for (key, value) in expected {
        assert_eq!(&clerk.get(key).await, value, "wrong value for {}", key);
    }
}
