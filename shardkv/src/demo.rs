//! Scripted workload for `shardkv demo`

use anyhow::{bail, Context};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::info;

use shardkv_core::{key2shard, GroupId, LocalCluster, Settings};

#[derive(Debug, Serialize)]
pub struct DemoReport {
    pub backend: String,
    pub final_config: u64,
    pub assignment: BTreeMap<GroupId, Vec<usize>>,
    pub keys_verified: usize,
    pub elapsed_ms: u128,
}

/// Join the configured groups one by one while writing keys, move a shard,
/// remove the first group, then read every key back.
pub async fn run(settings: Settings, keys: usize) -> anyhow::Result<DemoReport> {
    let started = Instant::now();
    let backend = format!("{:?}", settings.log.backend).to_lowercase();
    let cluster = LocalCluster::start(settings).context("starting local cluster")?;

    let gids = cluster.gids();
    let Some((&first, rest)) = gids.split_first() else {
        bail!("the deployment has no groups");
    };

    let mut admin = cluster.ctrler_clerk();
    let mut clerk = cluster.clerk();
    let mut expected: BTreeMap<String, String> = BTreeMap::new();

    admin.join(cluster.join_args(&[first])?).await?;
    info!(gid = first, "joined first group");

    for i in 0..keys {
        // The first byte picks the shard, so vary it to spread the keys.
        let key = format!("{}key-{}", (b'a' + (i % 26) as u8) as char, i);
        let value = format!("v{}", i);
        clerk.put(&key, &value).await;
        expected.insert(key, value);
    }

    for gid in rest {
        admin.join(cluster.join_args(&[*gid])?).await?;
        info!(gid, "joined group");
        for (key, value) in expected.iter_mut() {
            clerk.append(key, &format!("+{}", gid)).await;
            value.push_str(&format!("+{}", gid));
        }
    }

    if let (Some(&target), Some(key)) = (rest.last(), expected.keys().next()) {
        let shard = key2shard(key);
        admin.move_shard(shard, target).await?;
        info!(shard, gid = target, "moved shard");
    }

    if !rest.is_empty() {
        admin.leave(vec![first]).await?;
        info!(gid = first, "first group left");
    }

    for (key, value) in &expected {
        let got = clerk.get(key).await;
        if &got != value {
            bail!("key {} has value {:?}, expected {:?}", key, got, value);
        }
    }

    let config = admin.query(None).await;
    let mut assignment: BTreeMap<GroupId, Vec<usize>> = BTreeMap::new();
    for (shard, gid) in config.shards.iter().enumerate() {
        assignment.entry(*gid).or_default().push(shard);
    }

    // Give migrations a moment to settle before tearing the cluster down.
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(DemoReport {
        backend,
        final_config: config.num,
        assignment,
        keys_verified: expected.len(),
        elapsed_ms: started.elapsed().as_millis(),
    })
}
