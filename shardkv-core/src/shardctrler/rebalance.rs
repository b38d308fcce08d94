//! Deterministic shard placement
//!
//! Every controller replica runs this on the same input and must get the
//! same output, so all choices are made by count and then by lowest group id.

use std::collections::BTreeMap;

use crate::types::{GroupId, NO_GROUP, NSHARDS};

/// Least loaded group; ties go to the lowest gid
fn least_loaded(counts: &BTreeMap<GroupId, usize>) -> Option<GroupId> {
    counts
        .iter()
        .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
        .map(|(gid, _)| *gid)
}

/// Most loaded group; ties go to the lowest gid
fn most_loaded(counts: &BTreeMap<GroupId, usize>) -> Option<GroupId> {
    counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        .map(|(gid, _)| *gid)
}

/// Reassign `shards` so that every shard belongs to one of `groups` and the
/// shard counts of any two groups differ by at most one.
///
/// Shards held by a group outside `groups` (or by nobody) are handed out
/// first. After that, single shards move from the most to the least loaded
/// group until the spread is at most one, so shards that already sit on a
/// surviving group stay where they are whenever possible.
pub fn rebalance<V>(shards: &mut [GroupId; NSHARDS], groups: &BTreeMap<GroupId, V>) {
    if groups.is_empty() {
        *shards = [NO_GROUP; NSHARDS];
        return;
    }

    let mut counts: BTreeMap<GroupId, usize> = groups.keys().map(|gid| (*gid, 0)).collect();
    for gid in shards.iter() {
        if let Some(count) = counts.get_mut(gid) {
            *count += 1;
        }
    }

    for shard in 0..NSHARDS {
        if counts.contains_key(&shards[shard]) {
            continue;
        }
        if let Some(target) = least_loaded(&counts) {
            shards[shard] = target;
            *counts.entry(target).or_default() += 1;
        }
    }

    loop {
        let (Some(max_gid), Some(min_gid)) = (most_loaded(&counts), least_loaded(&counts)) else {
            return;
        };
        if counts[&max_gid] <= counts[&min_gid] + 1 {
            return;
        }
        // Lowest-index shard of the most loaded group moves.
        let Some(shard) = (0..NSHARDS).find(|s| shards[*s] == max_gid) else {
            return;
        };
        shards[shard] = min_gid;
        *counts.entry(max_gid).or_default() -= 1;
        *counts.entry(min_gid).or_default() += 1;
    }
}
