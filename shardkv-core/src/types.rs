use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of shards the key space is split into
pub const NSHARDS: usize = 10;

/// Replica group identifier; [`NO_GROUP`] marks an unassigned shard
pub type GroupId = u64;

/// Shard index in `[0, NSHARDS)`
pub type ShardId = usize;

/// Logical client identity used for exactly-once deduplication
pub type ClientId = u64;

/// Per-client request sequence number
pub type SeqId = u64;

/// Sentinel owner for shards that belong to no group
pub const NO_GROUP: GroupId = 0;

/// Map a key to the shard that owns it
pub fn key2shard(key: &str) -> ShardId {
    key.as_bytes()
        .first()
        .map(|b| *b as usize % NSHARDS)
        .unwrap_or(0)
}

/// A versioned, immutable shard assignment plus group membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub num: u64,
    pub shards: [GroupId; NSHARDS],
    pub groups: BTreeMap<GroupId, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num: 0,
            shards: [NO_GROUP; NSHARDS],
            groups: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Group that owns `shard` under this config
    pub fn owner(&self, shard: ShardId) -> GroupId {
        self.shards[shard]
    }

    /// Replica endpoints of `gid`, if the group is part of this config
    pub fn servers(&self, gid: GroupId) -> Option<&[String]> {
        self.groups.get(&gid).map(Vec::as_slice)
    }

    /// Shards assigned to `gid`, in index order
    pub fn shards_of(&self, gid: GroupId) -> Vec<ShardId> {
        (0..NSHARDS).filter(|s| self.shards[*s] == gid).collect()
    }

    /// Number of shards assigned to each group in `groups`
    pub fn shard_counts(&self) -> BTreeMap<GroupId, usize> {
        let mut counts: BTreeMap<GroupId, usize> =
            self.groups.keys().map(|gid| (*gid, 0)).collect();
        for gid in self.shards {
            if let Some(count) = counts.get_mut(&gid) {
                *count += 1;
            }
        }
        counts
    }

    /// Every shard maps to a known group; "no group" only while no group exists
    pub fn is_well_formed(&self) -> bool {
        self.shards.iter().all(|gid| {
            if *gid == NO_GROUP {
                self.groups.is_empty()
            } else {
                self.groups.contains_key(gid)
            }
        })
    }
}

/// Lifecycle of one shard inside one storage group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardStatus {
    /// Owned and answering client requests
    Serving,
    /// Owned under the new config, data not yet copied from the prior owner
    Pulling,
    /// Owned under the old config, waiting for the new owner to take the data
    BePulling,
    /// Installed here, waiting for the prior owner to confirm it freed its copy
    GCing,
}

impl ShardStatus {
    /// Whether client requests on the shard may be executed
    pub fn accepts_clients(&self) -> bool {
        matches!(self, ShardStatus::Serving | ShardStatus::GCing)
    }
}

/// Last applied request of one client, used to suppress re-execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session<R> {
    pub last_seq: SeqId,
    pub last_reply: R,
}
