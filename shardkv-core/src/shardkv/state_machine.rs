//! Storage group state
//!
//! Holds the group's view of the config, the shards it currently holds and
//! the client session table. Only the applier mutates it; handlers and the
//! background loops read it under the replica lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::common::{GetArgs, GroupCommand, PullShardReply, PutAppendArgs, PutAppendOp, Sessions};
use crate::applier::StateMachine;
use crate::common::codec;
use crate::error::{KvError, ShardKvResult};
use crate::types::{key2shard, Config, GroupId, Session, ShardId, ShardStatus, NO_GROUP, NSHARDS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub status: ShardStatus,
    pub kv: HashMap<String, String>,
}

impl Shard {
    fn empty(status: ShardStatus) -> Self {
        Self {
            status,
            kv: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupState {
    gid: GroupId,
    config: Config,
    prev_config: Config,
    /// Shards held by this group; a released shard has no entry
    shards: BTreeMap<ShardId, Shard>,
    sessions: Sessions,
}

impl GroupState {
    pub fn new(gid: GroupId) -> Self {
        Self {
            gid,
            config: Config::default(),
            prev_config: Config::default(),
            shards: BTreeMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn gid(&self) -> GroupId {
        self.gid
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn prev_config(&self) -> &Config {
        &self.prev_config
    }

    pub fn status(&self, shard: ShardId) -> Option<ShardStatus> {
        self.shards.get(&shard).map(|s| s.status)
    }

    pub fn statuses(&self) -> BTreeMap<ShardId, ShardStatus> {
        self.shards.iter().map(|(id, s)| (*id, s.status)).collect()
    }

    /// Shards currently in `status`
    pub fn shards_in(&self, status: ShardStatus) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| *id)
            .collect()
    }

    /// No migration in or out is in flight
    pub fn is_settled(&self) -> bool {
        self.shards.values().all(|s| s.status == ShardStatus::Serving)
    }

    /// Whether a client request on `shard` can be executed now
    pub fn check_shard(&self, shard: ShardId) -> Result<(), KvError> {
        match self.shards.get(&shard).map(|s| s.status) {
            Some(status) if status.accepts_clients() => Ok(()),
            Some(ShardStatus::Pulling) => Err(KvError::ShardNotReady),
            _ => Err(KvError::WrongGroup),
        }
    }

    /// Copy of `shard` for its next owner, served while this group is at
    /// `config_num` or later and still holds the data
    pub fn export_shard(&self, shard: ShardId, config_num: u64) -> Result<PullShardReply, KvError> {
        if self.config.num < config_num {
            return Err(KvError::ShardNotReady);
        }
        match self.shards.get(&shard) {
            Some(s) if matches!(s.status, ShardStatus::BePulling | ShardStatus::Serving) => {
                Ok(PullShardReply {
                    data: s.kv.clone(),
                    sessions: self.sessions.clone(),
                })
            }
            _ => Err(KvError::ShardNotReady),
        }
    }

    /// Value of `key` as stored, for inspection
    pub fn peek(&self, key: &str) -> Option<&str> {
        self.shards
            .get(&key2shard(key))
            .and_then(|s| s.kv.get(key))
            .map(String::as_str)
    }

    fn get(&self, args: &GetArgs) -> Result<String, KvError> {
        let shard = key2shard(&args.key);
        self.check_shard(shard)?;
        Ok(self
            .shards
            .get(&shard)
            .and_then(|s| s.kv.get(&args.key))
            .cloned()
            .unwrap_or_default())
    }

    fn put_append(&mut self, args: PutAppendArgs) -> Result<String, KvError> {
        if let Some(session) = self.sessions.get(&args.client_id) {
            if args.seq <= session.last_seq {
                debug!(client_id = args.client_id, seq = args.seq, "duplicate request");
                return Ok(session.last_reply.clone());
            }
        }

        let shard = key2shard(&args.key);
        self.check_shard(shard)?;
        let kv = match self.shards.get_mut(&shard) {
            Some(s) => &mut s.kv,
            None => return Err(KvError::WrongGroup),
        };
        match args.op {
            PutAppendOp::Put => {
                kv.insert(args.key, args.value);
            }
            PutAppendOp::Append => {
                kv.entry(args.key).or_default().push_str(&args.value);
            }
        }

        self.sessions.insert(
            args.client_id,
            Session {
                last_seq: args.seq,
                last_reply: String::new(),
            },
        );
        Ok(String::new())
    }

    fn config_change(&mut self, next: Config) -> Result<String, KvError> {
        if next.num != self.config.num + 1 || !self.is_settled() {
            debug!(current = self.config.num, proposed = next.num, "ignoring config change");
            return Err(KvError::WrongConfig);
        }

        for shard in 0..NSHARDS {
            let old_owner = self.config.owner(shard);
            let new_owner = next.owner(shard);
            if old_owner == new_owner {
                continue;
            }
            if new_owner == self.gid {
                let status = if old_owner == NO_GROUP {
                    ShardStatus::Serving
                } else {
                    ShardStatus::Pulling
                };
                self.shards.insert(shard, Shard::empty(status));
            } else if old_owner == self.gid {
                if new_owner == NO_GROUP {
                    warn!(gid = self.gid, shard, "shard left unassigned, dropping its data");
                    self.shards.remove(&shard);
                } else if let Some(s) = self.shards.get_mut(&shard) {
                    s.status = ShardStatus::BePulling;
                }
            }
        }

        info!(gid = self.gid, num = next.num, statuses = ?self.statuses(), "installed config");
        self.prev_config = std::mem::replace(&mut self.config, next);
        Ok(String::new())
    }

    fn install_shard(
        &mut self,
        shard: ShardId,
        config_num: u64,
        data: HashMap<String, String>,
        sessions: Sessions,
    ) -> Result<String, KvError> {
        if config_num != self.config.num {
            return Err(KvError::WrongConfig);
        }
        let Some(target) = self.shards.get_mut(&shard) else {
            return Err(KvError::WrongConfig);
        };
        if target.status != ShardStatus::Pulling {
            // Already installed by an earlier copy of this command.
            return Ok(String::new());
        }

        target.kv = data;
        target.status = ShardStatus::GCing;
        for (client_id, incoming) in sessions {
            match self.sessions.get(&client_id) {
                Some(existing) if existing.last_seq >= incoming.last_seq => {}
                _ => {
                    self.sessions.insert(client_id, incoming);
                }
            }
        }
        info!(gid = self.gid, shard, config_num, "installed shard");
        Ok(String::new())
    }

    fn gc_shard(&mut self, shard: ShardId, config_num: u64) -> Result<String, KvError> {
        if config_num != self.config.num {
            return Ok(String::new());
        }
        match self.shards.get(&shard).map(|s| s.status) {
            Some(ShardStatus::BePulling) => {
                self.shards.remove(&shard);
                info!(gid = self.gid, shard, config_num, "released shard");
            }
            Some(ShardStatus::GCing) => {
                if let Some(s) = self.shards.get_mut(&shard) {
                    s.status = ShardStatus::Serving;
                }
                debug!(gid = self.gid, shard, config_num, "previous owner released shard");
            }
            _ => {}
        }
        Ok(String::new())
    }
}

impl StateMachine for GroupState {
    type Command = GroupCommand;
    type Output = String;

    fn apply(&mut self, command: GroupCommand) -> Result<String, KvError> {
        match command {
            GroupCommand::Get(args) => self.get(&args),
            GroupCommand::PutAppend(args) => self.put_append(args),
            GroupCommand::ConfigChange(next) => self.config_change(next),
            GroupCommand::InstallShard {
                shard,
                config_num,
                data,
                sessions,
            } => self.install_shard(shard, config_num, data, sessions),
            GroupCommand::GcShard { shard, config_num } => self.gc_shard(shard, config_num),
        }
    }

    fn snapshot(&self) -> ShardKvResult<Vec<u8>> {
        codec::encode(self, "group snapshot")
    }

    fn restore(&mut self, data: &[u8]) -> ShardKvResult<()> {
        *self = codec::decode(data, "group snapshot")?;
        Ok(())
    }
}
