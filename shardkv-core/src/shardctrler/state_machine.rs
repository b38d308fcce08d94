//! Controller state: config history plus per-client sessions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use super::common::{CtrlerOp, JoinArgs, LeaveArgs, MoveArgs, QueryArgs};
use super::rebalance::rebalance;
use crate::applier::StateMachine;
use crate::common::codec;
use crate::error::{KvError, ShardKvResult};
use crate::types::{ClientId, Config, Session, NSHARDS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtrlerState {
    /// `configs[i].num == i`; never empty
    configs: Vec<Config>,
    sessions: HashMap<ClientId, Session<Result<(), KvError>>>,
}

impl Default for CtrlerState {
    fn default() -> Self {
        Self {
            configs: vec![Config::default()],
            sessions: HashMap::new(),
        }
    }
}

impl CtrlerState {
    pub fn latest(&self) -> &Config {
        // `configs` starts with config 0 and only grows.
        &self.configs[self.configs.len() - 1]
    }

    /// Config `num`, or the latest for `None` or a number past the history
    pub fn query(&self, num: Option<u64>) -> &Config {
        match num {
            Some(num) if (num as usize) < self.configs.len() => &self.configs[num as usize],
            _ => self.latest(),
        }
    }

    pub fn history(&self) -> &[Config] {
        &self.configs
    }

    fn next_config(&self) -> Config {
        let mut next = self.latest().clone();
        next.num += 1;
        next
    }

    fn join(&mut self, args: JoinArgs) -> Result<(), KvError> {
        let mut next = self.next_config();
        for (gid, servers) in args.servers {
            next.groups.insert(gid, servers);
        }
        rebalance(&mut next.shards, &next.groups);
        info!(num = next.num, groups = ?next.groups.keys().collect::<Vec<_>>(), "join");
        self.configs.push(next);
        Ok(())
    }

    fn leave(&mut self, args: LeaveArgs) -> Result<(), KvError> {
        let mut next = self.next_config();
        for gid in &args.gids {
            next.groups.remove(gid);
        }
        rebalance(&mut next.shards, &next.groups);
        info!(num = next.num, left = ?args.gids, "leave");
        self.configs.push(next);
        Ok(())
    }

    /// Moves are rejected unless the shard exists and the target group is
    /// part of the latest config.
    fn move_shard(&mut self, args: MoveArgs) -> Result<(), KvError> {
        if args.shard >= NSHARDS || !self.latest().groups.contains_key(&args.gid) {
            debug!(shard = args.shard, gid = args.gid, "rejecting move");
            return Err(KvError::WrongGroup);
        }
        let mut next = self.next_config();
        next.shards[args.shard] = args.gid;
        info!(num = next.num, shard = args.shard, gid = args.gid, "move");
        self.configs.push(next);
        Ok(())
    }
}

impl StateMachine for CtrlerState {
    type Command = CtrlerOp;
    type Output = Config;

    fn apply(&mut self, op: CtrlerOp) -> Result<Config, KvError> {
        if let Some((client_id, seq)) = op.session() {
            if let Some(session) = self.sessions.get(&client_id) {
                if seq <= session.last_seq {
                    debug!(client_id, seq, op = op.op_type(), "duplicate controller request");
                    return session.last_reply.map(|()| self.latest().clone());
                }
            }
        }

        let session = op.session();
        let result = match op {
            CtrlerOp::Query(QueryArgs { num }) => return Ok(self.query(num).clone()),
            CtrlerOp::Join(args) => self.join(args),
            CtrlerOp::Leave(args) => self.leave(args),
            CtrlerOp::Move(args) => self.move_shard(args),
        };

        if let Some((client_id, seq)) = session {
            self.sessions.insert(
                client_id,
                Session {
                    last_seq: seq,
                    last_reply: result,
                },
            );
        }
        result.map(|()| self.latest().clone())
    }

    fn snapshot(&self) -> ShardKvResult<Vec<u8>> {
        codec::encode(self, "controller snapshot")
    }

    fn restore(&mut self, data: &[u8]) -> ShardKvResult<()> {
        *self = codec::decode(data, "controller snapshot")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GroupId, NO_GROUP};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn join(gids: &[GroupId], client_id: ClientId, seq: u64) -> CtrlerOp {
        CtrlerOp::Join(JoinArgs {
            servers: gids
                .iter()
                .map(|g| (*g, vec![format!("group-{}-0", g)]))
                .collect::<BTreeMap<_, _>>(),
            client_id,
            seq,
        })
    }

    #[test]
    fn test_three_joins_produce_config_three() {
        let mut state = CtrlerState::default();
        state.apply(join(&[1], 1, 1)).unwrap();
        state.apply(join(&[2], 1, 2)).unwrap();
        state.apply(join(&[3], 1, 3)).unwrap();

        let latest = state.apply(CtrlerOp::Query(QueryArgs { num: None })).unwrap();
        assert_eq!(latest.num, 3);
        assert!(latest.shards.iter().all(|g| [1, 2, 3].contains(g)));
        assert!(latest.is_well_formed());
    }

    #[test]
    fn test_duplicate_join_does_not_advance() {
        let mut state = CtrlerState::default();
        state.apply(join(&[1], 9, 1)).unwrap();
        state.apply(join(&[1], 9, 1)).unwrap();
        assert_eq!(state.latest().num, 1);
        assert_eq!(state.history().len(), 2);
    }

    #[test]
    fn test_leave_last_group_unassigns() {
        let mut state = CtrlerState::default();
        state.apply(join(&[1, 2], 1, 1)).unwrap();
        state
            .apply(CtrlerOp::Leave(LeaveArgs { gids: vec![1, 2], client_id: 1, seq: 2 }))
            .unwrap();
        assert_eq!(state.latest().shards, [NO_GROUP; NSHARDS]);
        assert!(state.latest().groups.is_empty());
    }

    #[test]
    fn test_move_overrides_balance() {
        let mut state = CtrlerState::default();
        state.apply(join(&[1, 2], 1, 1)).unwrap();
        let before = state.latest().clone();
        let shard = before.shards_of(1)[0];

        state
            .apply(CtrlerOp::Move(MoveArgs { shard, gid: 2, client_id: 1, seq: 2 }))
            .unwrap();
        let after = state.latest();
        assert_eq!(after.num, before.num + 1);
        assert_eq!(after.owner(shard), 2);
        assert_eq!(after.shards_of(1).len(), before.shards_of(1).len() - 1);
    }

    #[rstest]
    #[case::unknown_group(0, 42)]
    #[case::shard_out_of_range(NSHARDS, 1)]
    fn test_invalid_move_is_rejected(#[case] shard: usize, #[case] gid: GroupId) {
        let mut state = CtrlerState::default();
        state.apply(join(&[1], 1, 1)).unwrap();
        let err = state
            .apply(CtrlerOp::Move(MoveArgs { shard, gid, client_id: 1, seq: 2 }))
            .unwrap_err();
        assert_eq!(err, KvError::WrongGroup);
        assert_eq!(state.latest().num, 1);

        // The rejection is remembered for a retry of the same request.
        let again = state.apply(CtrlerOp::Move(MoveArgs { shard, gid, client_id: 1, seq: 2 }));
        assert_eq!(again, Err(KvError::WrongGroup));
    }

    #[test]
    fn test_query_past_history_returns_latest() {
        let mut state = CtrlerState::default();
        state.apply(join(&[1], 1, 1)).unwrap();
        assert_eq!(state.query(Some(0)).num, 0);
        assert_eq!(state.query(Some(99)).num, 1);
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_sessions() {
        let mut state = CtrlerState::default();
        state.apply(join(&[1], 5, 1)).unwrap();
        let bytes = state.snapshot().unwrap();

        let mut restored = CtrlerState::default();
        restored.restore(&bytes).unwrap();
        assert_eq!(restored, state);
        restored.apply(join(&[1], 5, 1)).unwrap();
        assert_eq!(restored.latest().num, 1);
    }
}
