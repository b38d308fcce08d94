//! Deterministic in-process replicated log
//!
//! All replicas of one participant share a single committed log. Leadership,
//! partitions and crashes are driven explicitly, which makes failure
//! scenarios reproducible:
//!
//! - a leader that cannot reach a majority still accepts proposals, but they
//!   stay uncommitted and are lost if another replica is elected, so their
//!   indices get reused by different commands
//! - a reconnected or restarted replica catches up from the latest snapshot
//!   plus the entries that follow it

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ApplyMsg, ApplyReceiver, ApplySender, Proposal, ReplicatedLog};
use crate::error::{ShardKvError, ShardKvResult};

#[derive(Debug, Clone)]
struct LogEntry {
    term: u64,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    index: u64,
    term: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
struct ReplicaSlot {
    alive: bool,
    connected: bool,
    /// Highest index handed to this replica's applier
    delivered: u64,
    apply_tx: Option<ApplySender>,
}

#[derive(Debug)]
struct ClusterState {
    name: String,
    term: u64,
    leader: Option<usize>,
    snapshot: Option<StoredSnapshot>,
    /// Index of `entries[0]`
    first_index: u64,
    entries: Vec<LogEntry>,
    /// Accepted by a leader that could not reach a majority
    uncommitted: Vec<LogEntry>,
    replicas: Vec<ReplicaSlot>,
}

impl ClusterState {
    fn last_committed(&self) -> u64 {
        self.first_index + self.entries.len() as u64 - 1
    }

    fn has_quorum(&self) -> bool {
        let reachable = self
            .replicas
            .iter()
            .filter(|r| r.alive && r.connected)
            .count();
        reachable > self.replicas.len() / 2
    }

    fn leader_can_commit(&self) -> bool {
        match self.leader {
            Some(leader) => {
                let slot = &self.replicas[leader];
                slot.alive && slot.connected && self.has_quorum()
            }
            None => false,
        }
    }

    fn try_commit(&mut self) {
        if self.leader_can_commit() && !self.uncommitted.is_empty() {
            debug!(
                participant = %self.name,
                count = self.uncommitted.len(),
                "committing entries accepted while partitioned"
            );
            let pending = std::mem::take(&mut self.uncommitted);
            self.entries.extend(pending);
        }
    }

    fn deliver_all(&mut self) {
        for replica in 0..self.replicas.len() {
            self.deliver(replica);
        }
    }

    fn deliver(&mut self, replica: usize) {
        let last = self.last_committed();
        let first = self.first_index;
        let snapshot = self.snapshot.clone();
        let slot = &mut self.replicas[replica];
        if !slot.alive || !slot.connected {
            return;
        }
        let Some(tx) = slot.apply_tx.as_ref() else {
            return;
        };

        let mut delivered = slot.delivered;
        let mut closed = false;
        if delivered + 1 < first {
            if let Some(snap) = snapshot {
                closed |= tx
                    .send(ApplyMsg::Snapshot {
                        index: snap.index,
                        term: snap.term,
                        data: snap.data,
                    })
                    .is_err();
                delivered = snap.index;
            }
        }
        while !closed && delivered < last {
            delivered += 1;
            let entry = &self.entries[(delivered - first) as usize];
            closed |= tx
                .send(ApplyMsg::Command {
                    index: delivered,
                    term: entry.term,
                    data: entry.data.clone(),
                })
                .is_err();
        }

        let slot = &mut self.replicas[replica];
        slot.delivered = delivered;
        if closed {
            slot.apply_tx = None;
        }
    }
}

/// Shared log for all replicas of one participant
#[derive(Clone)]
pub struct MemoryLogCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryLogCluster {
    /// Create a log for `replicas` replicas; replica 0 starts as leader of term 1
    pub fn new(name: impl Into<String>, replicas: usize) -> Self {
        let slots = (0..replicas)
            .map(|_| ReplicaSlot {
                alive: true,
                connected: true,
                delivered: 0,
                apply_tx: None,
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                name: name.into(),
                term: 1,
                leader: if replicas > 0 { Some(0) } else { None },
                snapshot: None,
                first_index: 1,
                entries: Vec::new(),
                uncommitted: Vec::new(),
                replicas: slots,
            })),
        }
    }

    /// Handle used by replica `replica` to propose and snapshot
    pub fn replica(&self, replica: usize) -> MemoryLog {
        MemoryLog {
            state: Arc::clone(&self.state),
            replica,
        }
    }

    /// Attach (or re-attach) the applier of `replica`. Everything committed so
    /// far is replayed on the returned channel, starting from the latest snapshot.
    pub fn subscribe(&self, replica: usize) -> ShardKvResult<ApplyReceiver> {
        let mut state = self.state.lock();
        let name = state.name.clone();
        let slot = state
            .replicas
            .get_mut(replica)
            .ok_or_else(|| ShardKvError::ReplicaNotFound {
                name: format!("{}-{}", name, replica),
            })?;
        let (tx, rx) = mpsc::unbounded_channel();
        slot.alive = true;
        slot.delivered = 0;
        slot.apply_tx = Some(tx);
        state.deliver(replica);
        Ok(rx)
    }

    /// Make `replica` leader of a new term. Uncommitted entries are discarded.
    pub fn elect(&self, replica: usize) -> u64 {
        let mut state = self.state.lock();
        state.term += 1;
        state.leader = Some(replica);
        if !state.uncommitted.is_empty() {
            info!(
                participant = %state.name,
                dropped = state.uncommitted.len(),
                "new leader discards uncommitted entries"
            );
            state.uncommitted.clear();
        }
        info!(participant = %state.name, replica, term = state.term, "elected leader");
        state.deliver_all();
        state.term
    }

    /// Current leader, if any
    pub fn leader(&self) -> Option<usize> {
        self.state.lock().leader
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    /// Cut `replica` off from the others
    pub fn disconnect(&self, replica: usize) {
        let mut state = self.state.lock();
        if let Some(slot) = state.replicas.get_mut(replica) {
            slot.connected = false;
        }
    }

    /// Heal a partition; the replica catches up and a stalled leader may commit
    pub fn connect(&self, replica: usize) {
        let mut state = self.state.lock();
        if let Some(slot) = state.replicas.get_mut(replica) {
            slot.connected = true;
        }
        state.try_commit();
        state.deliver_all();
    }

    /// Stop `replica`; its applier channel is closed
    pub fn crash(&self, replica: usize) {
        let mut state = self.state.lock();
        if let Some(slot) = state.replicas.get_mut(replica) {
            slot.alive = false;
            slot.apply_tx = None;
            slot.delivered = 0;
        }
        if state.leader == Some(replica) {
            warn!(participant = %state.name, replica, "leader crashed");
            state.leader = None;
            state.uncommitted.clear();
        }
    }

    /// Index of the last committed entry
    pub fn last_committed(&self) -> u64 {
        self.state.lock().last_committed()
    }

    /// Index covered by the latest snapshot, 0 if none
    pub fn snapshot_index(&self) -> u64 {
        self.state
            .lock()
            .snapshot
            .as_ref()
            .map(|s| s.index)
            .unwrap_or(0)
    }
}

/// One replica's view of a [`MemoryLogCluster`]
#[derive(Clone)]
pub struct MemoryLog {
    state: Arc<Mutex<ClusterState>>,
    replica: usize,
}

#[async_trait]
impl ReplicatedLog for MemoryLog {
    async fn propose(&self, data: Vec<u8>) -> ShardKvResult<Option<Proposal>> {
        let mut state = self.state.lock();
        let slot = &state.replicas[self.replica];
        if state.leader != Some(self.replica) || !slot.alive {
            return Ok(None);
        }

        let term = state.term;
        let entry = LogEntry { term, data };
        if state.leader_can_commit() {
            state.entries.push(entry);
            let index = state.last_committed();
            state.deliver_all();
            Ok(Some(Proposal { index, term }))
        } else {
            state.uncommitted.push(entry);
            let index = state.last_committed() + state.uncommitted.len() as u64;
            Ok(Some(Proposal { index, term }))
        }
    }

    async fn is_leader(&self) -> bool {
        let state = self.state.lock();
        state.leader == Some(self.replica) && state.replicas[self.replica].alive
    }

    fn log_size(&self) -> u64 {
        self.state.lock().entries.len() as u64
    }

    async fn snapshot(&self, index: u64, data: Vec<u8>) -> ShardKvResult<()> {
        let mut state = self.state.lock();
        let current = state.snapshot.as_ref().map(|s| s.index).unwrap_or(0);
        if index <= current || index > state.last_committed() {
            return Ok(());
        }

        let first = state.first_index;
        let term = state.entries[(index - first) as usize].term;
        state.entries.drain(..(index - first + 1) as usize);
        state.first_index = index + 1;
        state.snapshot = Some(StoredSnapshot { index, term, data });
        debug!(participant = %state.name, index, "compacted log");
        Ok(())
    }
}
