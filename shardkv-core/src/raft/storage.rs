//! raft-rs storage for one replica
//!
//! Log entries and hard state live in raft-rs' `MemStorage`. On top of that
//! the storage keeps the latest application snapshot, so a leader can ship it
//! to followers that fall behind the compacted prefix of the log.

use parking_lot::RwLock;
use raft_proto::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use std::sync::Arc;

use crate::error::{ShardKvError, ShardKvResult};

#[derive(Clone)]
pub struct SnapshotStorage {
    mem: MemStorage,
    app_snapshot: Arc<RwLock<Option<Snapshot>>>,
}

fn store_error(operation: &str, e: raft::Error) -> ShardKvError {
    ShardKvError::Raft {
        operation: operation.to_string(),
        source: Box::new(e),
    }
}

impl SnapshotStorage {
    /// Storage for a fixed voter set
    pub fn new(voters: Vec<u64>) -> Self {
        let conf_state = ConfState::from((voters, Vec::<u64>::new()));
        Self {
            mem: MemStorage::new_with_conf_state(conf_state),
            app_snapshot: Arc::new(RwLock::new(None)),
        }
    }

    /// Persist entries produced by a ready
    pub fn append(&self, entries: &[Entry]) -> ShardKvResult<()> {
        self.mem
            .wl()
            .append(entries)
            .map_err(|e| store_error("append entries", e))
    }

    pub fn set_hard_state(&self, hard_state: HardState) {
        self.mem.wl().set_hardstate(hard_state);
    }

    pub fn set_commit(&self, commit: u64) {
        self.mem.wl().mut_hard_state().commit = commit;
    }

    /// Install a snapshot received from the leader
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> ShardKvResult<()> {
        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .map_err(|e| store_error("apply snapshot", e))?;
        *self.app_snapshot.write() = Some(snapshot);
        Ok(())
    }

    /// Record the application snapshot taken after applying `index` and drop
    /// the log prefix before it
    pub fn compact(&self, index: u64, data: Vec<u8>) -> ShardKvResult<()> {
        let first = self.mem.first_index().map_err(|e| store_error("first index", e))?;
        let last = self.mem.last_index().map_err(|e| store_error("last index", e))?;
        if index < first || index > last {
            return Ok(());
        }

        let term = self.mem.term(index).map_err(|e| store_error("term", e))?;
        let conf_state = self
            .mem
            .initial_state()
            .map_err(|e| store_error("initial state", e))?
            .conf_state;

        let mut snapshot = Snapshot::default();
        snapshot.data = data.into();
        {
            let metadata = snapshot.mut_metadata();
            metadata.index = index;
            metadata.term = term;
            metadata.set_conf_state(conf_state);
        }
        *self.app_snapshot.write() = Some(snapshot);

        // Keep the entry at `index` so its term stays available for appends.
        self.mem
            .wl()
            .compact(index)
            .map_err(|e| store_error("compact log", e))
    }

    /// Entries currently retained
    pub fn retained(&self) -> u64 {
        match (self.mem.first_index(), self.mem.last_index()) {
            (Ok(first), Ok(last)) if last >= first => last - first + 1,
            _ => 0,
        }
    }
}

impl Storage for SnapshotStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        match self.app_snapshot.read().as_ref() {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => {
                Ok(snapshot.clone())
            }
            _ => Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}
