//! raft-rs backed replicated log
//!
//! One [`RaftManager`] drives one `RawNode`: it ticks on a timer, feeds
//! proposals and peer messages into the node and processes every `Ready` in
//! the order raft-rs requires. Committed entries and installed snapshots are
//! forwarded to the participant's applier. [`RaftLog`] is the cloneable
//! handle the rest of the replica talks to.

use async_trait::async_trait;
use raft::prelude::{Config, Entry, EntryType, Message, MessageType, RawNode, Snapshot};
use raft::{SnapshotStatus, StateRole};
use slog::{error, info, warn, Logger};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

use super::router::RaftRouter;
use super::storage::SnapshotStorage;
use super::{ApplyMsg, ApplyReceiver, ApplySender, Proposal, ReplicatedLog};
use crate::error::{ShardKvError, ShardKvResult};
use crate::settings::LogSettings;

/// A command waiting to be appended by the local node
#[derive(Debug)]
pub struct RaftProposal {
    pub data: Vec<u8>,
    pub response_tx: oneshot::Sender<Option<Proposal>>,
}

/// Application snapshot handed down by the applier
#[derive(Debug)]
struct SnapshotRequest {
    index: u64,
    data: Vec<u8>,
}

/// Status published after every ready cycle
#[derive(Debug, Default)]
struct RaftStatus {
    is_leader: AtomicBool,
    term: AtomicU64,
    log_size: AtomicU64,
}

/// Drives a single raft-rs node
pub struct RaftManager {
    node_id: u64,
    raft_node: RawNode<SnapshotStorage>,
    storage: SnapshotStorage,
    logger: Logger,
    router: RaftRouter,
    tick_interval: std::time::Duration,
    campaign_on_start: bool,

    proposal_rx: mpsc::UnboundedReceiver<RaftProposal>,
    snapshot_rx: mpsc::UnboundedReceiver<SnapshotRequest>,
    message_rx: mpsc::UnboundedReceiver<Message>,
    apply_tx: ApplySender,

    status: Arc<RaftStatus>,
}

impl RaftManager {
    /// Create node `node_id` of the participant `name`, whose voters are `voters`.
    ///
    /// Returns the manager (to be spawned with [`RaftManager::run`]), the
    /// handle used to propose and snapshot, and the apply stream.
    pub fn new(
        name: &str,
        node_id: u64,
        voters: Vec<u64>,
        settings: &LogSettings,
        router: &RaftRouter,
    ) -> ShardKvResult<(Self, RaftLog, ApplyReceiver)> {
        let cfg = Config {
            id: node_id,
            election_tick: settings.election_tick,
            heartbeat_tick: settings.heartbeat_tick,
            applied: 0,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            // An isolated leader steps down instead of serving stale reads.
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        cfg.validate().map_err(|e| ShardKvError::Raft {
            operation: "validate raft config".to_string(),
            source: Box::new(e),
        })?;

        let campaign_on_start = voters.first() == Some(&node_id);
        let storage = SnapshotStorage::new(voters);
        let logger = super::utils::create_raft_logger(name, node_id);

        let raft_node =
            RawNode::new(&cfg, storage.clone(), &logger).map_err(|e| ShardKvError::Raft {
                operation: "create raft node".to_string(),
                source: Box::new(e),
            })?;

        let (proposal_tx, proposal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let message_rx = router.register(node_id);
        let status = Arc::new(RaftStatus::default());

        let manager = Self {
            node_id,
            raft_node,
            storage,
            logger,
            router: router.clone(),
            tick_interval: settings.tick_interval,
            campaign_on_start,
            proposal_rx,
            snapshot_rx,
            message_rx,
            apply_tx,
            status: Arc::clone(&status),
        };
        let handle = RaftLog {
            proposal_tx,
            snapshot_tx,
            status,
        };

        Ok((manager, handle, apply_rx))
    }

    /// Run until the applier goes away
    pub async fn run(mut self) -> ShardKvResult<()> {
        if self.campaign_on_start {
            self.raft_node.campaign()?;
            self.on_ready()?;
        }

        let mut tick_timer = interval(self.tick_interval);

        loop {
            let result = tokio::select! {
                _ = tick_timer.tick() => {
                    self.raft_node.tick();
                    self.on_ready()
                }
                Some(proposal) = self.proposal_rx.recv() => {
                    self.handle_proposal(proposal);
                    self.on_ready()
                }
                Some(msg) = self.message_rx.recv() => {
                    self.handle_raft_message(msg);
                    self.on_ready()
                }
                Some(request) = self.snapshot_rx.recv() => {
                    self.storage.compact(request.index, request.data)
                }
            };

            match result {
                Ok(()) => {}
                Err(ShardKvError::ChannelClosed { .. }) => {
                    info!(self.logger, "applier stopped, shutting down raft node");
                    self.status.is_leader.store(false, Ordering::Release);
                    return Ok(());
                }
                Err(e) => {
                    error!(self.logger, "raft loop failed"; "error" => %e);
                    self.status.is_leader.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }
    }

    fn handle_proposal(&mut self, proposal: RaftProposal) {
        if self.raft_node.raft.state != StateRole::Leader {
            let _ = proposal.response_tx.send(None);
            return;
        }

        let placed = match self.raft_node.propose(vec![], proposal.data) {
            Ok(()) => Some(Proposal {
                index: self.raft_node.raft.raft_log.last_index(),
                term: self.raft_node.raft.term,
            }),
            Err(e) => {
                warn!(self.logger, "proposal dropped"; "error" => %e);
                None
            }
        };
        let _ = proposal.response_tx.send(placed);
    }

    fn handle_raft_message(&mut self, msg: Message) {
        if let Err(e) = self.raft_node.step(msg) {
            warn!(self.logger, "failed to step raft message"; "error" => %e);
        }
    }

    fn on_ready(&mut self) -> ShardKvResult<()> {
        if !self.raft_node.has_ready() {
            self.update_status();
            return Ok(());
        }

        let mut ready = self.raft_node.ready();

        self.send_messages(ready.take_messages());

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
        }

        self.handle_committed_entries(ready.take_committed_entries())?;

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }
        if let Some(hs) = ready.hs() {
            self.storage.set_hard_state(hs.clone());
        }

        self.send_messages(ready.take_persisted_messages());

        let mut light_rd = self.raft_node.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.storage.set_commit(commit);
        }
        self.send_messages(light_rd.take_messages());
        self.handle_committed_entries(light_rd.take_committed_entries())?;
        self.raft_node.advance_apply();

        self.update_status();
        Ok(())
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> ShardKvResult<()> {
        let index = snapshot.get_metadata().index;
        let term = snapshot.get_metadata().term;
        let data = snapshot.data.to_vec();
        info!(self.logger, "installing snapshot from leader"; "index" => index, "term" => term);

        self.storage.apply_snapshot(snapshot)?;
        self.deliver(ApplyMsg::Snapshot { index, term, data })
    }

    fn handle_committed_entries(&mut self, entries: Vec<Entry>) -> ShardKvResult<()> {
        for entry in entries {
            match entry.entry_type() {
                // Empty entries appended on election still occupy an index, so
                // waiters parked on it learn their command was displaced.
                EntryType::EntryNormal => self.deliver(ApplyMsg::Command {
                    index: entry.index,
                    term: entry.term,
                    data: entry.data.to_vec(),
                })?,
                other => {
                    warn!(self.logger, "ignoring committed entry"; "type" => ?other, "index" => entry.index);
                }
            }
        }
        Ok(())
    }

    fn deliver(&self, msg: ApplyMsg) -> ShardKvResult<()> {
        self.apply_tx
            .send(msg)
            .map_err(|_| ShardKvError::ChannelClosed {
                component: format!("applier of raft node {}", self.node_id),
            })
    }

    fn send_messages(&mut self, messages: Vec<Message>) {
        for msg in messages {
            let to = msg.to;
            let is_snapshot = msg.msg_type() == MessageType::MsgSnapshot;
            let delivered = self.router.send(msg);
            if !delivered {
                self.raft_node.report_unreachable(to);
            }
            if is_snapshot {
                let status = if delivered {
                    SnapshotStatus::Finish
                } else {
                    SnapshotStatus::Failure
                };
                self.raft_node.report_snapshot(to, status);
            }
        }
    }

    fn update_status(&self) {
        let raft = &self.raft_node.raft;
        self.status
            .is_leader
            .store(raft.state == StateRole::Leader, Ordering::Release);
        self.status.term.store(raft.term, Ordering::Release);
        self.status
            .log_size
            .store(self.storage.retained(), Ordering::Release);
    }
}

/// Handle to a running [`RaftManager`]
#[derive(Clone)]
pub struct RaftLog {
    proposal_tx: mpsc::UnboundedSender<RaftProposal>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotRequest>,
    status: Arc<RaftStatus>,
}

impl RaftLog {
    /// Term observed at the end of the last ready cycle
    pub fn term(&self) -> u64 {
        self.status.term.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ReplicatedLog for RaftLog {
    async fn propose(&self, data: Vec<u8>) -> ShardKvResult<Option<Proposal>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.proposal_tx
            .send(RaftProposal { data, response_tx })
            .map_err(|_| ShardKvError::ChannelClosed {
                component: "raft proposals".to_string(),
            })?;
        response_rx.await.map_err(|_| ShardKvError::ChannelClosed {
            component: "raft proposal response".to_string(),
        })
    }

    async fn is_leader(&self) -> bool {
        self.status.is_leader.load(Ordering::Acquire)
    }

    fn log_size(&self) -> u64 {
        self.status.log_size.load(Ordering::Acquire)
    }

    async fn snapshot(&self, index: u64, data: Vec<u8>) -> ShardKvResult<()> {
        self.snapshot_tx
            .send(SnapshotRequest { index, data })
            .map_err(|_| ShardKvError::ChannelClosed {
                component: "raft snapshots".to_string(),
            })
    }
}
