//! Apply loop shared by the controller and the storage groups
//!
//! Every replica runs exactly one applier. It consumes the apply stream in
//! order, executes each command against the replica's [`StateMachine`],
//! resolves the matching pipeline waiter and, once the retained log grows
//! past the compaction threshold, hands a snapshot back to the log.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::common::codec;
use crate::error::{KvError, ShardKvResult};
use crate::pipeline::CommandPipeline;
use crate::raft::{ApplyMsg, ApplyReceiver, ReplicatedLog};

/// Deterministic state replicated through the log
pub trait StateMachine: Send + 'static {
    type Command: DeserializeOwned + Send;
    type Output: Send + 'static;

    /// Execute one committed command
    fn apply(&mut self, command: Self::Command) -> Result<Self::Output, KvError>;

    /// Encode the full state
    fn snapshot(&self) -> ShardKvResult<Vec<u8>>;

    /// Replace the full state with a decoded snapshot
    fn restore(&mut self, data: &[u8]) -> ShardKvResult<()>;
}

/// A state machine together with the last log index folded into it
#[derive(Debug, Default)]
pub struct Applied<S> {
    pub machine: S,
    pub last_applied: u64,
}

pub type SharedState<S> = Arc<Mutex<Applied<S>>>;

pub fn shared<S>(machine: S) -> SharedState<S> {
    Arc::new(Mutex::new(Applied {
        machine,
        last_applied: 0,
    }))
}

/// Consume `apply_rx` until the log closes it.
///
/// A command that fails to decode means the replicas no longer agree on the
/// log contents; the applier stops with an error.
pub async fn run_applier<S: StateMachine>(
    name: String,
    state: SharedState<S>,
    mut apply_rx: ApplyReceiver,
    pipeline: Arc<CommandPipeline<S::Output>>,
    compaction_threshold: u64,
) -> ShardKvResult<()> {
    let log: Arc<dyn ReplicatedLog> = Arc::clone(pipeline.log());
    let mut snapshot_index = 0u64;

    while let Some(msg) = apply_rx.recv().await {
        match msg {
            ApplyMsg::Command { index, term, data } => {
                let reply = {
                    let mut guard = state.lock();
                    if index <= guard.last_applied {
                        continue;
                    }
                    guard.last_applied = index;
                    if data.is_empty() {
                        None
                    } else {
                        let command: S::Command = codec::decode(&data, "replicated command")
                            .map_err(|e| {
                                error!(participant = %name, index, error = %e, "undecodable log entry");
                                e
                            })?;
                        Some(guard.machine.apply(command))
                    }
                };
                pipeline.notify(index, term, reply).await;

                if compaction_threshold > 0
                    && index > snapshot_index
                    && log.log_size() >= compaction_threshold
                {
                    let data = state.lock().machine.snapshot()?;
                    log.snapshot(index, data).await?;
                    snapshot_index = index;
                    debug!(participant = %name, index, "snapshot taken");
                }
            }
            ApplyMsg::Snapshot { index, data, .. } => {
                {
                    let mut guard = state.lock();
                    if index <= guard.last_applied {
                        continue;
                    }
                    guard.machine.restore(&data)?;
                    guard.last_applied = index;
                }
                snapshot_index = snapshot_index.max(index);
                pipeline.fail_through(index).await;
                info!(participant = %name, index, "restored snapshot");
            }
        }
    }

    debug!(participant = %name, "apply stream closed");
    Ok(())
}
