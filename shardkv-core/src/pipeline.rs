//! Propose-and-wait for replicated commands
//!
//! A handler submits an encoded command, the pipeline proposes it to the
//! replica's log and parks a waiter under the returned index. When the
//! applier reaches that index it hands the result back. A waiter only accepts
//! the result if the entry applied there carries the term it was proposed in;
//! otherwise another leader's entry took the slot and the caller sees
//! `WrongLeader`.
//!
//! No lock is held while proposing. The applier may reach an index before the
//! proposal that produced it returns, so results for unclaimed indexes are
//! kept while any proposal is outstanding and picked up when it binds.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::KvError;
use crate::raft::ReplicatedLog;

struct Waiter<T> {
    term: u64,
    token: u64,
    tx: oneshot::Sender<Result<T, KvError>>,
}

/// Result of one command as produced by the state machine
pub type Applied<T> = Result<T, KvError>;

struct Waiters<T> {
    bound: HashMap<u64, Waiter<T>>,
    /// Proposals that have not yet learned their index
    proposing: usize,
    /// Results applied while a proposal was outstanding, by index
    early: HashMap<u64, (u64, Option<Applied<T>>)>,
    /// Highest index replaced by a snapshot
    failed_through: u64,
}

impl<T> Waiters<T> {
    fn new() -> Self {
        Self {
            bound: HashMap::new(),
            proposing: 0,
            early: HashMap::new(),
            failed_through: 0,
        }
    }
}

/// Counts one outstanding proposal for as long as it lives
struct Proposing<'a, T> {
    waiters: &'a Mutex<Waiters<T>>,
}

impl<'a, T> Proposing<'a, T> {
    fn start(waiters: &'a Mutex<Waiters<T>>) -> Self {
        waiters.lock().proposing += 1;
        Self { waiters }
    }
}

impl<T> Drop for Proposing<'_, T> {
    fn drop(&mut self) {
        let mut waiters = self.waiters.lock();
        waiters.proposing -= 1;
        if waiters.proposing == 0 {
            waiters.early.clear();
        }
    }
}

fn resolve<T>(proposed_term: u64, applied_term: u64, reply: Option<Applied<T>>) -> Applied<T> {
    match reply {
        Some(reply) if proposed_term == applied_term => reply,
        _ => Err(KvError::WrongLeader),
    }
}

pub struct CommandPipeline<T> {
    name: String,
    log: Arc<dyn ReplicatedLog>,
    timeout: Duration,
    next_token: AtomicU64,
    waiters: Mutex<Waiters<T>>,
}

impl<T: Send + 'static> CommandPipeline<T> {
    pub fn new(name: impl Into<String>, log: Arc<dyn ReplicatedLog>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            log,
            timeout,
            next_token: AtomicU64::new(0),
            waiters: Mutex::new(Waiters::new()),
        }
    }

    pub fn log(&self) -> &Arc<dyn ReplicatedLog> {
        &self.log
    }

    /// Replicate `command` and wait for the state machine's result
    pub async fn submit(&self, command: Vec<u8>) -> Result<T, KvError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let proposing = Proposing::start(&self.waiters);
        let proposal = match self.log.propose(command).await {
            Ok(Some(proposal)) => proposal,
            Ok(None) => return Err(KvError::WrongLeader),
            Err(e) => {
                warn!(participant = %self.name, error = %e, "proposal failed");
                return Err(KvError::WrongLeader);
            }
        };
        let early = {
            let mut waiters = self.waiters.lock();
            match waiters.early.remove(&proposal.index) {
                Some(early) => Some(early),
                None if proposal.index <= waiters.failed_through => {
                    Some((proposal.term, Some(Err(KvError::WrongLeader))))
                }
                None => {
                    // An older waiter on this index belongs to a lost
                    // proposal; dropping its sender fails it with WrongLeader.
                    waiters.bound.insert(
                        proposal.index,
                        Waiter {
                            term: proposal.term,
                            token,
                            tx,
                        },
                    );
                    None
                }
            }
        };
        drop(proposing);
        if let Some((term, reply)) = early {
            return resolve(proposal.term, term, reply);
        }

        let index = proposal.index;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(KvError::WrongLeader),
            Err(_) => {
                let mut waiters = self.waiters.lock();
                if waiters.bound.get(&index).map(|w| w.token) == Some(token) {
                    waiters.bound.remove(&index);
                }
                debug!(participant = %self.name, index, "command timed out");
                Err(KvError::Timeout)
            }
        }
    }

    /// Deliver the outcome of the entry applied at `index`. `None` marks an
    /// entry that carried no command.
    pub async fn notify(&self, index: u64, term: u64, reply: Option<Applied<T>>) {
        let mut waiters = self.waiters.lock();
        if let Some(waiter) = waiters.bound.remove(&index) {
            let _ = waiter.tx.send(resolve(waiter.term, term, reply));
        } else if waiters.proposing > 0 {
            waiters.early.insert(index, (term, reply));
        }
    }

    /// Fail every waiter at or below `index`; used when a snapshot replaces
    /// the entries they were waiting for
    pub async fn fail_through(&self, index: u64) {
        let mut waiters = self.waiters.lock();
        waiters.bound.retain(|waiter_index, _| *waiter_index > index);
        waiters.failed_through = waiters.failed_through.max(index);
    }

    #[cfg(test)]
    async fn pending(&self) -> usize {
        self.waiters.lock().bound.len()
    }

    #[cfg(test)]
    fn proposing(&self) -> usize {
        self.waiters.lock().proposing
    }
}
