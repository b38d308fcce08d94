//! Controller replica

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, Instrument};

use super::common::{CtrlerOp, JoinArgs, LeaveArgs, MoveArgs, QueryArgs};
use super::state_machine::CtrlerState;
use crate::applier::{run_applier, shared, SharedState};
use crate::common::codec;
use crate::error::KvError;
use crate::observability::ctrler_span;
use crate::pipeline::CommandPipeline;
use crate::raft::{ApplyReceiver, ReplicatedLog};
use crate::settings::Settings;
use crate::transport::CtrlerService;
use crate::types::Config;

pub struct ShardCtrler {
    replica: usize,
    state: SharedState<CtrlerState>,
    pipeline: Arc<CommandPipeline<Config>>,
    applier: JoinHandle<()>,
}

impl ShardCtrler {
    /// Start replica `replica` on top of `log`, applying from `apply_rx`
    pub fn start(
        replica: usize,
        log: Arc<dyn ReplicatedLog>,
        apply_rx: ApplyReceiver,
        settings: &Settings,
    ) -> Arc<Self> {
        let name = format!("ctrler-{}", replica);
        let state = shared(CtrlerState::default());
        let pipeline = Arc::new(CommandPipeline::new(
            name.clone(),
            log,
            settings.timing.request_timeout,
        ));

        let applier = tokio::spawn(
            {
                let state = Arc::clone(&state);
                let pipeline = Arc::clone(&pipeline);
                let threshold = settings.log.compaction_threshold;
                async move {
                    if let Err(e) = run_applier(name, state, apply_rx, pipeline, threshold).await {
                        error!(error = %e, "controller applier stopped");
                    }
                }
            }
            .instrument(ctrler_span(replica)),
        );

        Arc::new(Self {
            replica,
            state,
            pipeline,
            applier,
        })
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Latest config this replica has applied; may lag the leader
    pub fn local_config(&self) -> Config {
        self.state.lock().machine.latest().clone()
    }

    /// Every config this replica has applied
    pub fn local_history(&self) -> Vec<Config> {
        self.state.lock().machine.history().to_vec()
    }

    pub fn last_applied(&self) -> u64 {
        self.state.lock().last_applied
    }

    /// Stop applying; used when the replica is crashed
    pub fn kill(&self) {
        self.applier.abort();
    }

    async fn submit(&self, op: CtrlerOp) -> Result<Config, KvError> {
        let data = codec::encode(&op, "controller op").map_err(|e| {
            error!(replica = self.replica, error = %e, "cannot encode controller op");
            KvError::WrongLeader
        })?;
        self.pipeline.submit(data).await
    }
}

#[async_trait]
impl CtrlerService for ShardCtrler {
    async fn query(&self, args: QueryArgs) -> Result<Config, KvError> {
        self.submit(CtrlerOp::Query(args)).await
    }

    async fn join(&self, args: JoinArgs) -> Result<(), KvError> {
        self.submit(CtrlerOp::Join(args)).await.map(|_| ())
    }

    async fn leave(&self, args: LeaveArgs) -> Result<(), KvError> {
        self.submit(CtrlerOp::Leave(args)).await.map(|_| ())
    }

    async fn move_shard(&self, args: MoveArgs) -> Result<(), KvError> {
        self.submit(CtrlerOp::Move(args)).await.map(|_| ())
    }
}

impl Drop for ShardCtrler {
    fn drop(&mut self) {
        self.applier.abort();
    }
}
