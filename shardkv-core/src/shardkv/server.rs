//! Storage group replica
//!
//! Each replica runs three tasks next to its RPC handlers: the applier, the
//! reconfiguration driver and the shard migration engine. Only the applier
//! writes the group state; the others read it and propose commands.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, Instrument};

use super::common::{GetArgs, GroupCommand, PullShardArgs, PullShardReply, PutAppendArgs, ShardGcArgs};
use super::migration::run_migration;
use super::reconfig::run_driver;
use super::state_machine::GroupState;
use crate::applier::{run_applier, shared, SharedState};
use crate::common::codec;
use crate::error::KvError;
use crate::observability::group_span;
use crate::pipeline::CommandPipeline;
use crate::raft::{ApplyReceiver, ReplicatedLog};
use crate::settings::Settings;
use crate::shardctrler::CtrlerClerk;
use crate::transport::{GroupService, LocalNetwork};
use crate::types::{key2shard, GroupId, ShardId};

pub struct ShardKv {
    gid: GroupId,
    replica: usize,
    state: SharedState<GroupState>,
    pipeline: Arc<CommandPipeline<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardKv {
    /// Start replica `replica` of group `gid` and its background tasks
    pub fn start(
        gid: GroupId,
        replica: usize,
        log: Arc<dyn ReplicatedLog>,
        apply_rx: ApplyReceiver,
        network: Arc<LocalNetwork>,
        ctrler_servers: Vec<String>,
        settings: &Settings,
    ) -> Arc<Self> {
        let name = format!("group-{}-{}", gid, replica);
        let state = shared(GroupState::new(gid));
        let pipeline = Arc::new(CommandPipeline::new(
            name.clone(),
            log,
            settings.timing.request_timeout,
        ));

        let server = Arc::new(Self {
            gid,
            replica,
            state: Arc::clone(&state),
            pipeline: Arc::clone(&pipeline),
            tasks: Mutex::new(Vec::new()),
        });

        let threshold = settings.log.compaction_threshold;
        let applier = tokio::spawn(
            async move {
                if let Err(e) = run_applier(name, state, apply_rx, pipeline, threshold).await {
                    error!(error = %e, "group applier stopped");
                }
            }
            .instrument(group_span(gid, replica)),
        );

        let ctrler = CtrlerClerk::new(
            Arc::clone(&network),
            ctrler_servers,
            settings.timing.client_retry_delay,
        );
        let driver = tokio::spawn(
            run_driver(Arc::downgrade(&server), ctrler, settings.timing.clone())
                .instrument(group_span(gid, replica)),
        );
        let migration = tokio::spawn(
            run_migration(
                Arc::downgrade(&server),
                network,
                settings.timing.migration_interval,
            )
            .instrument(group_span(gid, replica)),
        );

        server.tasks.lock().extend([applier, driver, migration]);
        server
    }

    pub fn gid(&self) -> GroupId {
        self.gid
    }

    pub fn replica(&self) -> usize {
        self.replica
    }

    pub async fn is_leader(&self) -> bool {
        self.pipeline.log().is_leader().await
    }

    /// Run `f` against the current group state
    pub fn read<R>(&self, f: impl FnOnce(&GroupState) -> R) -> R {
        f(&self.state.lock().machine)
    }

    pub fn last_applied(&self) -> u64 {
        self.state.lock().last_applied
    }

    /// Stop every task of this replica; used when the replica is crashed
    pub fn kill(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub(crate) async fn submit(&self, command: GroupCommand) -> Result<String, KvError> {
        let data = codec::encode(&command, "group command").map_err(|e| {
            error!(gid = self.gid, replica = self.replica, error = %e, "cannot encode group command");
            KvError::WrongLeader
        })?;
        self.pipeline.submit(data).await
    }

    /// Reject client requests that are bound to fail before they reach the log
    async fn precheck(&self, shard: ShardId) -> Result<(), KvError> {
        if !self.is_leader().await {
            return Err(KvError::WrongLeader);
        }
        self.read(|s| s.check_shard(shard))
    }
}

#[async_trait]
impl GroupService for ShardKv {
    async fn get(&self, args: GetArgs) -> Result<String, KvError> {
        self.precheck(key2shard(&args.key)).await?;
        self.submit(GroupCommand::Get(args)).await
    }

    async fn put_append(&self, args: PutAppendArgs) -> Result<(), KvError> {
        self.precheck(key2shard(&args.key)).await?;
        self.submit(GroupCommand::PutAppend(args)).await.map(|_| ())
    }

    async fn pull_shard(&self, args: PullShardArgs) -> Result<PullShardReply, KvError> {
        if !self.is_leader().await {
            return Err(KvError::WrongLeader);
        }
        self.read(|s| s.export_shard(args.shard, args.config_num))
    }

    async fn shard_gc(&self, args: ShardGcArgs) -> Result<(), KvError> {
        if !self.is_leader().await {
            return Err(KvError::WrongLeader);
        }
        let num = self.read(|s| s.config().num);
        if num > args.config_num {
            // Already moved past the hand-off, so the shard is gone.
            return Ok(());
        }
        if num < args.config_num {
            return Err(KvError::ShardNotReady);
        }
        self.submit(GroupCommand::GcShard {
            shard: args.shard,
            config_num: args.config_num,
        })
        .await
        .map(|_| ())
    }
}

impl Drop for ShardKv {
    fn drop(&mut self) {
        self.kill();
    }
}
