//! In-process deployment
//!
//! Builds a controller and a set of storage groups from [`Settings`], wires
//! them to one [`LocalNetwork`] and exposes failure injection for tests and
//! the CLI: partitions for both log backends, and leader changes, crashes
//! and restarts for the in-memory one.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{ShardKvError, ShardKvResult};
use crate::raft::{ApplyReceiver, MemoryLogCluster, RaftManager, RaftRouter, ReplicatedLog};
use crate::settings::{LogBackend, Settings};
use crate::shardctrler::{CtrlerClerk, ShardCtrler};
use crate::shardkv::{Clerk, ShardKv};
use crate::transport::LocalNetwork;
use crate::types::GroupId;

/// Replicated log shared by the replicas of one participant
enum LogGroup {
    Memory(MemoryLogCluster),
    Raft {
        router: RaftRouter,
        managers: Vec<JoinHandle<()>>,
    },
}

impl LogGroup {
    fn start(
        name: &str,
        replicas: usize,
        settings: &Settings,
    ) -> ShardKvResult<(Self, Vec<(Arc<dyn ReplicatedLog>, ApplyReceiver)>)> {
        match settings.log.backend {
            LogBackend::Memory => {
                let cluster = MemoryLogCluster::new(name, replicas);
                let mut endpoints = Vec::with_capacity(replicas);
                for replica in 0..replicas {
                    let log: Arc<dyn ReplicatedLog> = Arc::new(cluster.replica(replica));
                    endpoints.push((log, cluster.subscribe(replica)?));
                }
                Ok((LogGroup::Memory(cluster), endpoints))
            }
            LogBackend::Raft => {
                let router = RaftRouter::new();
                let voters: Vec<u64> = (1..=replicas as u64).collect();
                let mut managers = Vec::with_capacity(replicas);
                let mut endpoints = Vec::with_capacity(replicas);
                for node_id in voters.iter().copied() {
                    let (manager, log, apply_rx) =
                        RaftManager::new(name, node_id, voters.clone(), &settings.log, &router)?;
                    let participant = name.to_string();
                    managers.push(tokio::spawn(async move {
                        if let Err(e) = manager.run().await {
                            error!(participant = %participant, node_id, error = %e, "raft node stopped");
                        }
                    }));
                    let log: Arc<dyn ReplicatedLog> = Arc::new(log);
                    endpoints.push((log, apply_rx));
                }
                Ok((LogGroup::Raft { router, managers }, endpoints))
            }
        }
    }

    fn memory(&self) -> ShardKvResult<&MemoryLogCluster> {
        match self {
            LogGroup::Memory(cluster) => Ok(cluster),
            LogGroup::Raft { .. } => Err(ShardKvError::ConfigError(
                "operation requires the memory log backend".to_string(),
            )),
        }
    }

    fn disconnect(&self, replica: usize) {
        match self {
            LogGroup::Memory(cluster) => cluster.disconnect(replica),
            LogGroup::Raft { router, .. } => router.disconnect(replica as u64 + 1),
        }
    }

    fn connect(&self, replica: usize) {
        match self {
            LogGroup::Memory(cluster) => cluster.connect(replica),
            LogGroup::Raft { router, .. } => router.connect(replica as u64 + 1),
        }
    }
}

impl Drop for LogGroup {
    fn drop(&mut self) {
        if let LogGroup::Raft { managers, .. } = self {
            for manager in managers.drain(..) {
                manager.abort();
            }
        }
    }
}

struct CtrlerCluster {
    log: LogGroup,
    servers: Vec<String>,
    replicas: Vec<Arc<ShardCtrler>>,
}

struct GroupCluster {
    log: LogGroup,
    servers: Vec<String>,
    replicas: Vec<Option<Arc<ShardKv>>>,
}

pub fn ctrler_endpoint(replica: usize) -> String {
    format!("ctrler-{}", replica)
}

pub fn group_endpoint(gid: GroupId, replica: usize) -> String {
    format!("group-{}-{}", gid, replica)
}

/// A controller plus storage groups running in this process
pub struct LocalCluster {
    settings: Settings,
    network: Arc<LocalNetwork>,
    ctrler: CtrlerCluster,
    groups: BTreeMap<GroupId, GroupCluster>,
}

impl LocalCluster {
    /// Start every participant listed in `settings.deployment`. Groups are
    /// running but own nothing until they are joined through the controller.
    pub fn start(settings: Settings) -> ShardKvResult<Self> {
        settings.validate()?;
        let network = Arc::new(LocalNetwork::new());

        let replicas = settings.deployment.controller_replicas;
        let (log, endpoints) = LogGroup::start("ctrler", replicas, &settings)?;
        let servers: Vec<String> = (0..replicas).map(ctrler_endpoint).collect();
        let mut ctrlers = Vec::with_capacity(replicas);
        for (replica, (replica_log, apply_rx)) in endpoints.into_iter().enumerate() {
            let server = ShardCtrler::start(replica, replica_log, apply_rx, &settings);
            network.add_ctrler(servers[replica].clone(), server.clone());
            ctrlers.push(server);
        }
        let ctrler = CtrlerCluster {
            log,
            servers,
            replicas: ctrlers,
        };

        let mut cluster = Self {
            settings,
            network,
            ctrler,
            groups: BTreeMap::new(),
        };
        let groups = cluster.settings.deployment.groups.clone();
        for group in groups {
            cluster.start_group(group.gid, group.replicas)?;
        }

        info!(
            backend = ?cluster.settings.log.backend,
            groups = ?cluster.groups.keys().collect::<Vec<_>>(),
            "local cluster started"
        );
        Ok(cluster)
    }

    fn start_group(&mut self, gid: GroupId, replicas: usize) -> ShardKvResult<()> {
        let (log, endpoints) = LogGroup::start(&format!("group-{}", gid), replicas, &self.settings)?;
        let servers: Vec<String> = (0..replicas).map(|r| group_endpoint(gid, r)).collect();
        let mut started = Vec::with_capacity(replicas);
        for (replica, (replica_log, apply_rx)) in endpoints.into_iter().enumerate() {
            let server = ShardKv::start(
                gid,
                replica,
                replica_log,
                apply_rx,
                Arc::clone(&self.network),
                self.ctrler.servers.clone(),
                &self.settings,
            );
            self.network.add_group(servers[replica].clone(), server.clone());
            started.push(Some(server));
        }
        self.groups.insert(
            gid,
            GroupCluster {
                log,
                servers,
                replicas: started,
            },
        );
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn network(&self) -> Arc<LocalNetwork> {
        Arc::clone(&self.network)
    }

    pub fn ctrler_servers(&self) -> Vec<String> {
        self.ctrler.servers.clone()
    }

    pub fn gids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    fn group(&self, gid: GroupId) -> ShardKvResult<&GroupCluster> {
        self.groups.get(&gid).ok_or_else(|| ShardKvError::ReplicaNotFound {
            name: format!("group-{}", gid),
        })
    }

    /// Replica endpoints of `gid`, as passed to `Join`
    pub fn group_servers(&self, gid: GroupId) -> ShardKvResult<Vec<String>> {
        Ok(self.group(gid)?.servers.clone())
    }

    /// Join arguments for `gids`
    pub fn join_args(&self, gids: &[GroupId]) -> ShardKvResult<BTreeMap<GroupId, Vec<String>>> {
        gids.iter()
            .map(|gid| Ok((*gid, self.group_servers(*gid)?)))
            .collect()
    }

    pub fn ctrler_clerk(&self) -> CtrlerClerk {
        CtrlerClerk::new(
            self.network(),
            self.ctrler_servers(),
            self.settings.timing.client_retry_delay,
        )
    }

    pub fn clerk(&self) -> Clerk {
        Clerk::new(
            self.network(),
            self.ctrler_servers(),
            self.settings.timing.client_retry_delay,
        )
    }

    pub fn ctrler(&self, replica: usize) -> Option<Arc<ShardCtrler>> {
        self.ctrler.replicas.get(replica).cloned()
    }

    /// Running replica `replica` of `gid`
    pub fn server(&self, gid: GroupId, replica: usize) -> Option<Arc<ShardKv>> {
        self.groups
            .get(&gid)
            .and_then(|g| g.replicas.get(replica))
            .and_then(|r| r.clone())
    }

    /// Every running replica of `gid`
    pub fn servers(&self, gid: GroupId) -> Vec<Arc<ShardKv>> {
        self.groups
            .get(&gid)
            .map(|g| g.replicas.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Isolate a group replica from its peers and from clients
    pub fn disconnect(&self, gid: GroupId, replica: usize) -> ShardKvResult<()> {
        let group = self.group(gid)?;
        group.log.disconnect(replica);
        self.network.enable(&group_endpoint(gid, replica), false);
        Ok(())
    }

    pub fn connect(&self, gid: GroupId, replica: usize) -> ShardKvResult<()> {
        let group = self.group(gid)?;
        group.log.connect(replica);
        self.network.enable(&group_endpoint(gid, replica), true);
        Ok(())
    }

    /// Make `replica` the leader of `gid` (memory backend)
    pub fn elect(&self, gid: GroupId, replica: usize) -> ShardKvResult<u64> {
        Ok(self.group(gid)?.log.memory()?.elect(replica))
    }

    /// Make `replica` the controller leader (memory backend)
    pub fn elect_ctrler(&self, replica: usize) -> ShardKvResult<u64> {
        Ok(self.ctrler.log.memory()?.elect(replica))
    }

    /// Stop a group replica and drop its in-memory state (memory backend)
    pub fn crash(&mut self, gid: GroupId, replica: usize) -> ShardKvResult<()> {
        let group = self
            .groups
            .get_mut(&gid)
            .ok_or_else(|| ShardKvError::ReplicaNotFound {
                name: format!("group-{}", gid),
            })?;
        let log = group.log.memory()?.clone();
        let endpoint = group_endpoint(gid, replica);

        if let Some(server) = group.replicas.get_mut(replica).and_then(Option::take) {
            server.kill();
        }
        log.crash(replica);
        self.network.remove(&endpoint);
        info!(gid, replica, "crashed replica");
        Ok(())
    }

    /// Restart a crashed replica; it rebuilds its state from the latest
    /// snapshot and the log (memory backend)
    pub fn restart(&mut self, gid: GroupId, replica: usize) -> ShardKvResult<()> {
        let ctrler_servers = self.ctrler.servers.clone();
        let group = self
            .groups
            .get_mut(&gid)
            .ok_or_else(|| ShardKvError::ReplicaNotFound {
                name: format!("group-{}", gid),
            })?;
        let log = group.log.memory()?.clone();
        let slot = group
            .replicas
            .get_mut(replica)
            .ok_or_else(|| ShardKvError::ReplicaNotFound {
                name: group_endpoint(gid, replica),
            })?;
        if let Some(old) = slot.take() {
            old.kill();
        }

        let apply_rx = log.subscribe(replica)?;
        let server = ShardKv::start(
            gid,
            replica,
            Arc::new(log.replica(replica)),
            apply_rx,
            Arc::clone(&self.network),
            ctrler_servers,
            &self.settings,
        );
        self.network
            .add_group(group_endpoint(gid, replica), server.clone());
        *slot = Some(server);
        info!(gid, replica, "restarted replica");
        Ok(())
    }

    /// Snapshot index of `gid`'s log (memory backend)
    pub fn snapshot_index(&self, gid: GroupId) -> ShardKvResult<u64> {
        Ok(self.group(gid)?.log.memory()?.snapshot_index())
    }

    /// Stop every replica
    pub fn shutdown(&mut self) {
        for ctrler in &self.ctrler.replicas {
            ctrler.kill();
        }
        for group in self.groups.values_mut() {
            for server in group.replicas.iter_mut().filter_map(Option::take) {
                server.kill();
            }
        }
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
