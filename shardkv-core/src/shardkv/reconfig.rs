//! Reconfiguration driver
//!
//! Leader-only loop that moves the group to the next controller config, one
//! config at a time, and only once every shard is `Serving` again.

use std::sync::Weak;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::common::GroupCommand;
use super::server::ShardKv;
use crate::settings::TimingSettings;
use crate::shardctrler::CtrlerClerk;

pub(crate) async fn run_driver(server: Weak<ShardKv>, mut ctrler: CtrlerClerk, timing: TimingSettings) {
    let mut ticker = interval(timing.config_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(server) = server.upgrade() else {
            return;
        };
        // Keep going while configs apply cleanly so a lagging group catches up.
        while advance(&server, &mut ctrler, timing.request_timeout).await {}
    }
}

/// Propose the next config if this replica leads and the group is settled;
/// true if a config was installed
async fn advance(server: &ShardKv, ctrler: &mut CtrlerClerk, timeout: Duration) -> bool {
    if !server.is_leader().await {
        return false;
    }

    let (num, settled) = server.read(|s| (s.config().num, s.is_settled()));
    if !settled {
        return false;
    }

    let next = match tokio::time::timeout(timeout, ctrler.query(Some(num + 1))).await {
        Ok(next) => next,
        Err(_) => {
            debug!(gid = server.gid(), "controller query timed out");
            return false;
        }
    };
    if next.num != num + 1 {
        return false;
    }

    match server.submit(GroupCommand::ConfigChange(next)).await {
        Ok(_) => {
            info!(gid = server.gid(), num = num + 1, "advanced config");
            true
        }
        Err(e) => {
            debug!(gid = server.gid(), num = num + 1, error = %e, "config change not applied");
            false
        }
    }
}
