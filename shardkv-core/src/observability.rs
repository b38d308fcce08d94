//! Tracing setup and span helpers

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::types::GroupId;

/// Initialize tracing. `RUST_LOG` takes precedence over `default_level`.
pub fn init_tracing(default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "shardkv={level},shardkv_core={level},raft=warn",
            level = default_level
        ))
    });

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true);

    // A second call (e.g. from tests) keeps the first subscriber.
    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}

/// Span for work done on behalf of one storage group replica
#[inline]
pub fn group_span(gid: GroupId, replica: usize) -> Span {
    tracing::debug_span!("group", gid = gid, replica = replica)
}

/// Span for work done on behalf of one controller replica
#[inline]
pub fn ctrler_span(replica: usize) -> Span {
    tracing::debug_span!("ctrler", replica = replica)
}
