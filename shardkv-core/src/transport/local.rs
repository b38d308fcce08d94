//! In-process network
//!
//! Endpoints are plain names registered against a service object. Each
//! endpoint can be switched off to simulate a crashed or partitioned server,
//! and the whole network can be made unreliable: requests and replies are
//! then dropped at random and delivery is delayed a little.

use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{CtrlerService, GroupService};
use crate::error::{KvError, RpcError};

const DROP_REQUEST_PROBABILITY: f64 = 0.1;
const DROP_REPLY_PROBABILITY: f64 = 0.1;
const MAX_UNRELIABLE_DELAY_MS: u64 = 10;

#[derive(Default)]
pub struct LocalNetwork {
    ctrlers: DashMap<String, Arc<dyn CtrlerService>>,
    groups: DashMap<String, Arc<dyn GroupService>>,
    disabled: DashMap<String, ()>,
    unreliable: AtomicBool,
    calls: AtomicU64,
}

fn unreachable(endpoint: &str) -> RpcError {
    RpcError::Unreachable {
        endpoint: endpoint.to_string(),
    }
}

fn chance(probability: f64) -> bool {
    rand::thread_rng().gen_bool(probability)
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_UNRELIABLE_DELAY_MS))
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ctrler(&self, endpoint: impl Into<String>, service: Arc<dyn CtrlerService>) {
        self.ctrlers.insert(endpoint.into(), service);
    }

    pub fn add_group(&self, endpoint: impl Into<String>, service: Arc<dyn GroupService>) {
        self.groups.insert(endpoint.into(), service);
    }

    /// Forget whatever is registered under `endpoint`
    pub fn remove(&self, endpoint: &str) {
        self.ctrlers.remove(endpoint);
        self.groups.remove(endpoint);
    }

    /// Switch an endpoint on or off; calls to a disabled endpoint fail and
    /// replies from it are lost
    pub fn enable(&self, endpoint: &str, enabled: bool) {
        if enabled {
            self.disabled.remove(endpoint);
        } else {
            self.disabled.insert(endpoint.to_string(), ());
        }
    }

    pub fn is_enabled(&self, endpoint: &str) -> bool {
        !self.disabled.contains_key(endpoint)
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.unreliable.store(unreliable, Ordering::Relaxed);
    }

    pub fn is_unreliable(&self) -> bool {
        self.unreliable.load(Ordering::Relaxed)
    }

    /// Number of calls attempted so far
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn call_ctrler<T, F, Fut>(&self, endpoint: &str, call: F) -> Result<T, RpcError>
    where
        F: FnOnce(Arc<dyn CtrlerService>) -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        let service = self.ctrlers.get(endpoint).map(|s| Arc::clone(s.value()));
        self.deliver(endpoint, service, call).await
    }

    pub async fn call_group<T, F, Fut>(&self, endpoint: &str, call: F) -> Result<T, RpcError>
    where
        F: FnOnce(Arc<dyn GroupService>) -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        let service = self.groups.get(endpoint).map(|s| Arc::clone(s.value()));
        self.deliver(endpoint, service, call).await
    }

    async fn deliver<S: ?Sized, T, F, Fut>(
        &self,
        endpoint: &str,
        service: Option<Arc<S>>,
        call: F,
    ) -> Result<T, RpcError>
    where
        F: FnOnce(Arc<S>) -> Fut,
        Fut: Future<Output = Result<T, KvError>>,
    {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let service = match service {
            Some(service) if self.is_enabled(endpoint) => service,
            _ => return Err(unreachable(endpoint)),
        };

        if self.is_unreliable() {
            let delay = jitter();
            tokio::time::sleep(delay).await;
            if chance(DROP_REQUEST_PROBABILITY) {
                trace!(endpoint, "dropping request");
                return Err(unreachable(endpoint));
            }
        }

        let reply = call(service).await;

        if !self.is_enabled(endpoint) {
            return Err(unreachable(endpoint));
        }
        if self.is_unreliable() && chance(DROP_REPLY_PROBABILITY) {
            trace!(endpoint, "dropping reply");
            return Err(unreachable(endpoint));
        }
        reply.map_err(RpcError::Reply)
    }
}
