use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Deserialize;
use tracing::info;

use crate::{
    error::BalancerError,
    metrics,
    policy::{Policy, PolicyFactory, PolicyType},
    pool::ServerPool,
    utils,
};

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Algorithm a worker boots with.
    pub policy: PolicyType,
    /// How often the configuration channel is polled for an algorithm switch.
    #[serde(with = "utils::serde_millis")]
    pub policy_check_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: PolicyType::RoundRobin,
            policy_check_interval: Duration::from_secs(10),
        }
    }
}

/// The load-balancing engine of one worker: a server pool and the active
/// algorithm picking from it.
#[derive(Debug)]
pub struct Balancer {
    pool: ServerPool,
    policy: Policy,
}

impl Balancer {
    pub fn new(policy: PolicyType) -> Self {
        Self {
            pool: ServerPool::new(),
            policy: PolicyFactory::make(policy),
        }
    }

    pub fn policy_type(&self) -> PolicyType {
        self.policy.policy_type()
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    /// Picks a backend and counts it as in use. `None` means no backend is
    /// known yet.
    pub fn next_server(&mut self) -> Option<String> {
        self.policy.next(&mut self.pool)
    }

    /// Must be called once for every address returned by `next_server`.
    pub fn release_server(&mut self, address: &str) {
        self.pool.decrement_connection(address);
    }

    pub fn on_server_list_update(&mut self, message: &str) {
        let added = self.pool.apply_message(message);
        if added > 0 {
            self.policy.on_pool_update(&self.pool);
        }
    }

    /// Resolves a switch request against the active algorithm.
    ///
    /// `Ok(None)` means the requested algorithm is already active.
    pub fn plan_switch(&self, requested: &str) -> Result<Option<PolicyType>, BalancerError> {
        if requested == self.policy_type().name() {
            return Ok(None);
        }

        requested.parse().map(Some)
    }

    /// Replaces the algorithm and starts over with an empty pool. Connection
    /// counters of the old pool are dropped.
    pub fn switch_to(&mut self, policy: PolicyType) {
        info!("switching policy from {} to {}", self.policy_type(), policy);

        self.pool = ServerPool::new();
        self.policy = PolicyFactory::make(policy);

        metrics::POLICY_SWITCHES_COUNT
            .with_label_values(&[policy.name()])
            .inc();
    }
}

/// A balancer shared between the dispatch server and the configuration
/// channel tasks of one worker.
///
/// Every method takes the lock for a synchronous section only, so callers
/// never hold it across an await point.
#[derive(Clone, Debug)]
pub struct SharedBalancer(Arc<Mutex<Balancer>>);

impl SharedBalancer {
    pub fn new(balancer: Balancer) -> Self {
        Self(Arc::new(Mutex::new(balancer)))
    }

    pub fn lock(&self) -> MutexGuard<'_, Balancer> {
        // a panic while holding the lock leaves the balancer consistent
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_server(&self) -> Option<String> {
        self.lock().next_server()
    }

    pub fn release_server(&self, address: &str) {
        self.lock().release_server(address)
    }

    pub fn on_server_list_update(&self, message: &str) {
        self.lock().on_server_list_update(message)
    }
}
