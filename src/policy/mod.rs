pub mod factory;
pub mod least_connections;
pub mod round_robin;

use crate::pool::ServerPool;

pub use factory::{PolicyFactory, PolicyType};
pub use least_connections::LeastConnections;
pub use round_robin::RoundRobin;

/// The active balancing algorithm. Adding an algorithm means adding a
/// variant here and in [`PolicyType`].
#[derive(Debug)]
pub enum Policy {
    RoundRobin(RoundRobin),
    LeastConnections(LeastConnections),
}

impl Policy {
    pub fn policy_type(&self) -> PolicyType {
        match self {
            Policy::RoundRobin(_) => PolicyType::RoundRobin,
            Policy::LeastConnections(_) => PolicyType::LeastConnections,
        }
    }

    /// Selects a backend and counts a connection against it in one step.
    pub fn next(&mut self, pool: &mut ServerPool) -> Option<String> {
        let address = match self {
            Policy::RoundRobin(policy) => policy.next(pool),
            Policy::LeastConnections(policy) => policy.next(pool),
        }?;

        pool.increment_connection(&address);
        Some(address)
    }

    /// Must be called after the pool changed membership.
    pub fn on_pool_update(&mut self, pool: &ServerPool) {
        match self {
            Policy::RoundRobin(policy) => policy.revalidate(pool),
            Policy::LeastConnections(_) => {}
        }
    }
}
