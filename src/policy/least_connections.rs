use crate::pool::ServerPool;

/// Picks the backend with the fewest active connections.
///
/// A linear scan per pick; pools are small enough that no index is kept.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }

    pub fn next(&self, pool: &ServerPool) -> Option<String> {
        // min_by_key keeps the first of equal minimums
        pool.servers()
            .iter()
            .min_by_key(|s| s.active_connections)
            .map(|s| s.address.clone())
    }
}
