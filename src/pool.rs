use std::collections::HashSet;

use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerInfo {
    pub address: String,
    pub active_connections: usize,
}

impl ServerInfo {
    pub fn new(address: String) -> Self {
        Self {
            address,
            active_connections: 0,
        }
    }
}

/// Backends known to one balancer, in the order they were first announced.
///
/// Updates are unions: an address missing from an update is kept along with
/// its counter. Addresses are unique within the pool.
#[derive(Debug, Default)]
pub struct ServerPool {
    servers: Vec<ServerInfo>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends every address not already in the pool. Returns how many were added.
    pub fn apply_update<I, S>(&mut self, addresses: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known: HashSet<String> = self.servers.iter().map(|s| s.address.clone()).collect();

        let before = self.servers.len();
        for address in addresses {
            let address = address.into();
            if known.insert(address.clone()) {
                self.servers.push(ServerInfo::new(address));
            }
        }

        self.servers.len() - before
    }

    /// Parses a comma-separated address list as published on the
    /// configuration channel and merges it into the pool.
    pub fn apply_message(&mut self, message: &str) -> usize {
        info!("updating server list: {message}");

        let addresses = message
            .split(',')
            .map(str::trim)
            .filter(|address| !address.is_empty());

        self.apply_update(addresses)
    }

    pub fn increment_connection(&mut self, address: &str) {
        if let Some(server) = self.find_mut(address) {
            server.active_connections += 1;
        }
    }

    pub fn decrement_connection(&mut self, address: &str) {
        if let Some(server) = self.find_mut(address) {
            server.active_connections = server.active_connections.saturating_sub(1);
        }
    }

    pub fn get(&self, index: usize) -> Option<&ServerInfo> {
        self.servers.get(index)
    }

    pub fn find(&self, address: &str) -> Option<&ServerInfo> {
        self.servers.iter().find(|s| s.address == address)
    }

    fn find_mut(&mut self, address: &str) -> Option<&mut ServerInfo> {
        self.servers.iter_mut().find(|s| s.address == address)
    }

    pub fn connections(&self, address: &str) -> Option<usize> {
        self.find(address).map(|s| s.active_connections)
    }

    pub fn servers(&self) -> &[ServerInfo] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
