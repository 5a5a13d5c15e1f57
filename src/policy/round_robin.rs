use crate::pool::ServerPool;

/// Hands out backends in pool order, wrapping around at the end.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the cursor if the pool no longer reaches it.
    pub fn revalidate(&mut self, pool: &ServerPool) {
        if self.next >= pool.len() {
            self.next = 0;
        }
    }

    pub fn next(&mut self, pool: &ServerPool) -> Option<String> {
        if pool.is_empty() {
            return None;
        }
        self.revalidate(pool);

        let server = pool.get(self.next)?;
        self.next = (self.next + 1) % pool.len();

        Some(server.address.clone())
    }
}
