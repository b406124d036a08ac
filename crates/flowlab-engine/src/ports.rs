use flowlab_abstract::{ConfigError, FlowKind};
use std::collections::HashMap;
use tracing::debug;

/// Round-robin pool of target ports on the remote endpoint.
///
/// Owned by the scheduler's coordinating loop. A port is never handed to two
/// in-flight flows of the same kind while a free one exists; once every port is
/// busy for a kind, assignment falls back to sharing.
#[derive(Debug)]
pub struct PortPool {
    base: u16,
    size: u16,
    cursor: u16,
    leases: HashMap<(FlowKind, u16), u32>,
}

impl PortPool {
    pub fn new(base: u16, size: u16) -> Result<Self, ConfigError> {
        if size > 0 && u32::from(base) + u32::from(size) - 1 > u32::from(u16::MAX) {
            return Err(ConfigError::PortRangeOverflow { base, count: size });
        }
        Ok(Self {
            base,
            size,
            cursor: 0,
            leases: HashMap::new(),
        })
    }

    /// Assign a port to a new flow of `kind`. `None` only for an empty pool.
    pub fn acquire(&mut self, kind: FlowKind) -> Option<u16> {
        if self.size == 0 {
            return None;
        }

        let size = u32::from(self.size);
        let start = u32::from(self.cursor);
        let mut chosen = None;
        for step in 0..size {
            let offset = (start + step) % size;
            let port = self.port_at(offset);
            if !self.leases.contains_key(&(kind, port)) {
                chosen = Some((offset, port));
                break;
            }
        }

        let (offset, port) = chosen.unwrap_or_else(|| {
            let port = self.port_at(start);
            debug!(%kind, port, in_use = self.in_use(kind), "all ports busy, sharing port");
            (start, port)
        });
        // offset < size <= u16::MAX
        self.cursor = ((offset + 1) % size) as u16;
        *self.leases.entry((kind, port)).or_insert(0) += 1;
        Some(port)
    }

    /// `offset` is below `size`, and `new` checked that the range ends by 65535.
    fn port_at(&self, offset: u32) -> u16 {
        (u32::from(self.base) + offset) as u16
    }

    pub fn release(&mut self, kind: FlowKind, port: u16) {
        if let Some(count) = self.leases.get_mut(&(kind, port)) {
            *count -= 1;
            if *count == 0 {
                self.leases.remove(&(kind, port));
            }
        }
    }

    pub fn in_use(&self, kind: FlowKind) -> usize {
        self.leases.keys().filter(|(k, _)| *k == kind).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_ports_round_robin() {
        let mut pool = PortPool::new(5201, 3).unwrap();
        let ports: Vec<_> = (0..3).map(|_| pool.acquire(FlowKind::Mice).unwrap()).collect();
        assert_eq!(ports, vec![5201, 5202, 5203]);
    }

    #[test]
    fn skips_ports_busy_for_the_same_kind() {
        let mut pool = PortPool::new(5201, 3).unwrap();
        let first = pool.acquire(FlowKind::Mice).unwrap();
        let second = pool.acquire(FlowKind::Mice).unwrap();
        pool.release(FlowKind::Mice, first);

        // cursor points at 5203, then wraps to the released 5201
        assert_eq!(pool.acquire(FlowKind::Mice), Some(5203));
        assert_eq!(pool.acquire(FlowKind::Mice), Some(5201));
        assert_ne!(second, 5201);
    }

    #[test]
    fn kinds_do_not_block_each_other() {
        let mut pool = PortPool::new(6000, 1).unwrap();
        assert_eq!(pool.acquire(FlowKind::Mice), Some(6000));
        assert_eq!(pool.acquire(FlowKind::Elephant), Some(6000));
        assert_eq!(pool.in_use(FlowKind::Mice), 1);
        assert_eq!(pool.in_use(FlowKind::Elephant), 1);
    }

    #[test]
    fn shares_when_exhausted_and_releases_by_count() {
        let mut pool = PortPool::new(7000, 2).unwrap();
        pool.acquire(FlowKind::Mice);
        pool.acquire(FlowKind::Mice);
        let shared = pool.acquire(FlowKind::Mice).unwrap();
        assert!(shared == 7000 || shared == 7001);

        pool.release(FlowKind::Mice, shared);
        assert_eq!(pool.in_use(FlowKind::Mice), 2);
        pool.release(FlowKind::Mice, shared);
        assert_eq!(pool.in_use(FlowKind::Mice), 1);
    }

    #[test]
    fn empty_pool_assigns_nothing() {
        let mut pool = PortPool::new(5201, 0).unwrap();
        assert_eq!(pool.acquire(FlowKind::Elephant), None);
    }

    #[test]
    fn wraps_large_pools_without_overflow() {
        let mut pool = PortPool::new(1, 40_000).unwrap();
        for _ in 0..39_999 {
            pool.acquire(FlowKind::Mice);
        }
        assert_eq!(pool.acquire(FlowKind::Mice), Some(40_000));
        assert_eq!(pool.in_use(FlowKind::Mice), 40_000);

        pool.release(FlowKind::Mice, 1);
        assert_eq!(pool.acquire(FlowKind::Mice), Some(1));
    }

    #[test]
    fn rejects_ranges_past_the_last_port() {
        assert_eq!(
            PortPool::new(65530, 10).unwrap_err(),
            ConfigError::PortRangeOverflow {
                base: 65530,
                count: 10
            }
        );
        assert!(PortPool::new(65535, 1).is_ok());
    }
}
