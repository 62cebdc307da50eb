//! Client registry
//!
//! Bounded set of addresses that completed registration. Entries are
//! deduplicated by IP and never removed while the server runs.

use std::net::IpAddr;

use parking_lot::Mutex;
use tracing::{info, warn};

/// Outcome of [`ClientRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    AlreadyPresent,
    /// Capacity reached; the client is still served but not tracked
    Full,
}

#[derive(Debug)]
pub struct ClientRegistry {
    clients: Mutex<Vec<IpAddr>>,
    capacity: usize,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            clients: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn register(&self, address: IpAddr) -> Registration {
        let mut clients = self.clients.lock();

        if clients.contains(&address) {
            return Registration::AlreadyPresent;
        }

        if clients.len() >= self.capacity {
            warn!("client registry full ({} entries), not tracking {}", self.capacity, address);
            return Registration::Full;
        }

        clients.push(address);
        info!("client registered: {}", address);
        Registration::Added
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.clients.lock().contains(address)
    }

    /// Registered addresses in registration order
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.clients.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_register_deduplicates() {
        let registry = ClientRegistry::new(3);
        assert_eq!(registry.register(ip(1)), Registration::Added);
        assert_eq!(registry.register(ip(1)), Registration::AlreadyPresent);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let registry = ClientRegistry::new(2);
        registry.register(ip(1));
        registry.register(ip(2));
        assert_eq!(registry.register(ip(3)), Registration::Full);
        assert!(!registry.contains(&ip(3)));

        // known clients keep resolving even when full
        assert_eq!(registry.register(ip(2)), Registration::AlreadyPresent);
        assert_eq!(registry.addresses(), vec![ip(1), ip(2)]);
    }
}
