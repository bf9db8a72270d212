//! Registry of open client connections.
//!
//! Each handler registers its connection on entry and holds the returned
//! [`Registration`] for as long as its read loop runs. Dropping the
//! registration removes the entry, so every exit path (clean close,
//! transport error, malformed input, panic) deregisters exactly once.

use parking_lot::Mutex;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Handshake done, handler loop running.
    Connected,
    /// Loop exited, connection released.
    Closed,
}

/// Bookkeeping for a single client connection.
///
/// The transport itself stays with the handler; the registry only tracks
/// who is connected.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Remote address of the client.
    pub peer: SocketAddr,
    /// When the handshake completed.
    pub connected_at: Instant,
}

impl Connection {
    /// Create a new connection record.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            connected_at: Instant::now(),
        }
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Set of currently open connections using slab allocation.
///
/// Provides O(1) insert and remove operations. Shared between the listener
/// and its handlers behind an `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Slab<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a new connection.
    ///
    /// The entry lives until the returned registration is dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> Registration {
        let id = self.connections.lock().insert(Connection::new(peer));
        Registration {
            id,
            state: ConnState::Connected,
            registry: Arc::clone(self),
        }
    }

    fn remove(&self, id: usize) -> Option<Connection> {
        let conn = self.connections.lock().try_remove(id)?;
        trace!(conn_id = id, peer = %conn.peer, "Connection deregistered");
        Some(conn)
    }

    /// Get a copy of a connection record.
    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<Connection> {
        self.connections.lock().get(id).cloned()
    }

    /// Check if a connection exists.
    #[cfg(test)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.lock().contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Remote addresses of all active connections.
    #[cfg(test)]
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.connections
            .lock()
            .iter()
            .map(|(_, conn)| conn.peer)
            .collect()
    }
}

/// A live registry entry owned by one connection handler.
#[derive(Debug)]
pub struct Registration {
    id: usize,
    state: ConnState,
    registry: Arc<ConnectionRegistry>,
}

impl Registration {
    /// Slot of this connection in the registry.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current connection state.
    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Remove the entry now and return how long the connection was open.
    pub fn close(mut self) -> Option<Duration> {
        self.deregister()
    }

    fn deregister(&mut self) -> Option<Duration> {
        if self.state == ConnState::Closed {
            return None;
        }
        self.state = ConnState::Closed;
        self.registry.remove(self.id).map(|conn| conn.age())
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_drop() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        let reg = registry.register(addr(4000));
        assert_eq!(reg.state(), ConnState::Connected);
        assert!(registry.contains(reg.id()));
        assert_eq!(registry.get(reg.id()).unwrap().peer, addr(4000));
        assert_eq!(registry.len(), 1);

        let id = reg.id();
        drop(reg);
        assert!(!registry.contains(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_count_tracks_open_connections() {
        let registry = ConnectionRegistry::new();

        let mut regs: Vec<_> = (0..5).map(|i| registry.register(addr(5000 + i))).collect();
        assert_eq!(registry.len(), 5);

        // Close K = 2 of N = 5
        let closed: Vec<_> = regs.drain(..2).collect();
        for reg in closed {
            assert!(reg.close().is_some());
        }
        assert_eq!(registry.len(), 3);

        let mut peers = registry.peers();
        peers.sort();
        assert_eq!(peers, vec![addr(5002), addr(5003), addr(5004)]);

        drop(regs);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_slot_reuse_does_not_double_remove() {
        let registry = ConnectionRegistry::new();

        let first = registry.register(addr(6000));
        let first_id = first.id();
        first.close();

        // Slab reuses the freed slot
        let second = registry.register(addr(6001));
        assert_eq!(second.id(), first_id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first_id).unwrap().peer, addr(6001));

        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deregister_on_panic() {
        let registry = ConnectionRegistry::new();
        let shared = Arc::clone(&registry);

        let result = std::thread::spawn(move || {
            let _reg = shared.register(addr(7000));
            panic!("handler failed");
        })
        .join();

        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = ConnectionRegistry::new();

        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..100u16 {
                        let reg = registry.register(addr(10_000 + i * 100 + j));
                        assert!(registry.contains(reg.id()));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
