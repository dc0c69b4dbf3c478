//! Connection state and the registry of live connections.
//!
//! Each connection owns its transport, its peer address and a
//! `ConnectionBuffer`. The registry hands out slab keys that double as the
//! readiness token for the connection.

use crate::runtime::buffer::ConnectionBuffer;
use slab::Slab;
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    /// Transport handle, owned until the connection is unregistered.
    pub stream: S,
    /// Remote address, used in log lines and the broadcast prefix.
    pub peer: SocketAddr,
    /// Incoming accumulator and outgoing queue.
    pub buffer: ConnectionBuffer,
    /// Whether the reactor wants writable notifications for this connection.
    write_interest: bool,
    /// Write interest currently armed with the readiness backend.
    armed_writable: bool,
}

impl<S> Connection<S> {
    /// Create a connection with an empty buffer and no write interest.
    pub fn new(stream: S, peer: SocketAddr, buffer: ConnectionBuffer) -> Self {
        Self {
            stream,
            peer,
            buffer,
            write_interest: false,
            armed_writable: false,
        }
    }

    /// Desired write interest.
    pub fn write_interest(&self) -> bool {
        self.write_interest
    }

    /// Record that the backend now reflects `writable`.
    pub fn set_armed(&mut self, writable: bool) {
        self.armed_writable = writable;
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
    /// Keys whose desired write interest changed since the last sync.
    interest_changes: Vec<usize>,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
            interest_changes: Vec::new(),
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn register(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Remove a connection. Removing an absent key is a no-op.
    pub fn unregister(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Get an immutable reference to a connection.
    #[cfg(test)]
    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Snapshot of the keys live right now.
    ///
    /// The snapshot owns its keys, so connections may be unregistered while
    /// it is walked; callers look each key up again and skip the missing.
    /// Call again to restart from the current membership.
    pub fn all(&self) -> Snapshot {
        Snapshot {
            ids: self
                .connections
                .iter()
                .map(|(id, _)| id)
                .collect::<Vec<_>>()
                .into_iter(),
        }
    }

    /// Set the desired write interest of `id`.
    ///
    /// Returns `false` if the connection is gone.
    pub fn mark_write_interest(&mut self, id: usize, writable: bool) -> bool {
        let Some(conn) = self.connections.get_mut(id) else {
            return false;
        };
        if conn.write_interest != writable {
            conn.write_interest = writable;
            self.interest_changes.push(id);
        }
        true
    }

    /// Drain the keys whose desired interest differs from what is armed.
    pub fn take_interest_changes(&mut self) -> Vec<usize> {
        let mut changes = std::mem::take(&mut self.interest_changes);
        changes.sort_unstable();
        changes.dedup();
        changes.retain(|&id| {
            self.connections
                .get(id)
                .is_some_and(|c| c.write_interest != c.armed_writable)
        });
        changes
    }

    /// Remove every connection, returning them in key order.
    pub fn drain(&mut self) -> Vec<Connection<S>> {
        self.interest_changes.clear();
        self.connections.drain().collect()
    }
}

impl<S> Index<usize> for ConnectionRegistry<S> {
    type Output = Connection<S>;

    fn index(&self, id: usize) -> &Connection<S> {
        &self.connections[id]
    }
}

impl<S> IndexMut<usize> for ConnectionRegistry<S> {
    fn index_mut(&mut self, id: usize) -> &mut Connection<S> {
        &mut self.connections[id]
    }
}

/// Owned, finite sequence of registry keys taken at one instant.
#[derive(Debug)]
pub struct Snapshot {
    ids: std::vec::IntoIter<usize>,
}

impl Iterator for Snapshot {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.ids.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.ids.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(n: u8) -> Connection<u8> {
        let peer = SocketAddr::from(([127, 0, 0, 1], 4000 + n as u16));
        Connection::new(n, peer, ConnectionBuffer::new())
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.register(conn(1)).unwrap();
        let id2 = registry.register(conn(2)).unwrap();

        // At capacity
        assert!(registry.register(conn(3)).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
        assert_eq!(registry.get(id1).unwrap().stream, 1);
        assert_eq!(registry.get(id2).unwrap().peer.port(), 4002);

        registry.unregister(id1);
        assert!(!registry.contains(id1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = ConnectionRegistry::new(4);
        let id = registry.register(conn(1)).unwrap();
        let other = registry.register(conn(2)).unwrap();

        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(other));
    }

    #[test]
    fn test_snapshot_tolerates_removal() {
        let mut registry = ConnectionRegistry::new(8);
        let ids: Vec<_> = (0..4).map(|n| registry.register(conn(n)).unwrap()).collect();

        let mut seen = Vec::new();
        for id in registry.all() {
            if id == ids[0] {
                registry.unregister(ids[2]);
            }
            if registry.get(id).is_some() {
                seen.push(id);
            }
        }
        assert_eq!(seen, vec![ids[0], ids[1], ids[3]]);

        // Restarting reflects the new membership
        assert_eq!(registry.all().count(), 3);
    }

    #[test]
    fn test_interest_changes() {
        let mut registry = ConnectionRegistry::new(4);
        let a = registry.register(conn(1)).unwrap();
        let b = registry.register(conn(2)).unwrap();

        assert!(registry.mark_write_interest(a, true));
        assert!(registry.mark_write_interest(b, true));
        assert!(registry.mark_write_interest(a, true));
        assert_eq!(registry.take_interest_changes(), vec![a, b]);
        assert!(registry.take_interest_changes().is_empty());

        registry.get_mut(a).unwrap().set_armed(true);

        // Flipping back to the armed value leaves nothing to sync
        registry.mark_write_interest(b, false);
        assert!(registry.take_interest_changes().is_empty());

        registry.mark_write_interest(a, false);
        assert_eq!(registry.take_interest_changes(), vec![a]);

        registry.unregister(a);
        assert!(!registry.mark_write_interest(a, true));
    }
}
