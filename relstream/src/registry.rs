//! Registry of live connections.
//!
//! Connections are keyed by a `ConnectionId` drawn from a counter that never
//! repeats, so a handle kept across a sweep can never alias a newer
//! connection. Traversal is in creation order.

use std::collections::BTreeMap;
use std::fmt;

use crate::connection::Connection;
use crate::error::{RelStreamError, Result};

/// Handle to a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// All live connections of an endpoint.
pub struct Registry {
    connections: BTreeMap<ConnectionId, Connection>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Register a connection and return its handle.
    pub fn insert(&mut self, connection: Connection) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(id, connection);
        tracing::info!(connection = %id, live = self.connections.len(), "connection created");
        id
    }

    /// Unregister a connection, handing it back to the caller.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    /// Remove a connection, release its channel, and drop its buffers.
    pub fn destroy(&mut self, id: ConnectionId) -> Result<()> {
        let connection = self
            .remove(id)
            .ok_or(RelStreamError::ConnectionNotFound(id.as_u64()))?;
        tracing::info!(
            connection = %id,
            lifecycle = %connection.lifecycle(),
            live = self.connections.len(),
            "connection destroyed"
        );
        connection.shutdown();
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Snapshot of every live handle, in creation order. Safe to hold while
    /// connections are destroyed.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionId, &mut Connection)> {
        self.connections.iter_mut().map(|(id, c)| (*id, c))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
