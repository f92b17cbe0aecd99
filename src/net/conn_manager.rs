use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::CapacityError;
use crate::net::Connection;

/// Registry of live connections keyed by connection id.
///
/// The accept loop checks [`ConnManager::ensure_capacity`] before it builds a
/// connection; the registry itself never refuses an insert.
pub struct ConnManager {
    connections: RwLock<HashMap<u32, Arc<Connection>>>,
    max_conn: usize,
}

impl ConnManager {
    pub fn new(max_conn: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::with_capacity(max_conn.min(1024))),
            max_conn,
        }
    }

    /// Register a connection.
    pub fn add(&self, conn: Arc<Connection>) {
        let id = conn.id();
        let total = {
            let mut connections = self.connections.write();
            connections.insert(id, conn);
            connections.len()
        };
        debug!(conn_id = id, total, "Connection added");
    }

    /// Forget a connection. Does not stop it.
    pub fn remove(&self, id: u32) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        if removed.is_some() {
            debug!(conn_id = id, total = self.len(), "Connection removed");
        }
        removed
    }

    pub fn get(&self, id: u32) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// True while a connection with this id is registered.
    pub fn contains(&self, id: u32) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn max_conn(&self) -> usize {
        self.max_conn
    }

    /// Fails when one more connection would exceed the cap.
    pub fn ensure_capacity(&self) -> Result<(), CapacityError> {
        if self.len() >= self.max_conn {
            return Err(CapacityError { max: self.max_conn });
        }
        Ok(())
    }

    /// Stop and forget every connection, returning them so the caller can
    /// wait for their tasks.
    ///
    /// Each connection's own stop also removes it from this registry, so the
    /// map is drained first and the lock released before any stop runs.
    pub fn clear_conn(&self) -> Vec<Arc<Connection>> {
        let drained: Vec<_> = self
            .connections
            .write()
            .drain()
            .map(|(_, conn)| conn)
            .collect();

        for conn in &drained {
            conn.stop();
        }

        info!(count = drained.len(), "All connections cleared");
        drained
    }
}
