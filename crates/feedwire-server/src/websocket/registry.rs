//! Live WebSocket connections.

use std::collections::HashMap;
use std::sync::Arc;

use feedwire_core::ConnectionId;
use feedwire_engine::Connection;
use parking_lot::RwLock;

/// Open connections indexed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection.
    pub fn add(&self, connection: Arc<Connection>) {
        let _ = self.connections.write().insert(connection.id(), connection);
    }

    /// Stop tracking a connection.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.write().remove(&id)
    }

    /// Look up a connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Every open connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connection() -> Arc<Connection> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Connection::new(tx, None, false))
    }

    #[test]
    fn add_get_remove() {
        let registry = ConnectionRegistry::new();
        let a = connection();
        let b = connection();
        registry.add(Arc::clone(&a));
        registry.add(Arc::clone(&b));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a.id()).is_some());

        assert!(registry.remove(a.id()).is_some());
        assert!(registry.remove(a.id()).is_none());
        assert!(registry.get(a.id()).is_none());
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn re_adding_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let a = connection();
        registry.add(Arc::clone(&a));
        registry.add(a);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
