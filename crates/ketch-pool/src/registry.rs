//! Shared connection registry.
//!
//! A concurrently-readable table of connection id → client handle.
//! Insertion order is preserved so pool selection tie-breaks are
//! deterministic ("first listed" wins).

use dashmap::DashMap;
use ketch_ws::Client;
use parking_lot::RwLock;

/// Concurrent id → client table.
pub struct ConnectionRegistry {
    clients: DashMap<String, Client>,
    order: RwLock<Vec<String>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Register a client under its connection id.
    pub fn register(&self, client: Client) {
        let id = client.id().to_string();
        if self.clients.insert(id.clone(), client).is_none() {
            self.order.write().push(id);
        }
    }

    /// Remove and return the client registered under `id`.
    pub fn deregister(&self, id: &str) -> Option<Client> {
        let removed = self.clients.remove(id).map(|(_, client)| client);
        if removed.is_some() {
            self.order.write().retain(|existing| existing != id);
        }
        removed
    }

    /// Look up a client by id.
    pub fn get(&self, id: &str) -> Option<Client> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Registered clients in registration order.
    pub fn clients(&self) -> Vec<Client> {
        self.ids()
            .into_iter()
            .filter_map(|id| self.get(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
