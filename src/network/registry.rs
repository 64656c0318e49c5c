//! Client Registry
//!
//! Directory of authenticated, open sessions. Shared by every connection
//! task and by anything that pushes data to clients.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::network::protocol::ServerMessage;
use crate::network::session::{ClientHandle, ClientId};
use crate::network::transport::TransportError;

/// Registry of authenticated clients.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<BTreeMap<ClientId, ClientHandle>>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated client. Replaces any previous handle.
    pub async fn add(&self, id: ClientId, handle: ClientHandle) {
        let mut clients = self.clients.write().await;
        if clients.insert(id, handle).is_some() {
            warn!(client = %id, "Client registered twice, handle replaced");
        }
        debug!(client = %id, total = clients.len(), "Client registered");
    }

    /// Remove a client. Unknown ids are ignored.
    ///
    /// Returns whether an entry was removed.
    pub async fn remove(&self, id: &ClientId) -> bool {
        let mut clients = self.clients.write().await;
        let removed = clients.remove(id).is_some();
        if removed {
            debug!(client = %id, total = clients.len(), "Client unregistered");
        }
        removed
    }

    /// Look up a client.
    pub async fn get(&self, id: &ClientId) -> Option<ClientHandle> {
        self.clients.read().await.get(id).cloned()
    }

    /// Whether a client is registered.
    pub async fn contains(&self, id: &ClientId) -> bool {
        self.clients.read().await.contains_key(id)
    }

    /// Number of registered clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no client is registered.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Ids of all registered clients.
    pub async fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().await.keys().copied().collect()
    }

    /// Point-in-time copy of all handles.
    ///
    /// The lock is released before returning, so callers may write to the
    /// handles while other tasks mutate the registry.
    pub async fn snapshot(&self) -> Vec<ClientHandle> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Send an envelope to one client.
    pub async fn send_to(&self, id: &ClientId, msg: &ServerMessage) -> Result<(), TransportError> {
        let handle = self.get(id).await.ok_or(TransportError::Closed)?;
        handle.send(msg).await
    }

    /// Send an envelope to every open client.
    ///
    /// A client whose outbound buffer is full holds the broadcast up until
    /// its writer catches up.
    ///
    /// Returns how many clients it was written to.
    pub async fn broadcast(&self, msg: &ServerMessage) -> usize {
        let mut delivered = 0;
        for handle in self.snapshot().await {
            if !handle.is_open() {
                continue;
            }
            match handle.send(msg).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(client = %handle.id(), error = %e, "Broadcast to client failed"),
            }
        }
        delivered
    }
}
