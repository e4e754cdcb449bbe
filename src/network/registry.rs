//! Connection Registry
//!
//! Owns the record of every live connection: its outbound channel and,
//! once resolved, its identity. Other components refer to connections by
//! [`ConnectionId`] only.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::core::{ConnectionId, Identity};
use crate::network::protocol::ServerMessage;

/// Outbound channel of one connection.
pub type ClientSender = mpsc::Sender<ServerMessage>;

/// Queue `message` without waiting. A full or closed channel drops the
/// message; returns whether it was queued.
pub fn try_notify(sender: &ClientSender, message: ServerMessage) -> bool {
    match sender.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!("Outbound channel full; message dropped");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Connected client state.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    /// Connection id.
    pub id: ConnectionId,
    /// Resolved identity; None until authenticated.
    pub identity: Option<Identity>,
    /// Connection time.
    pub connected_at: Instant,
    /// Last inbound activity.
    pub last_activity: Instant,
    /// Message sender (for direct messaging to client).
    pub sender: ClientSender,
}

impl ConnectedClient {
    /// Whether an identity has been attached.
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No such connection.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    /// Identity already set; identities never change once attached.
    #[error("connection {0} already authenticated")]
    AlreadyAuthenticated(ConnectionId),
}

/// All live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: RwLock<BTreeMap<ConnectionId, ConnectedClient>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly accepted connection (unauthenticated).
    pub async fn register(&self, id: ConnectionId, sender: ClientSender) {
        let now = Instant::now();
        self.clients.write().await.insert(
            id,
            ConnectedClient {
                id,
                identity: None,
                connected_at: now,
                last_activity: now,
                sender,
            },
        );
        debug!("Registered connection {}", id.short());
    }

    /// Attach the resolved identity. Fails if one is already attached.
    pub async fn attach_identity(
        &self,
        id: ConnectionId,
        identity: Identity,
    ) -> Result<(), RegistryError> {
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(&id)
            .ok_or(RegistryError::UnknownConnection(id))?;
        if client.identity.is_some() {
            return Err(RegistryError::AlreadyAuthenticated(id));
        }
        client.identity = Some(identity);
        Ok(())
    }

    /// Identity of a connection, if it has one.
    pub async fn identity_of(&self, id: &ConnectionId) -> Option<Identity> {
        self.clients.read().await.get(id).and_then(|c| c.identity.clone())
    }

    /// Outbound channel of a connection.
    pub async fn sender_of(&self, id: &ConnectionId) -> Option<ClientSender> {
        self.clients.read().await.get(id).map(|c| c.sender.clone())
    }

    /// Snapshot of a connection.
    pub async fn get(&self, id: &ConnectionId) -> Option<ConnectedClient> {
        self.clients.read().await.get(id).cloned()
    }

    /// Update last activity.
    pub async fn touch(&self, id: &ConnectionId) {
        if let Some(client) = self.clients.write().await.get_mut(id) {
            client.last_activity = Instant::now();
        }
    }

    /// Connections idle for longer than `timeout`.
    pub async fn idle_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        self.clients
            .read()
            .await
            .values()
            .filter(|c| now.duration_since(c.last_activity) > timeout)
            .map(|c| c.id)
            .collect()
    }

    /// Forget a connection. Returns its final state.
    pub async fn unregister(&self, id: &ConnectionId) -> Option<ConnectedClient> {
        let removed = self.clients.write().await.remove(id);
        if removed.is_some() {
            debug!("Unregistered connection {}", id.short());
        }
        removed
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}
