/// Connection Registry
///
/// Maps a user id to that user's single live connection on one channel.
/// The service keeps two instances, one for chat and one for notifications.
///
/// - Registering a user who is already connected closes the earlier connection.
/// - Unregistering only removes the entry if it still points at the caller's
///   connection, so a late cleanup cannot evict a newer socket.
/// - Writes happen outside the map lock; a failed write evicts the connection
///   and reports the recipient as offline.
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::metrics;

/// Unique identifier for one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Chat,
    Notifications,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Chat => "chat",
            Channel::Notifications => "notifications",
        }
    }
}

/// Frames queued for a session's socket, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// The connection was superseded and must close
    Close,
}

/// Outcome of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Delivered,
    Offline,
}

/// Write handle for one live connection.
///
/// The receiving half is owned by the websocket session; cloning the handle
/// never extends the socket's life past the session.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    user_id: i64,
    sender: UnboundedSender<Outbound>,
}

impl Connection {
    /// Creates a connection handle and the queue its session drains.
    pub fn open(user_id: i64) -> (Self, UnboundedReceiver<Outbound>) {
        let (tx, rx) = unbounded_channel();
        (
            Self {
                id: ConnectionId::new(),
                user_id,
                sender: tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn send_text(&self, text: String) -> Result<(), ConnectionError> {
        self.sender
            .send(Outbound::Text(text))
            .map_err(|_| ConnectionError::Closed)
    }

    fn close(&self) {
        // The session may already be gone; nothing to close then.
        let _ = self.sender.send(Outbound::Close);
    }
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    channel: Channel,
    inner: Arc<RwLock<HashMap<i64, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Stores `conn` as the user's live connection.
    ///
    /// Returns the id of the connection it superseded, which has been told to close.
    pub async fn register(&self, conn: Connection) -> Option<ConnectionId> {
        let user_id = conn.user_id;
        let conn_id = conn.id;
        let previous = {
            let mut guard = self.inner.write().await;
            let previous = guard.insert(user_id, conn);
            metrics::set_live_connections(self.channel, guard.len());
            previous
        };

        match previous {
            Some(old) => {
                old.close();
                tracing::info!(
                    channel = self.channel.as_str(),
                    user_id,
                    old_connection = %old.id,
                    new_connection = %conn_id,
                    "connection superseded"
                );
                Some(old.id)
            }
            None => {
                tracing::debug!(
                    channel = self.channel.as_str(),
                    user_id,
                    connection = %conn_id,
                    "connection registered"
                );
                None
            }
        }
    }

    /// Short-lived handle for a single write. Never hold it across sessions.
    pub async fn lookup(&self, user_id: i64) -> Option<Connection> {
        self.inner.read().await.get(&user_id).cloned()
    }

    /// Removes the user's entry only if it is still `conn_id`.
    pub async fn unregister(&self, user_id: i64, conn_id: ConnectionId) -> bool {
        let mut guard = self.inner.write().await;
        let matches = guard
            .get(&user_id)
            .map(|current| current.id == conn_id)
            .unwrap_or(false);
        if matches {
            guard.remove(&user_id);
            metrics::set_live_connections(self.channel, guard.len());
            tracing::debug!(
                channel = self.channel.as_str(),
                user_id,
                connection = %conn_id,
                "connection unregistered"
            );
        }
        matches
    }

    /// Pushes one frame to a user.
    ///
    /// A missing connection or a failed write both report `Offline`; a failed
    /// write also evicts the dead connection.
    pub async fn send_to(&self, user_id: i64, payload: &str) -> Delivery {
        let Some(conn) = self.lookup(user_id).await else {
            metrics::record_push(self.channel, "offline");
            return Delivery::Offline;
        };

        match conn.send_text(payload.to_string()) {
            Ok(()) => {
                metrics::record_push(self.channel, "delivered");
                Delivery::Delivered
            }
            Err(e) => {
                tracing::warn!(
                    channel = self.channel.as_str(),
                    user_id,
                    connection = %conn.id,
                    error = %e,
                    "push failed, evicting connection"
                );
                self.unregister(user_id, conn.id).await;
                metrics::record_push(self.channel, "evicted");
                Delivery::Offline
            }
        }
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.inner.read().await.contains_key(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new(Channel::Chat);
        let (conn, _rx) = Connection::open(1);
        let id = conn.id();

        assert!(registry.register(conn).await.is_none());
        assert_eq!(registry.lookup(1).await.map(|c| c.id()), Some(id));
        assert!(registry.lookup(2).await.is_none());
        assert_eq!(registry.inner.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_connection() {
        let registry = ConnectionRegistry::new(Channel::Notifications);
        let (first, mut first_rx) = Connection::open(1);
        let first_id = first.id();
        registry.register(first).await;

        let (second, _second_rx) = Connection::open(1);
        let second_id = second.id();
        assert_eq!(registry.register(second).await, Some(first_id));

        assert_eq!(first_rx.recv().await, Some(Outbound::Close));
        // The registry dropped its sender, so the old queue ends.
        assert_eq!(first_rx.recv().await, None);
        assert_eq!(registry.lookup(1).await.map(|c| c.id()), Some(second_id));
        assert_eq!(registry.inner.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_late_unregister_keeps_newer_connection() {
        let registry = ConnectionRegistry::new(Channel::Chat);
        let (first, _first_rx) = Connection::open(1);
        let first_id = first.id();
        registry.register(first).await;
        let (second, _second_rx) = Connection::open(1);
        registry.register(second).await;

        assert!(!registry.unregister(1, first_id).await);
        assert!(registry.is_online(1).await);
    }

    #[tokio::test]
    async fn test_send_to_offline_user() {
        let registry = ConnectionRegistry::new(Channel::Chat);
        assert_eq!(registry.send_to(9, "hi").await, Delivery::Offline);
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let registry = ConnectionRegistry::new(Channel::Chat);
        let (conn, mut rx) = Connection::open(1);
        registry.register(conn).await;

        for i in 0..3 {
            assert_eq!(registry.send_to(1, &i.to_string()).await, Delivery::Delivered);
        }
        for i in 0..3 {
            assert_eq!(rx.recv().await, Some(Outbound::Text(i.to_string())));
        }
    }

    #[tokio::test]
    async fn test_failed_write_evicts_and_reports_offline() {
        let registry = ConnectionRegistry::new(Channel::Chat);
        let (conn, rx) = Connection::open(1);
        registry.register(conn).await;
        drop(rx);

        assert_eq!(registry.send_to(1, "hi").await, Delivery::Offline);
        assert!(!registry.is_online(1).await);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_leave_one_connection() {
        let registry = ConnectionRegistry::new(Channel::Chat);
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..16 {
            let (conn, rx) = Connection::open(7);
            receivers.push(rx);
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.register(conn).await }));
        }
        let mut superseded = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                superseded += 1;
            }
        }
        assert_eq!(superseded, 15);
        assert_eq!(registry.inner.read().await.len(), 1);
    }
}
