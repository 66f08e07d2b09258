//! Connection registry: live connections, rooms, and fan-out.
//!
//! DESIGN
//! ======
//! One connection per user. Each connection is represented by the bounded
//! sender half of its outbound channel; the socket itself stays with the
//! per-connection task in `routes::ws`, which forwards whatever arrives on
//! the channel. Dropping the sender here closes the channel and ends that
//! task, so "force-close" is just removal from the map.
//!
//! Connections and room membership share one lock so a disconnect removes
//! the connection and every membership in a single step.
//!
//! ERROR HANDLING
//! ==============
//! Delivery uses `try_send`: a full or closed channel is a transport
//! failure. The failing connection is logged and dropped; the caller only
//! sees `false` or a smaller send count. One bad peer never stops delivery
//! to the rest of a room.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};

use crate::ids::{ConnectionId, DocumentId, UserId};
use crate::message::{ServerMessage, now_ms};
use crate::services::room::RoomIndex;

// =============================================================================
// TYPES
// =============================================================================

struct Connection {
    id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
    connected_at: Instant,
    last_ping_sent: Option<Instant>,
    /// Last sign of life: registration or pong.
    last_seen: Instant,
}

/// Result of a successful `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub user_id: UserId,
    /// Rooms the user was removed from.
    pub rooms: Vec<DocumentId>,
    /// How long the connection was registered.
    pub connected_for: Duration,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<UserId, Connection>,
    rooms: RoomIndex,
}

impl RegistryInner {
    /// Remove a user's connection, but only if it is still `conn_id`.
    fn drop_connection(&mut self, user_id: &UserId, conn_id: ConnectionId) -> Option<Disconnected> {
        if self.connections.get(user_id).map(|c| c.id) != Some(conn_id) {
            return None;
        }
        let connection = self.connections.remove(user_id)?;
        let rooms = self.rooms.remove_user(user_id);
        Some(Disconnected { user_id: user_id.clone(), rooms, connected_for: connection.connected_at.elapsed() })
    }
}

/// Process-wide registry of live connections. Cheap to clone.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

// =============================================================================
// LIFECYCLE
// =============================================================================

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id` and send the acknowledgement.
    ///
    /// A previous connection for the same user is told it was replaced and
    /// then dropped, which ends its task. Room memberships are per user and
    /// carry over.
    pub async fn connect(&self, conn_id: ConnectionId, user_id: UserId, tx: mpsc::Sender<ServerMessage>) {
        let now = Instant::now();
        let ack = ServerMessage::ConnectionEstablished { user_id: user_id.clone(), timestamp: now_ms() };
        if let Err(e) = tx.try_send(ack) {
            warn!(%user_id, %conn_id, error = %e, "ws: connection ack failed");
        }

        let connection = Connection { id: conn_id, tx, connected_at: now, last_ping_sent: None, last_seen: now };
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.connections.insert(user_id.clone(), connection) {
            let _ = old
                .tx
                .try_send(ServerMessage::ConnectionClosed { reason: "replaced".into() });
            info!(%user_id, old = %old.id, new = %conn_id, "ws: connection replaced");
        }
        info!(%user_id, %conn_id, total = inner.connections.len(), "ws: connection registered");
    }

    /// Remove the connection with this id, and its user from every room.
    ///
    /// Returns `None` if no registered connection has this id (already
    /// dropped, or replaced by a newer connection for the same user).
    pub async fn disconnect(&self, conn_id: ConnectionId) -> Option<Disconnected> {
        let mut inner = self.inner.write().await;
        let user_id = inner
            .connections
            .iter()
            .find(|(_, conn)| conn.id == conn_id)
            .map(|(user_id, _)| user_id.clone())?;
        let removed = inner.drop_connection(&user_id, conn_id)?;
        info!(
            %user_id,
            %conn_id,
            connected_secs = removed.connected_for.as_secs(),
            remaining = inner.connections.len(),
            "ws: connection removed"
        );
        Some(removed)
    }

    async fn drop_failed(&self, failed: Vec<(UserId, ConnectionId)>) {
        if failed.is_empty() {
            return;
        }
        let mut inner = self.inner.write().await;
        for (user_id, conn_id) in failed {
            if inner.drop_connection(&user_id, conn_id).is_some() {
                warn!(%user_id, %conn_id, "ws: dropped connection after failed send");
            }
        }
    }

    #[must_use]
    pub async fn is_connected(&self, user_id: &UserId) -> bool {
        self.inner.read().await.connections.contains_key(user_id)
    }

    #[must_use]
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

// =============================================================================
// DELIVERY
// =============================================================================

impl ConnectionRegistry {
    /// Send to one user. On failure the connection is dropped.
    pub async fn send_to_user(&self, user_id: &UserId, message: ServerMessage) -> bool {
        let (conn_id, result) = {
            let inner = self.inner.read().await;
            let Some(conn) = inner.connections.get(user_id) else {
                return false;
            };
            (conn.id, conn.tx.try_send(message))
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(%user_id, %conn_id, error = %e, "ws: send to user failed");
                self.drop_failed(vec![(user_id.clone(), conn_id)]).await;
                false
            }
        }
    }

    /// Send to every connected user except `exclude`. Returns the number of
    /// successful sends; failed connections are dropped after the pass.
    pub async fn broadcast(&self, message: &ServerMessage, exclude: Option<&UserId>) -> usize {
        let (sent, failed) = {
            let inner = self.inner.read().await;
            deliver(&inner.connections, inner.connections.keys(), message, exclude)
        };
        self.drop_failed(failed).await;
        sent
    }

    /// Send to the members of one room except `exclude`.
    pub async fn send_to_room(&self, document_id: &DocumentId, message: &ServerMessage, exclude: Option<&UserId>) -> usize {
        let (sent, failed) = {
            let inner = self.inner.read().await;
            let members = inner.rooms.members_of(document_id);
            deliver(&inner.connections, members.iter(), message, exclude)
        };
        self.drop_failed(failed).await;
        sent
    }
}

fn deliver<'a>(
    connections: &HashMap<UserId, Connection>,
    targets: impl Iterator<Item = &'a UserId>,
    message: &ServerMessage,
    exclude: Option<&UserId>,
) -> (usize, Vec<(UserId, ConnectionId)>) {
    let mut sent = 0;
    let mut failed = Vec::new();
    for user_id in targets {
        if exclude == Some(user_id) {
            continue;
        }
        let Some(conn) = connections.get(user_id) else {
            continue;
        };
        match conn.tx.try_send(message.clone()) {
            Ok(()) => sent += 1,
            Err(e) => {
                warn!(%user_id, conn_id = %conn.id, error = %e, kind = message.kind(), "ws: delivery failed");
                failed.push((user_id.clone(), conn.id));
            }
        }
    }
    (sent, failed)
}

// =============================================================================
// ROOMS
// =============================================================================

impl ConnectionRegistry {
    /// Subscribe a connected user to a document. False if not connected.
    pub async fn join_room(&self, user_id: &UserId, document_id: &DocumentId) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(user_id) {
            return false;
        }
        inner.rooms.join(user_id, document_id);
        info!(%user_id, %document_id, members = inner.rooms.members_of(document_id).len(), "ws: joined room");
        true
    }

    pub async fn leave_room(&self, user_id: &UserId, document_id: &DocumentId) -> bool {
        let mut inner = self.inner.write().await;
        let left = inner.rooms.leave(user_id, document_id);
        if left {
            info!(%user_id, %document_id, "ws: left room");
        }
        left
    }

    #[must_use]
    pub async fn members_of(&self, document_id: &DocumentId) -> HashSet<UserId> {
        self.inner.read().await.rooms.members_of(document_id)
    }

    #[must_use]
    pub async fn rooms_of(&self, user_id: &UserId) -> HashSet<DocumentId> {
        self.inner.read().await.rooms.rooms_of(user_id)
    }

    #[must_use]
    pub async fn in_room(&self, user_id: &UserId, document_id: &DocumentId) -> bool {
        self.inner.read().await.rooms.contains(user_id, document_id)
    }
}

// =============================================================================
// LIVENESS
// =============================================================================

impl ConnectionRegistry {
    /// Send a ping and record when it went out. False means the
    /// connection is gone (and has been dropped).
    pub async fn ping(&self, user_id: &UserId) -> bool {
        {
            let mut inner = self.inner.write().await;
            let Some(conn) = inner.connections.get_mut(user_id) else {
                return false;
            };
            conn.last_ping_sent = Some(Instant::now());
        }
        self.send_to_user(user_id, ServerMessage::ping()).await
    }

    /// Record a pong. Returns the round trip since the last ping, if any.
    pub async fn handle_pong(&self, user_id: &UserId) -> Option<Duration> {
        let mut inner = self.inner.write().await;
        let conn = inner.connections.get_mut(user_id)?;
        let now = Instant::now();
        conn.last_seen = now;
        Some(
            conn.last_ping_sent
                .map_or(Duration::ZERO, |sent| now.saturating_duration_since(sent)),
        )
    }

    /// Drop every connection silent for longer than `timeout`.
    pub async fn sweep_stale(&self, timeout: Duration) -> usize {
        self.sweep_stale_at(Instant::now(), timeout).await
    }

    async fn sweep_stale_at(&self, now: Instant, timeout: Duration) -> usize {
        let mut inner = self.inner.write().await;
        let stale: Vec<(UserId, ConnectionId)> = inner
            .connections
            .iter()
            .filter(|(_, conn)| now.saturating_duration_since(conn.last_seen) > timeout)
            .map(|(user_id, conn)| (user_id.clone(), conn.id))
            .collect();

        let mut cleaned = 0;
        for (user_id, conn_id) in stale {
            if let Some(conn) = inner.connections.get(&user_id) {
                let _ = conn
                    .tx
                    .try_send(ServerMessage::ConnectionClosed { reason: "stale".into() });
            }
            if inner.drop_connection(&user_id, conn_id).is_some() {
                cleaned += 1;
                warn!(%user_id, %conn_id, "ws: dropped stale connection");
            }
        }
        cleaned
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
