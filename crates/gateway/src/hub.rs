//! The WebSocket connection hub.
//!
//! Connections get a handle on open and a user id after the client's
//! `register:` frame; a user id maps to at most one connection, with
//! re-registration replacing the prior mapping. Outbound frames go
//! through per-connection unbounded senders so nothing here blocks on a
//! slow socket. One lock guards both maps; sends under the read lock are
//! non-blocking.

use axum::extract::ws::{CloseFrame, Message};
use lily_core::error::GatewayError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Close code sent on pong timeout (policy violation).
const CLOSE_POLICY_VIOLATION: u16 = 1008;

struct Connection {
    sender: mpsc::UnboundedSender<Message>,
    user_id: Option<String>,
    last_pong: Instant,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, Connection>,
    /// user id → connection id; at most one entry per user
    users: HashMap<String, Uuid>,
}

/// Registry of live WebSocket connections.
pub struct ConnectionHub {
    state: RwLock<HubState>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HubState::default()),
        }
    }

    /// Track a freshly opened socket. The user id arrives later.
    pub async fn add(&self, conn_id: Uuid, sender: mpsc::UnboundedSender<Message>) {
        self.state.write().await.connections.insert(
            conn_id,
            Connection {
                sender,
                user_id: None,
                last_pong: Instant::now(),
            },
        );
        debug!(%conn_id, "Connection opened");
    }

    /// Bind a user id to a connection, replacing any prior mapping.
    ///
    /// The old connection keeps its socket but loses its address — sends
    /// to the user id go to the new handle only.
    pub async fn register(&self, conn_id: Uuid, user_id: &str) {
        let mut state = self.state.write().await;
        if let Some(old_conn) = state.users.insert(user_id.to_string(), conn_id) {
            if old_conn != conn_id {
                if let Some(conn) = state.connections.get_mut(&old_conn) {
                    conn.user_id = None;
                }
                info!(user_id = %user_id, "Re-registration replaced previous connection");
            }
        }
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            conn.user_id = Some(user_id.to_string());
        }
        info!(user_id = %user_id, %conn_id, "User registered");
    }

    /// Drop a connection and its user mapping, if any.
    pub async fn remove(&self, conn_id: Uuid) {
        let mut state = self.state.write().await;
        if let Some(conn) = state.connections.remove(&conn_id) {
            if let Some(user_id) = conn.user_id {
                if state.users.get(&user_id) == Some(&conn_id) {
                    state.users.remove(&user_id);
                }
            }
        }
        debug!(%conn_id, "Connection removed");
    }

    /// Send a frame to a specific connection handle.
    pub async fn send_to_conn(&self, conn_id: Uuid, message: Message) -> Result<(), GatewayError> {
        let state = self.state.read().await;
        let conn = state
            .connections
            .get(&conn_id)
            .ok_or_else(|| GatewayError::ClientNotFound(conn_id.to_string()))?;
        conn.sender
            .send(message)
            .map_err(|e| GatewayError::SendFailed {
                user_id: conn_id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Send a frame to the connection registered for a user id.
    pub async fn send_to_user(&self, user_id: &str, message: Message) -> Result<(), GatewayError> {
        let state = self.state.read().await;
        let conn_id = state
            .users
            .get(user_id)
            .ok_or_else(|| GatewayError::ClientNotFound(user_id.to_string()))?;
        let conn = state
            .connections
            .get(conn_id)
            .ok_or_else(|| GatewayError::ClientNotFound(user_id.to_string()))?;
        conn.sender
            .send(message)
            .map_err(|e| GatewayError::SendFailed {
                user_id: user_id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Send a text frame to every registered user. No-op with zero
    /// connections.
    pub async fn broadcast_text(&self, payload: &str) {
        let state = self.state.read().await;
        for conn_id in state.users.values() {
            if let Some(conn) = state.connections.get(conn_id) {
                let _ = conn.sender.send(Message::Text(payload.to_string().into()));
            }
        }
    }

    /// Record a protocol pong from a connection.
    pub async fn touch_pong(&self, conn_id: Uuid) {
        if let Some(conn) = self.state.write().await.connections.get_mut(&conn_id) {
            conn.last_pong = Instant::now();
        }
    }

    /// Liveness sweep: close connections whose last pong is older than
    /// `timeout`, ping the rest. Returns the closed connection ids.
    pub async fn sweep(&self, timeout: Duration) -> Vec<Uuid> {
        let mut closed = Vec::new();
        let mut state = self.state.write().await;

        let stale: Vec<Uuid> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.last_pong.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for conn_id in stale {
            if let Some(conn) = state.connections.remove(&conn_id) {
                warn!(%conn_id, "Pong timeout, closing connection");
                let _ = conn.sender.send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: "pong timeout".into(),
                })));
                if let Some(user_id) = conn.user_id {
                    if state.users.get(&user_id) == Some(&conn_id) {
                        state.users.remove(&user_id);
                    }
                }
            }
            closed.push(conn_id);
        }

        for conn in state.connections.values() {
            let _ = conn.sender.send(Message::Ping(Vec::new().into()));
        }

        closed
    }

    /// User ids with a live registered connection.
    pub async fn connected_users(&self) -> Vec<String> {
        self.state.read().await.users.keys().cloned().collect()
    }

    pub async fn is_registered(&self, user_id: &str) -> bool {
        self.state.read().await.users.contains_key(user_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(hub: &ConnectionHub) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.add(conn_id, tx).await;
        (conn_id, rx)
    }

    fn text_of(message: Message) -> String {
        match message {
            Message::Text(t) => t.to_string(),
            other => panic!("Expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_registered_user() {
        let hub = ConnectionHub::new();
        let (conn_id, mut rx) = open(&hub).await;
        hub.register(conn_id, "u1").await;

        hub.send_to_user("u1", Message::Text("hi".into()))
            .await
            .unwrap();
        assert_eq!(text_of(rx.recv().await.unwrap()), "hi");
    }

    #[tokio::test]
    async fn send_to_unknown_user_reports_client_not_found() {
        let hub = ConnectionHub::new();
        let err = hub
            .send_to_user("ghost", Message::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ClientNotFound(_)));
    }

    #[tokio::test]
    async fn double_registration_replaces_old_handle() {
        let hub = ConnectionHub::new();
        let (first, mut first_rx) = open(&hub).await;
        let (second, mut second_rx) = open(&hub).await;
        hub.register(first, "u1").await;
        hub.register(second, "u1").await;

        // Exactly one entry for the user, addressed to the new handle
        assert_eq!(hub.connected_users().await, vec!["u1".to_string()]);
        hub.send_to_user("u1", Message::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(text_of(second_rx.recv().await.unwrap()), "hello");
        assert!(first_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removing_replaced_connection_keeps_new_mapping() {
        let hub = ConnectionHub::new();
        let (first, _first_rx) = open(&hub).await;
        let (second, _second_rx) = open(&hub).await;
        hub.register(first, "u1").await;
        hub.register(second, "u1").await;

        // The stale handle dying must not unmap the new one
        hub.remove(first).await;
        assert!(hub.is_registered("u1").await);

        hub.remove(second).await;
        assert!(!hub.is_registered("u1").await);
    }

    #[tokio::test]
    async fn broadcast_reaches_all_registered() {
        let hub = ConnectionHub::new();
        let (a, mut rx_a) = open(&hub).await;
        let (b, mut rx_b) = open(&hub).await;
        let (_unregistered, mut rx_c) = open(&hub).await;
        hub.register(a, "u1").await;
        hub.register(b, "u2").await;

        hub.broadcast_text("news").await;
        assert_eq!(text_of(rx_a.recv().await.unwrap()), "news");
        assert_eq!(text_of(rx_b.recv().await.unwrap()), "news");
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_with_zero_connections_is_noop() {
        let hub = ConnectionHub::new();
        hub.broadcast_text("anyone?").await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_closes_stale_and_pings_live() {
        let hub = ConnectionHub::new();
        let (stale, mut stale_rx) = open(&hub).await;
        let (live, mut live_rx) = open(&hub).await;
        hub.register(stale, "u-stale").await;
        hub.register(live, "u-live").await;

        // Backdate the stale connection's pong
        {
            let mut state = hub.state.write().await;
            state.connections.get_mut(&stale).unwrap().last_pong =
                Instant::now() - Duration::from_secs(120);
        }

        let closed = hub.sweep(Duration::from_secs(60)).await;
        assert_eq!(closed, vec![stale]);

        // Stale got a close frame and lost its mapping
        assert!(matches!(stale_rx.recv().await.unwrap(), Message::Close(_)));
        let err = hub
            .send_to_user("u-stale", Message::Text("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ClientNotFound(_)));

        // Live got a protocol ping
        assert!(matches!(live_rx.recv().await.unwrap(), Message::Ping(_)));
        assert!(hub.is_registered("u-live").await);
    }

    #[tokio::test]
    async fn touch_pong_defers_sweep() {
        let hub = ConnectionHub::new();
        let (conn, _rx) = open(&hub).await;
        hub.register(conn, "u1").await;
        hub.touch_pong(conn).await;
        let closed = hub.sweep(Duration::from_secs(60)).await;
        assert!(closed.is_empty());
    }
}
