//! Connection state and per-instance registry.
//!
//! Uses lock-free DashMap for high-throughput concurrent access: the
//! registry is consulted on every received and every delivered message,
//! while writes happen only on register and disconnect.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerFrame;
use axum::extract::ws::Message;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Locally unique connection identifier, minted at socket upgrade.
pub type ConnId = Uuid;

/// State for a single registered connection.
///
/// All socket writes go through `tx`; a single writer task per socket
/// drains the channel, which totally orders writes regardless of whether
/// they originate in the owning handler or the router's delivery path.
pub struct Connection {
    /// Unique connection identifier.
    pub conn_id: ConnId,
    /// User identity claimed at registration.
    pub user_id: String,
    /// Channel to the connection's writer task.
    tx: mpsc::UnboundedSender<Message>,
    /// Timestamp when the connection registered, unix millis.
    pub connected_at: i64,
    /// Timestamp of the last application-level ping, unix millis.
    last_ping: AtomicI64,
    /// Cancelled to make the owning read loop exit.
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(
        conn_id: ConnId,
        user_id: impl Into<String>,
        tx: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            conn_id,
            user_id: user_id.into(),
            tx,
            connected_at: now,
            last_ping: AtomicI64::new(now),
            cancel,
        }
    }

    /// Serialize a frame and queue it for this connection.
    pub fn send(&self, frame: &ServerFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.tx
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    /// Record an application-level ping.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Last ping timestamp, unix millis.
    pub fn last_ping_ms(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }

    /// Ask the owning handler to close this connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether this connection has been asked to close.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Per-instance bidirectional index of registered connections.
///
/// Invariant: every `by_user` entry has a matching `by_conn` entry for the
/// same connection, and one user has at most one active connection here.
pub struct ConnectionRegistry {
    by_user: DashMap<String, Arc<Connection>>,
    by_conn: DashMap<ConnId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            by_user: DashMap::new(),
            by_conn: DashMap::new(),
        }
    }

    /// Register a connection. A second registration for the same user
    /// supersedes the first: the prior entry leaves both indices and the
    /// prior connection is closed. Returns the superseded connection.
    pub fn add(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let superseded = self.by_user.insert(conn.user_id.clone(), conn.clone());
        if let Some(prev) = &superseded {
            self.by_conn.remove(&prev.conn_id);
            prev.close();
        }
        self.by_conn.insert(conn.conn_id, conn);
        superseded
    }

    /// Remove a connection. `by_user` is only cleared when it still points
    /// at this connection, so a superseded handler's teardown cannot evict
    /// its successor. Returns whether this connection was still the active
    /// attachment for its user. Idempotent.
    pub fn remove(&self, conn: &Connection) -> bool {
        self.by_conn.remove(&conn.conn_id);
        self.by_user
            .remove_if(&conn.user_id, |_, current| current.conn_id == conn.conn_id)
            .is_some()
    }

    pub fn get_by_user(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.by_user.get(user_id).map(|entry| entry.clone())
    }

    pub fn get_by_conn(&self, conn_id: &ConnId) -> Option<Arc<Connection>> {
        self.by_conn.get(conn_id).map(|entry| entry.clone())
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.by_user.len()
    }

    /// Visit every registered connection.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<Connection>)) {
        for entry in self.by_user.iter() {
            visitor(entry.value());
        }
    }

    /// User ids of every registered connection.
    pub fn user_ids(&self) -> Vec<String> {
        self.by_user.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close and remove every connection whose last ping is older than
    /// `max_age`. Two-phase: victims are collected first, then closed and
    /// removed, so the sweep count is deterministic even while the maps
    /// are concurrently mutated.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let now = Utc::now().timestamp_millis();
        let max_age_ms = max_age.as_millis() as i64;

        let mut victims = Vec::new();
        for entry in self.by_user.iter() {
            let conn = entry.value();
            if now - conn.last_ping_ms() > max_age_ms {
                victims.push(conn.clone());
            }
        }

        let removed = victims.len();
        for conn in victims {
            warn!(user_id = %conn.user_id, conn_id = %conn.conn_id, "closing stale connection");
            conn.close();
            self.remove(&conn);
        }
        if removed > 0 {
            info!(removed, "swept stale connections");
        }
        removed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(user_id: &str) -> (Arc<Connection>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            Uuid::new_v4(),
            user_id,
            tx,
            CancellationToken::new(),
        ));
        (conn, rx)
    }

    #[test]
    fn indices_stay_consistent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_conn("alice");
        registry.add(conn.clone());

        let by_user = registry.get_by_user("alice").unwrap();
        let by_conn = registry.get_by_conn(&conn.conn_id).unwrap();
        assert_eq!(by_user.conn_id, conn.conn_id);
        assert_eq!(by_conn.user_id, "alice");
        assert_eq!(registry.count(), 1);

        registry.remove(&conn);
        assert!(registry.get_by_user("alice").is_none());
        assert!(registry.get_by_conn(&conn.conn_id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn second_registration_supersedes_the_first() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = test_conn("alice");
        let (second, _rx2) = test_conn("alice");

        assert!(registry.add(first.clone()).is_none());
        let superseded = registry.add(second.clone()).unwrap();

        assert_eq!(superseded.conn_id, first.conn_id);
        assert!(first.is_closed());
        // Both indices now name only the successor.
        assert!(registry.get_by_conn(&first.conn_id).is_none());
        assert_eq!(registry.get_by_user("alice").unwrap().conn_id, second.conn_id);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn superseded_teardown_keeps_the_successor() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = test_conn("alice");
        let (second, _rx2) = test_conn("alice");
        registry.add(first.clone());
        registry.add(second.clone());

        // The superseded handler's teardown must not evict the new entry.
        assert!(!registry.remove(&first));
        assert_eq!(registry.get_by_user("alice").unwrap().conn_id, second.conn_id);

        assert!(registry.remove(&second));
        assert!(registry.get_by_user("alice").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_conn("alice");
        registry.add(conn.clone());

        assert!(registry.remove(&conn));
        assert!(!registry.remove(&conn));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn sweep_closes_only_stale_connections() {
        let registry = ConnectionRegistry::new();
        let (fresh, _rx1) = test_conn("alice");
        let (stale, _rx2) = test_conn("bob");
        registry.add(fresh.clone());
        registry.add(stale.clone());

        stale
            .last_ping
            .store(Utc::now().timestamp_millis() - 200_000, Ordering::Relaxed);

        let removed = registry.sweep_stale(Duration::from_secs(90));
        assert_eq!(removed, 1);
        assert!(stale.is_closed());
        assert!(!fresh.is_closed());
        assert!(registry.get_by_user("bob").is_none());
        assert!(registry.get_by_user("alice").is_some());
    }

    #[test]
    fn send_queues_a_serialized_frame() {
        let (conn, mut rx) = test_conn("alice");
        conn.send(&ServerFrame::Pong).unwrap();

        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), r#"{"type":"pong"}"#),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
