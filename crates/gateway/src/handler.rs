//! Per-socket connection handler.
//!
//! One handler task owns each upgraded socket from accept to teardown. It
//! drives the read loop, the heartbeat-expiry check, and the send path;
//! inbound cross-gateway delivery reaches the socket through the
//! connection's outbound channel instead of touching it directly.

use crate::connection::{ConnId, Connection, ConnectionRegistry};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::server::AppState;
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use presence::PresenceError;
use router::RoutedMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle a WebSocket connection until either peer closes, an I/O error
/// occurs, the heartbeat expires, or the gateway shuts down.
pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Single writer task per socket; everything queued on this channel is
    // written in order.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let conn_id = Uuid::new_v4();
    let closed = state.shutdown.child_token();

    counter!("gateway_connections_total").increment(1);
    info!(%conn_id, "new WebSocket connection");

    let mut session: Option<Arc<Connection>> = None;

    // Heartbeat-expiry watcher, parented to this handler's scope. Ticks on
    // the heartbeat interval once a session exists.
    let mut heartbeat = interval(state.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => {
                debug!(%conn_id, "connection scope cancelled");
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &mut session, conn_id, &tx, &closed, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match std::str::from_utf8(&data) {
                            Ok(text) => handle_frame(&state, &mut session, conn_id, &tx, &closed, text).await,
                            Err(_) => send_error(&tx, "Invalid message format"),
                        }
                    }
                    // Transport-level keepalive; axum answers pings itself.
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!(%conn_id, %err, "WebSocket read error");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Some(conn) = &session {
                    let idle_ms = Utc::now().timestamp_millis() - conn.last_ping_ms();
                    if idle_ms > state.config.heartbeat_timeout.as_millis() as i64 {
                        info!(user_id = %conn.user_id, idle_ms, "heartbeat timeout, closing connection");
                        break;
                    }
                }
            }
        }
    }

    if let Some(conn) = session.take() {
        let was_active = state.registry.remove(&conn);
        if was_active {
            if let Err(err) = state.presence.remove(&conn.user_id).await {
                warn!(user_id = %conn.user_id, %err, "failed to remove presence on disconnect");
            }
        }
        info!(user_id = %conn.user_id, %conn_id, "user disconnected");
    }
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.count() as f64);
}

/// Dispatch a single decoded text frame.
async fn handle_frame(
    state: &Arc<AppState>,
    session: &mut Option<Arc<Connection>>,
    conn_id: ConnId,
    tx: &mpsc::UnboundedSender<Message>,
    closed: &CancellationToken,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(%conn_id, %err, "failed to decode client frame");
            send_error(tx, "Invalid message format");
            return;
        }
    };

    match frame {
        ClientFrame::Register { user_id } => {
            if session.is_some() {
                send_error(tx, "Already registered");
                return;
            }
            if user_id.is_empty() {
                send_error(tx, "UserID is required for registration");
                return;
            }

            let conn = Arc::new(Connection::new(
                conn_id,
                user_id.clone(),
                tx.clone(),
                closed.clone(),
            ));
            if let Some(prev) = state.registry.add(conn.clone()) {
                info!(%user_id, prev_conn_id = %prev.conn_id, "superseding previous attachment");
            }

            match state
                .presence
                .register(&user_id, &state.config.gateway_id, &conn_id.to_string())
                .await
            {
                Ok(()) => {}
                // A newer attachment elsewhere already owns the directory
                // entry; routing will follow it, this socket stays usable.
                Err(PresenceError::Stale { .. }) => {
                    info!(%user_id, "stale presence update rejected");
                }
                // Presence errors never terminate a socket: registration
                // stays local and the client may retry.
                Err(err) => {
                    warn!(%user_id, %err, "failed to register presence");
                }
            }

            info!(%user_id, gateway_id = %state.config.gateway_id, %conn_id, "user registered");
            *session = Some(conn);
            send_frame(
                tx,
                &ServerFrame::Registered {
                    content: "Successfully registered".to_string(),
                },
            );
            gauge!("gateway_active_connections").set(state.registry.count() as f64);
        }

        ClientFrame::Ping => {
            let Some(conn) = session.as_ref() else {
                send_error(tx, "Not registered");
                return;
            };
            conn.update_ping();
            match state.presence.refresh(&conn.user_id).await {
                Ok(true) => {}
                Ok(false) => debug!(user_id = %conn.user_id, "presence record absent on refresh"),
                Err(err) => warn!(user_id = %conn.user_id, %err, "failed to refresh presence"),
            }
            send_frame(tx, &ServerFrame::Pong);
        }

        ClientFrame::Message { to, content } => {
            let Some(conn) = session.as_ref() else {
                send_error(tx, "Not registered");
                return;
            };
            if to.is_empty() {
                send_error(tx, "Recipient is required");
                return;
            }

            let record = match state.presence.lookup(&to).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    debug!(%to, "recipient offline");
                    send_error(tx, &format!("User {to} is offline"));
                    return;
                }
                Err(err) => {
                    warn!(%to, %err, "presence lookup failed");
                    send_error(tx, "Failed to send message");
                    return;
                }
            };

            let routed = RoutedMessage::direct(conn.user_id.clone(), to.clone(), content);
            match state.router.route_to(&record.gateway_id, &routed).await {
                Ok(()) => {
                    debug!(from = %conn.user_id, %to, target = %record.gateway_id, "message routed");
                    counter!("gateway_messages_routed_total").increment(1);
                }
                Err(err) => {
                    warn!(from = %conn.user_id, %to, %err, "failed to route message");
                    counter!("gateway_routing_errors_total").increment(1);
                    send_error(tx, "Failed to send message");
                }
            }
        }

        ClientFrame::Unknown => send_error(tx, "Unknown message type"),
    }
}

/// Deliver a message routed to this instance to its local recipient.
///
/// Called from the router's consumer task. A recipient that disconnected
/// since presence was consulted is dropped silently.
pub fn deliver(registry: &ConnectionRegistry, msg: RoutedMessage) {
    let Some(conn) = registry.get_by_user(&msg.to) else {
        debug!(to = %msg.to, "recipient not attached locally, dropping");
        counter!("gateway_delivery_dropped_total").increment(1);
        return;
    };

    let frame = ServerFrame::Message {
        from: msg.from,
        content: msg.content,
    };
    match conn.send(&frame) {
        Ok(()) => {
            debug!(to = %conn.user_id, "message delivered");
            counter!("gateway_messages_delivered_total").increment(1);
        }
        Err(err) => debug!(to = %conn.user_id, %err, "failed to deliver message"),
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            if tx.send(Message::Text(json.into())).is_err() {
                debug!("outbound channel closed");
            }
        }
        Err(err) => warn!(%err, "failed to serialize server frame"),
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, reason: &str) {
    send_frame(
        tx,
        &ServerFrame::Error {
            error: reason.to_string(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registered(
        registry: &ConnectionRegistry,
        user_id: &str,
    ) -> UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add(Arc::new(Connection::new(
            Uuid::new_v4(),
            user_id,
            tx,
            CancellationToken::new(),
        )));
        rx
    }

    #[test]
    fn deliver_writes_to_the_recipient() {
        let registry = ConnectionRegistry::new();
        let mut rx = registered(&registry, "bob");

        deliver(&registry, RoutedMessage::direct("alice", "bob", "hi"));

        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(
                text.as_str(),
                r#"{"type":"message","from":"alice","content":"hi"}"#
            ),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn deliver_drops_silently_when_recipient_left() {
        let registry = ConnectionRegistry::new();
        // No connection for bob: the message is dropped without panicking.
        deliver(&registry, RoutedMessage::direct("alice", "bob", "hi"));
    }

    #[test]
    fn deliver_targets_only_the_recipient() {
        let registry = ConnectionRegistry::new();
        let mut bob_rx = registered(&registry, "bob");
        let mut carol_rx = registered(&registry, "carol");

        deliver(&registry, RoutedMessage::direct("alice", "bob", "hi"));

        assert!(bob_rx.try_recv().is_ok());
        assert!(carol_rx.try_recv().is_err());
    }

    #[test]
    fn send_error_produces_an_error_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        send_error(&tx, "Unknown message type");

        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(
                text.as_str(),
                r#"{"type":"error","error":"Unknown message type"}"#
            ),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
