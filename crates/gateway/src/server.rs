//! HTTP surface and background orchestration.

use crate::config::GatewayConfig;
use crate::connection::ConnectionRegistry;
use crate::handler;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics::counter;
use presence::PresenceStore;
use router::GatewayRouter;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Shared application state.
pub struct AppState {
    pub config: GatewayConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: PresenceStore,
    pub router: Arc<dyn GatewayRouter>,
    /// Root cancellation scope; every handler and background task is a
    /// descendant.
    pub shutdown: CancellationToken,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handler::handle_socket(socket, state))
}

/// Health check handler.
async fn health_handler() -> &'static str {
    "OK"
}

/// Instance statistics.
#[derive(Serialize)]
struct StatsResponse {
    #[serde(rename = "gatewayId")]
    gateway_id: String,
    connections: usize,
}

/// Stats handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        gateway_id: state.config.gateway_id.clone(),
        connections: state.registry.count(),
    })
}

/// Spawn the background sweep that closes connections whose heartbeat has
/// expired. Exits when the root scope is cancelled.
pub fn spawn_health_sweep(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(state.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;

                _ = state.shutdown.cancelled() => break,

                _ = ticker.tick() => {
                    let removed = state.registry.sweep_stale(state.config.heartbeat_timeout);
                    if removed > 0 {
                        counter!("gateway_stale_connections_swept_total").increment(removed as u64);
                    }
                }
            }
        }
    })
}

/// Orderly shutdown: cancel the root scope and close every surviving
/// socket (handlers and the sweep exit, handler teardown removes
/// presence), clear any presence entries still registered, then stop the
/// router. Idempotent; the signal path has usually already cancelled the
/// scope so that live sockets close while the listener drains.
pub async fn shutdown(state: &AppState) {
    info!(gateway_id = %state.config.gateway_id, "shutting down gateway");
    state.shutdown.cancel();
    state.registry.for_each(|conn| conn.close());

    for user_id in state.registry.user_ids() {
        if let Err(err) = state.presence.remove(&user_id).await {
            warn!(%user_id, %err, "failed to clear presence during shutdown");
        }
    }

    state.router.stop().await;
}
