//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Presence directory error.
    #[error("presence error: {0}")]
    Presence(#[from] presence::PresenceError),

    /// Inter-gateway routing error.
    #[error("router error: {0}")]
    Router(#[from] router::RouterError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection's outbound channel is closed.
    #[error("channel send error")]
    ChannelSend,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
