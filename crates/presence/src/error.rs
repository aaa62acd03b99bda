//! Presence directory error types.

use thiserror::Error;

/// Presence directory error type.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// A register carried a timestamp older than the stored record.
    #[error("stale update rejected for user {user_id}")]
    Stale { user_id: String },

    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The operation did not complete within its deadline.
    #[error("presence operation timed out")]
    Timeout,
}

/// Result type for presence operations.
pub type Result<T> = std::result::Result<T, PresenceError>;
