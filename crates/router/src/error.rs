//! Router error types.

use thiserror::Error;

/// Router error type.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Kafka client error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Wire encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A publish did not complete within its deadline.
    #[error("publish timed out")]
    Timeout,

    /// `start` was called on a router that is already consuming.
    #[error("router already started")]
    AlreadyStarted,

    /// An operation that needs a delivery handler ran before `start`.
    #[error("router not started")]
    NotStarted,
}

/// Result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;
