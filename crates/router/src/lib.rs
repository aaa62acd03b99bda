//! Inter-gateway message routing.
//!
//! Every gateway instance consumes exactly one broker channel of its own and
//! publishes to the channel of whichever instance owns a message's recipient.
//! Two interchangeable transports implement the same contract:
//!
//! - [`RedisPubSubRouter`] — ephemeral Redis pub/sub. At-most-once, lowest
//!   latency; messages published while a subscriber is down are discarded.
//! - [`KafkaLogRouter`] — durable Kafka topics consumed through a named
//!   group. At-least-once, survives restarts; records are keyed by recipient
//!   so per-user ordering holds across senders.
//!
//! The orchestrator holds the transport behind [`GatewayRouter`]; swapping
//! transports is a construction-time decision only.

pub mod error;
pub mod kafka;
pub mod message;
pub mod naming;
pub mod pubsub;

pub use error::{Result, RouterError};
pub use kafka::{KafkaConfig, KafkaLogRouter};
pub use message::{RoutedMessage, HEADER_FROM_GATEWAY, HEADER_TIMESTAMP};
pub use pubsub::RedisPubSubRouter;

use async_trait::async_trait;
use std::sync::Arc;

/// Callback invoked once per inbound message destined for local delivery.
///
/// Called sequentially from the transport's single consumer task, in
/// arrival order.
pub type DeliveryHandler = Arc<dyn Fn(RoutedMessage) + Send + Sync>;

/// Variant-neutral routing capability.
#[async_trait]
pub trait GatewayRouter: Send + Sync {
    /// Begin consuming this gateway's own channel. Does not return until
    /// the subscription is live; messages published after a successful
    /// `start` will be observed.
    async fn start(&self, handler: DeliveryHandler) -> Result<()>;

    /// Signal the consumer loop, wait for it to unwind, and release
    /// transport resources. Idempotent; safe after a failed `start`.
    async fn stop(&self);

    /// Publish a message to the channel owned by `target_gateway_id`.
    async fn route_to(&self, target_gateway_id: &str, msg: &RoutedMessage) -> Result<()>;

    /// Publish a message to the reserved broadcast channel.
    async fn broadcast(&self, msg: &RoutedMessage) -> Result<()>;
}
