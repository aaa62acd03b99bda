//! Ephemeral Redis pub/sub transport.
//!
//! At-most-once: messages published while this gateway's subscription is
//! down are discarded by the broker.

use crate::error::{Result, RouterError};
use crate::message::RoutedMessage;
use crate::naming::{pubsub_channel, PUBSUB_BROADCAST_CHANNEL};
use crate::{DeliveryHandler, GatewayRouter};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default deadline for a single publish.
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Routes messages between gateways over Redis pub/sub.
pub struct RedisPubSubRouter {
    client: redis::Client,
    publisher: ConnectionManager,
    gateway_id: String,
    cancel: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    publish_timeout: Duration,
}

impl RedisPubSubRouter {
    /// Connect to Redis and build a router for this gateway instance.
    pub async fn connect(redis_url: &str, gateway_id: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = client.get_connection_manager().await?;
        Ok(Self {
            client,
            publisher,
            gateway_id: gateway_id.into(),
            cancel: CancellationToken::new(),
            consumer: Mutex::new(None),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        })
    }

    async fn publish(&self, channel: &str, msg: &RoutedMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = timeout(self.publish_timeout, conn.publish(channel, payload))
            .await
            .map_err(|_| RouterError::Timeout)??;
        debug!(from = %msg.from, to = %msg.to, channel, receivers, "published message");
        Ok(())
    }
}

#[async_trait]
impl GatewayRouter for RedisPubSubRouter {
    async fn start(&self, handler: DeliveryHandler) -> Result<()> {
        let mut guard = self.consumer.lock().await;
        if guard.is_some() {
            return Err(RouterError::AlreadyStarted);
        }

        let channel = pubsub_channel(&self.gateway_id);
        let mut pubsub = self.client.get_async_pubsub().await?;
        // Resolves only once the server has confirmed the subscription, so
        // nothing published after this point can fall into the gap between
        // "subscribe requested" and "subscription active".
        pubsub.subscribe(&channel).await?;
        info!(%channel, "subscribed to gateway channel");

        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!("pub/sub stream ended");
                            break;
                        };
                        match serde_json::from_slice::<RoutedMessage>(msg.get_payload_bytes()) {
                            Ok(routed) => {
                                debug!(from = %routed.from, to = %routed.to, "received message for delivery");
                                handler(routed);
                            }
                            Err(err) => warn!(%err, "failed to decode routed message"),
                        }
                    }
                }
            }
            debug!("pub/sub consumer stopped");
        });
        *guard = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.consumer.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn route_to(&self, target_gateway_id: &str, msg: &RoutedMessage) -> Result<()> {
        self.publish(&pubsub_channel(target_gateway_id), msg).await
    }

    async fn broadcast(&self, msg: &RoutedMessage) -> Result<()> {
        self.publish(PUBSUB_BROADCAST_CHANNEL, msg).await
    }
}
