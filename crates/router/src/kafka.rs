//! Durable Kafka transport.
//!
//! At-least-once: each gateway consumes its own topic through a named
//! consumer group, so messages survive subscriber restarts. Records are
//! keyed by the recipient user id, which hash-partitions all traffic for
//! one user onto one partition and preserves per-recipient order across
//! senders.

use crate::error::{Result, RouterError};
use crate::message::{RoutedMessage, HEADER_FROM_GATEWAY, HEADER_TIMESTAMP};
use crate::naming::{log_topic, LOG_BROADCAST_TOPIC};
use crate::{DeliveryHandler, GatewayRouter};
use async_trait::async_trait;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before the consumer loop resumes after a broker error.
const CONSUMER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Kafka transport configuration.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Bootstrap servers, comma-separated.
    pub brokers: String,
    /// Consumer group id.
    pub group_id: String,
    /// Producer compression codec.
    pub compression: String,
    /// Deadline for a single produce.
    pub send_timeout: Duration,
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            compression: "snappy".to_string(),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Routes messages between gateways over Kafka topics.
pub struct KafkaLogRouter {
    producer: FutureProducer,
    consumer: Mutex<Option<StreamConsumer>>,
    handler: RwLock<Option<DeliveryHandler>>,
    gateway_id: String,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    send_timeout: Duration,
}

impl KafkaLogRouter {
    /// Build producer and consumer for this gateway instance.
    pub fn new(gateway_id: impl Into<String>, config: KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .set("compression.codec", &config.compression)
            .create()?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()?;

        Ok(Self {
            producer,
            consumer: Mutex::new(Some(consumer)),
            handler: RwLock::new(None),
            gateway_id: gateway_id.into(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
            send_timeout: config.send_timeout,
        })
    }

    fn headers(&self) -> OwnedHeaders {
        let timestamp = Utc::now().timestamp().to_string();
        OwnedHeaders::new()
            .insert(Header {
                key: HEADER_FROM_GATEWAY,
                value: Some(self.gateway_id.as_str()),
            })
            .insert(Header {
                key: HEADER_TIMESTAMP,
                value: Some(timestamp.as_str()),
            })
    }
}

/// True when a record's `from_gateway` header names this instance.
fn is_from_self<H: Headers>(headers: Option<&H>, gateway_id: &str) -> bool {
    let Some(headers) = headers else {
        return false;
    };
    headers
        .iter()
        .any(|h| h.key == HEADER_FROM_GATEWAY && h.value == Some(gateway_id.as_bytes()))
}

#[async_trait]
impl GatewayRouter for KafkaLogRouter {
    async fn start(&self, handler: DeliveryHandler) -> Result<()> {
        let consumer = self
            .consumer
            .lock()
            .await
            .take()
            .ok_or(RouterError::AlreadyStarted)?;

        let topic = log_topic(&self.gateway_id);
        consumer.subscribe(&[topic.as_str()])?;
        info!(%topic, "consuming gateway topic");

        *self.handler.write().await = Some(handler.clone());

        let gateway_id = self.gateway_id.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    result = consumer.recv() => match result {
                        Ok(record) => {
                            if is_from_self(record.headers(), &gateway_id) {
                                continue;
                            }
                            let Some(payload) = record.payload() else {
                                warn!(offset = record.offset(), "record with empty payload");
                                continue;
                            };
                            // Poison pill: the offset auto-commits either way,
                            // so an undecodable record is logged and skipped.
                            match serde_json::from_slice::<RoutedMessage>(payload) {
                                Ok(routed) => {
                                    debug!(
                                        from = %routed.from,
                                        to = %routed.to,
                                        partition = record.partition(),
                                        offset = record.offset(),
                                        "received message for delivery"
                                    );
                                    handler(routed);
                                }
                                Err(err) => warn!(
                                    %err,
                                    partition = record.partition(),
                                    offset = record.offset(),
                                    "failed to decode routed message, skipping"
                                ),
                            }
                        }
                        Err(err) => {
                            warn!(%err, "Kafka consumer error");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(CONSUMER_RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }
            debug!("Kafka consumer stopped");
        });
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn route_to(&self, target_gateway_id: &str, msg: &RoutedMessage) -> Result<()> {
        // The consumer skips records produced by this instance, so messages
        // for locally attached users go straight to the delivery handler.
        // This runs on the sender's task, not the consumer task; delivery
        // is registry-lookup + channel send and safe to invoke concurrently.
        if target_gateway_id == self.gateway_id {
            let guard = self.handler.read().await;
            let handler = guard.as_ref().ok_or(RouterError::NotStarted)?;
            debug!(from = %msg.from, to = %msg.to, "delivering message locally");
            handler(msg.clone());
            return Ok(());
        }

        let topic = log_topic(target_gateway_id);
        let payload = serde_json::to_vec(msg)?;
        let record = FutureRecord::to(&topic)
            .key(msg.to.as_str())
            .payload(&payload)
            .headers(self.headers());
        let (partition, offset) = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(err, _)| RouterError::Kafka(err))?;
        debug!(from = %msg.from, to = %msg.to, %topic, partition, offset, "routed message");
        Ok(())
    }

    async fn broadcast(&self, msg: &RoutedMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        let record = FutureRecord::<(), _>::to(LOG_BROADCAST_TOPIC)
            .payload(&payload)
            .headers(self.headers());
        let (partition, offset) = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(err, _)| RouterError::Kafka(err))?;
        debug!(from = %msg.from, partition, offset, "broadcast message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_loop_guard_matches_own_id() {
        let headers = OwnedHeaders::new().insert(Header {
            key: HEADER_FROM_GATEWAY,
            value: Some("G1"),
        });
        assert!(is_from_self(Some(&headers), "G1"));
        assert!(!is_from_self(Some(&headers), "G2"));
    }

    #[test]
    fn missing_headers_are_not_self() {
        assert!(!is_from_self::<OwnedHeaders>(None, "G1"));

        let unrelated = OwnedHeaders::new().insert(Header {
            key: HEADER_TIMESTAMP,
            value: Some("1700000000"),
        });
        assert!(!is_from_self(Some(&unrelated), "G1"));
    }
}
