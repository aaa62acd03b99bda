//! Deterministic broker channel and topic names.
//!
//! The two transports use different separators for historical reasons;
//! each deployment picks one transport and the naming stays constant.

/// Reserved pub/sub broadcast channel.
pub const PUBSUB_BROADCAST_CHANNEL: &str = "gateway:broadcast";

/// Reserved durable-log broadcast topic.
pub const LOG_BROADCAST_TOPIC: &str = "gateway-broadcast";

/// Pub/sub channel owned by a gateway instance.
pub fn pubsub_channel(gateway_id: &str) -> String {
    format!("gateway:{gateway_id}")
}

/// Durable-log topic owned by a gateway instance.
pub fn log_topic(gateway_id: &str) -> String {
    format!("gateway-{gateway_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubsub_names() {
        assert_eq!(pubsub_channel("G1"), "gateway:G1");
        assert_eq!(PUBSUB_BROADCAST_CHANNEL, "gateway:broadcast");
    }

    #[test]
    fn log_names() {
        assert_eq!(log_topic("G1"), "gateway-G1");
        assert_eq!(LOG_BROADCAST_TOPIC, "gateway-broadcast");
    }
}
