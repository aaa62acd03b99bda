//! Gateway configuration.

use std::time::Duration;

/// Configuration for a gateway instance.
///
/// The heartbeat numbers are coupled: a socket is closed when no ping
/// arrives within `heartbeat_timeout`, and the presence TTL equals that
/// timeout (3x the client ping cadence), so a crashed instance's directory
/// entries disappear on the same clock its sockets would have.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Operator-assigned id, unique within the cluster. Names this
    /// instance's broker channel/topic and is recorded in presence entries.
    pub gateway_id: String,
    /// HTTP listen port.
    pub port: u16,
    /// Expected client ping cadence; also the expiry-check tick.
    pub heartbeat_interval: Duration,
    /// Close the socket when no ping arrives within this window.
    pub heartbeat_timeout: Duration,
    /// Cadence of the background stale-connection sweep.
    pub sweep_interval: Duration,
    /// Bound on shutdown cleanup.
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    pub fn new(gateway_id: impl Into<String>, port: u16) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            port,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Presence records expire after 3x the heartbeat interval.
    pub fn presence_ttl(&self) -> Duration {
        3 * self.heartbeat_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_relationships_hold() {
        let config = GatewayConfig::new("G1", 8080);
        assert_eq!(config.presence_ttl(), config.heartbeat_timeout);
        assert_eq!(config.heartbeat_timeout, 3 * config.heartbeat_interval);
        assert!(config.sweep_interval < config.heartbeat_timeout);
    }
}
