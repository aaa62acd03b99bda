//! Routed message wire format.
//!
//! UTF-8 JSON with fields `from`, `to`, `content`, `type`. Unknown inbound
//! fields are ignored; `type` values other than "direct" and "broadcast"
//! are passed through to the delivery handler unchanged.

use serde::{Deserialize, Serialize};

/// Direct point-to-point message.
pub const MESSAGE_TYPE_DIRECT: &str = "direct";

/// Broadcast message.
pub const MESSAGE_TYPE_BROADCAST: &str = "broadcast";

/// Kafka record header naming the producing gateway (self-loop guard).
pub const HEADER_FROM_GATEWAY: &str = "from_gateway";

/// Kafka record header carrying the produce time in unix seconds.
pub const HEADER_TIMESTAMP: &str = "timestamp";

/// A message in flight between gateway instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub from: String,
    pub to: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Reserved for persistence/read-receipt layers; not required here.
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl RoutedMessage {
    /// Build a direct message.
    pub fn direct(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            content: content.into(),
            kind: MESSAGE_TYPE_DIRECT.to_string(),
            message_id: None,
        }
    }

    /// Build a broadcast message.
    pub fn broadcast(from: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: String::new(),
            content: content.into(),
            kind: MESSAGE_TYPE_BROADCAST.to_string(),
            message_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_is_identity() {
        let msg = RoutedMessage::direct("alice", "bob", "hi");
        let encoded = serde_json::to_vec(&msg).unwrap();
        let decoded: RoutedMessage = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn message_id_is_omitted_when_absent() {
        let msg = RoutedMessage::direct("alice", "bob", "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"from":"alice","to":"bob","content":"hi","type":"direct"}"#
        );
    }

    #[test]
    fn message_id_round_trips_when_present() {
        let mut msg = RoutedMessage::direct("alice", "bob", "hi");
        msg.message_id = Some("m-1".to_string());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""messageId":"m-1""#));
        let decoded: RoutedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{"from":"alice","to":"bob","content":"hi","type":"direct","hops":3}"#;
        let decoded: RoutedMessage = serde_json::from_str(json).unwrap();
        assert_eq!(decoded, RoutedMessage::direct("alice", "bob", "hi"));
    }

    #[test]
    fn unknown_type_values_pass_through() {
        let json = r#"{"from":"alice","to":"bob","content":"hi","type":"typing"}"#;
        let decoded: RoutedMessage = serde_json::from_str(json).unwrap();
        assert_eq!(decoded.kind, "typing");
    }
}
