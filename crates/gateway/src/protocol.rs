//! WebSocket protocol message types.
//!
//! Defines the JSON message format for client-server communication.
//! Text frames carry internally tagged records; no binary framing.

use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Claim a user identity for this connection. Valid only before
    /// registration completes.
    Register {
        #[serde(rename = "userId", default)]
        user_id: String,
    },
    /// Application-level heartbeat.
    Ping,
    /// Send a direct message to another user.
    Message {
        #[serde(default)]
        to: String,
        #[serde(default)]
        content: String,
    },
    /// Any tag this gateway does not understand.
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Registration confirmation.
    Registered { content: String },
    /// Heartbeat response.
    Pong,
    /// An inbound message from another user.
    Message { from: String, content: String },
    /// Protocol or routing error. The socket stays open.
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_register() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"register","userId":"alice"}"#).unwrap();
        match frame {
            ClientFrame::Register { user_id } => assert_eq!(user_id, "alice"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn missing_user_id_decodes_empty() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"register"}"#).unwrap();
        match frame {
            ClientFrame::Register { user_id } => assert!(user_id.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_ping() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn decodes_message() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"message","to":"bob","content":"hi"}"#).unwrap();
        match frame {
            ClientFrame::Message { to, content } => {
                assert_eq!(to, "bob");
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_caught() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","channel":"news"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Unknown));
    }

    #[test]
    fn malformed_frame_is_an_error() {
        assert!(serde_json::from_str::<ClientFrame>("not json").is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"to":"bob"}"#).is_err());
    }

    #[test]
    fn server_frames_match_the_wire_format() {
        let registered = ServerFrame::Registered {
            content: "Successfully registered".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&registered).unwrap(),
            r#"{"type":"registered","content":"Successfully registered"}"#
        );

        assert_eq!(
            serde_json::to_string(&ServerFrame::Pong).unwrap(),
            r#"{"type":"pong"}"#
        );

        let message = ServerFrame::Message {
            from: "alice".to_string(),
            content: "hi".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&message).unwrap(),
            r#"{"type":"message","from":"alice","content":"hi"}"#
        );

        let error = ServerFrame::Error {
            error: "Unknown message type".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&error).unwrap(),
            r#"{"type":"error","error":"Unknown message type"}"#
        );
    }
}
