//! WebSocket protocol message definitions.
//!
//! The relay speaks a simple JSON-over-WebSocket protocol. Every frame is an
//! object tagged with `"type"`. Targets are `{"kind": "peer"|"room", "name": ...}`.

use giftbox_core::{ChannelEvent, Error, Message, MessageId, Relationship, Target};
use serde::{Deserialize, Serialize};

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this WebSocket connection to a session token from `/api/login`.
    /// Must be sent first after connecting.
    Register { token: String },

    /// Persist a message and push it to subscribers of the target.
    Send {
        target: Target,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        attachment: Option<String>,
        /// Echoed back in the ack so the client can match it up
        #[serde(default)]
        ref_id: Option<String>,
    },

    /// Start receiving pushes for a room (or your own peer key).
    Subscribe { target: Target },

    /// Stop receiving pushes for a key.
    Unsubscribe { target: Target },

    /// Fetch the stored conversation for a peer or room.
    History { target: Target },

    /// Ping to keep connection alive.
    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration accepted.
    Registered {
        identity: String,
        connection_id: String,
    },

    /// A message pushed to one of this connection's keys.
    Message { message: Message },

    /// A friend request involving this identity was created or answered.
    Relationship { relationship: Relationship },

    /// A `send` was persisted.
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        ref_id: Option<String>,
        message_id: MessageId,
    },

    /// Conversation history, oldest first.
    History {
        target: Target,
        messages: Vec<Message>,
    },

    Subscribed { target: Target },

    Unsubscribed { target: Target },

    Pong,

    /// Something went wrong.
    Error { code: i32, message: String },
}

impl ServerMessage {
    /// Error frame carrying the core error code.
    pub fn error(err: &Error) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<ChannelEvent> for ServerMessage {
    fn from(event: ChannelEvent) -> Self {
        match event {
            ChannelEvent::Message(message) => ServerMessage::Message { message },
            ChannelEvent::RelationshipChanged(relationship) => {
                ServerMessage::Relationship { relationship }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use giftbox_core::{Identity, RoomName};

    #[test]
    fn test_client_message_register_deserialization() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"register","token":"abc123"}"#).unwrap();
        match parsed {
            ClientMessage::Register { token } => assert_eq!(token, "abc123"),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_message_send_deserialization() {
        let json = r#"{"type":"send","target":{"kind":"peer","name":"bob"},"text":"hi","ref_id":"r1"}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::Send { target, text, attachment, ref_id } => {
                assert_eq!(target, Target::Peer(Identity::parse("bob").unwrap()));
                assert_eq!(text.as_deref(), Some("hi"));
                assert!(attachment.is_none());
                assert_eq!(ref_id.as_deref(), Some("r1"));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_message_subscribe_room() {
        let json = r#"{"type":"subscribe","target":{"kind":"room","name":"party"}}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::Subscribe { target } => {
                assert_eq!(target, Target::Room(RoomName::parse("party").unwrap()))
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_client_message_rejects_bad_target_name() {
        let json = r#"{"type":"history","target":{"kind":"peer","name":"no spaces"}}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_client_message_ping() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::Ping));
    }

    #[test]
    fn test_server_message_error_serialization() {
        let msg = ServerMessage::error(&Error::AuthorizationDenied("not friends".into()));
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], 303);
        assert!(json["message"].as_str().unwrap().contains("not friends"));
    }

    #[test]
    fn test_server_message_ack_omits_missing_ref() {
        let msg = ServerMessage::Ack {
            ref_id: None,
            message_id: serde_json::from_str("\"m-1\"").unwrap(),
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["message_id"], "m-1");
        assert!(json.get("ref_id").is_none());
    }

    #[test]
    fn test_server_message_pong_serialization() {
        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }
}
