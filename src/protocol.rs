//! Relay protocol message definitions.
//!
//! The relay speaks JSON over WebSocket. Every frame is one of the closed
//! tagged unions below, discriminated by its `type` field. WebRTC payloads
//! (`offer`, `answer`, `candidate`) are opaque to the relay and forwarded
//! as-is.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Client → Relay ────────────────────────────────────────────────────────────

/// Messages sent from a client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Bind a user identity to this connection. An empty id is ignored.
    Register {
        #[serde(default)]
        user_id: String,
    },

    /// Ring another user.
    InitiateCall {
        callee_user_id: String,
        room_id: String,
        caller_user_id: String,
        #[serde(default)]
        caller_name: String,
        #[serde(default)]
        kind: CallKind,
        /// Persisted call record id, set by specialist calls.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    AcceptCall {
        caller_user_id: String,
        room_id: String,
    },

    RejectCall {
        caller_user_id: String,
        room_id: String,
    },

    EndCall {
        room_id: String,
        user_id: String,
    },

    JoinRoom {
        room_id: String,
    },

    LeaveRoom {
        room_id: String,
    },

    Offer {
        room_id: String,
        offer: Value,
    },

    Answer {
        room_id: String,
        answer: Value,
    },

    IceCandidate {
        room_id: String,
        candidate: Value,
    },

    SendMessage {
        room_id: String,
        author_user_id: String,
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_ref: Option<String>,
    },

    UpdateMessage {
        message_id: String,
        text: String,
    },

    DeleteMessage {
        message_id: String,
    },

    /// Load persisted chat history for a room.
    FetchHistory {
        room_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    Ping,
}

// ── Relay → Client ────────────────────────────────────────────────────────────

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Acknowledgement of a successful `register`.
    Registered {
        user_id: String,
        connection_id: String,
    },

    IncomingCall {
        caller_user_id: String,
        caller_name: String,
        room_id: String,
        kind: CallKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_image: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_location: Option<String>,
    },

    /// The callee has no live connection.
    NoAnswer {
        callee_user_id: String,
    },

    /// The callee's connection was notified and is ringing.
    CallRinging {
        room_id: String,
        callee_user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        callee_name: Option<String>,
    },

    CallAccepted {
        room_id: String,
    },

    CallRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },

    CallEnded {
        room_id: String,
    },

    /// Another member joined the room; the receiver may send its offer.
    Ready,

    /// A member's connection left the room.
    PeerLeft {
        room_id: String,
    },

    Offer {
        room_id: String,
        offer: Value,
    },

    Answer {
        room_id: String,
        answer: Value,
    },

    IceCandidate {
        room_id: String,
        candidate: Value,
    },

    ReceiveMessage(ChatMessage),

    MessageUpdated(ChatMessage),

    MessageDeleted {
        message_id: String,
        room_id: String,
    },

    MessageHistory {
        room_id: String,
        messages: Vec<ChatMessage>,
    },

    Pong,

    /// Error response, only ever sent to the connection that caused it.
    Error {
        message: String,
    },
}

// ── Supporting Types ──────────────────────────────────────────────────────────

/// Which directory resolves the parties of a call. The state machine and
/// routing are identical for both kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallKind {
    #[default]
    Generic,
    /// Call to a specialist (veterinarian) from the specialist directory.
    #[serde(alias = "teleVet")]
    Specialist,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Generic => f.write_str("generic"),
            CallKind::Specialist => f.write_str("specialist"),
        }
    }
}

/// Display fields of a chat message author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

/// A stored chat message as broadcast to room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub author: Author,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_uses_camel_case() {
        let msg = ClientMessage::Register {
            user_id: "U1".to_string(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"register\""));
        assert!(json.contains("\"userId\":\"U1\""));
    }

    #[test]
    fn test_register_without_user_id_parses_empty() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"type":"register"}"#).unwrap();
        match parsed {
            ClientMessage::Register { user_id } => assert!(user_id.is_empty()),
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_initiate_call_defaults() {
        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "initiateCall",
            "calleeUserId": "U2",
            "roomId": "R1",
            "callerUserId": "U1",
        }))
        .unwrap();

        match parsed {
            ClientMessage::InitiateCall {
                callee_user_id,
                caller_name,
                kind,
                call_id,
                ..
            } => {
                assert_eq!(callee_user_id, "U2");
                assert!(caller_name.is_empty());
                assert_eq!(kind, CallKind::Generic);
                assert!(call_id.is_none());
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_tele_vet_kind_alias() {
        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "initiateCall",
            "calleeUserId": "vet-7",
            "roomId": "vetroom-1",
            "callerUserId": "U1",
            "callerName": "Ramesh",
            "kind": "teleVet",
            "callId": "call-42",
        }))
        .unwrap();

        match parsed {
            ClientMessage::InitiateCall { kind, call_id, .. } => {
                assert_eq!(kind, CallKind::Specialist);
                assert_eq!(call_id.as_deref(), Some("call-42"));
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_unknown_message_type_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"callUser","toUserId":"U2"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_required_field_is_rejected() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"joinRoom"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_offer_payload_is_opaque() {
        let sdp = json!({"type": "offer", "sdp": "v=0\r\no=- 46117 2 IN IP4 127.0.0.1"});
        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "offer",
            "roomId": "R1",
            "offer": sdp.clone(),
        }))
        .unwrap();

        match parsed {
            ClientMessage::Offer { room_id, offer } => {
                assert_eq!(room_id, "R1");
                assert_eq!(offer, sdp);
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_ready_serializes_bare() {
        let json = serde_json::to_value(&ServerMessage::Ready).unwrap();
        assert_eq!(json, json!({"type": "ready"}));
    }

    #[test]
    fn test_incoming_call_omits_absent_fields() {
        let msg = ServerMessage::IncomingCall {
            caller_user_id: "U1".to_string(),
            caller_name: "Ramesh".to_string(),
            room_id: "R1".to_string(),
            kind: CallKind::Generic,
            call_id: None,
            caller_image: None,
            caller_location: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "incomingCall");
        assert_eq!(json["callerUserId"], "U1");
        assert_eq!(json["kind"], "generic");
        assert!(json.get("callId").is_none());
        assert!(json.get("callerImage").is_none());
    }

    #[test]
    fn test_receive_message_inlines_chat_fields() {
        let msg = ServerMessage::ReceiveMessage(ChatMessage {
            id: "m1".to_string(),
            room_id: "farmers".to_string(),
            author: Author {
                id: "U1".to_string(),
                name: "Ramesh".to_string(),
                profile_image: Some("/images/ramesh.png".to_string()),
            },
            text: "Rain expected tomorrow".to_string(),
            image_ref: None,
            created_at: Utc::now(),
            edited: false,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "receiveMessage");
        assert_eq!(json["roomId"], "farmers");
        assert_eq!(json["author"]["profileImage"], "/images/ramesh.png");
        assert_eq!(json["edited"], false);

        let parsed: ServerMessage = serde_json::from_value(json).unwrap();
        match parsed {
            ServerMessage::ReceiveMessage(chat) => assert_eq!(chat.id, "m1"),
            _ => panic!("Wrong variant"),
        }
    }
}
