//! JSON message envelopes
//!
//! Every application message, in both directions, is a text frame holding
//! `{"type": string, "payload": object}`. Client-to-server types are
//! `clientMessages`, `requestRoomHistory` and `clientCreateRoom`;
//! server-to-client types are `hello`, `serverMessages`, `serverRoomHistory`
//! and `serverCreateRoom`.
//!
//! Parsing severity follows the connection contract: an unparsable outer
//! envelope (bad JSON or missing `type`) is a protocol violation and closes
//! the connection, while an unknown `type` or a bad payload of a known type
//! only drops that one message.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::store::Message;

pub const TYPE_HELLO: &str = "hello";
pub const TYPE_CLIENT_MESSAGES: &str = "clientMessages";
pub const TYPE_SERVER_MESSAGES: &str = "serverMessages";
pub const TYPE_REQUEST_ROOM_HISTORY: &str = "requestRoomHistory";
pub const TYPE_SERVER_ROOM_HISTORY: &str = "serverRoomHistory";
pub const TYPE_CLIENT_CREATE_ROOM: &str = "clientCreateRoom";
pub const TYPE_SERVER_CREATE_ROOM: &str = "serverCreateRoom";

/// Outer envelope with the payload left opaque
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// `{id, username}` as embedded in messages and the hello snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub username: String,
}

/// Wire form of a single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageJson {
    pub id: String,
    pub content: String,
    pub user: UserRef,
    pub timestamp: u64,
}

impl MessageJson {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id.to_string(),
            content: msg.content.clone(),
            user: UserRef {
                id: msg.user_id.clone(),
                username: msg.username.clone(),
            },
            timestamp: msg.timestamp,
        }
    }
}

// ---- client -> server payloads ----

/// One message as submitted by the client. Identity fields the client may
/// attach are ignored; the session stamps its own.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessages {
    pub room_id: String,
    pub messages: Vec<ClientMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub room_id: String,
    /// Pagination cursor; absent or empty means "start from newest"
    #[serde(default)]
    pub first_message_id: Option<String>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub room_name: String,
}

/// A routed client request
#[derive(Debug)]
pub enum ClientRequest {
    Messages(ClientMessages),
    RoomHistory(HistoryRequest),
    CreateRoom(CreateRoomRequest),
}

/// Parse the text payload of a client frame.
///
/// `Err` means the envelope itself was unparsable (close the connection);
/// `Ok(None)` means the message was dropped (unknown type or bad payload)
/// and already logged.
pub fn parse_client_text(text: &str) -> Result<Option<ClientRequest>, ProtocolError> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::BadEnvelope)?;

    let parsed = match raw.kind.as_str() {
        TYPE_CLIENT_MESSAGES => {
            serde_json::from_value(raw.payload).map(ClientRequest::Messages)
        }
        TYPE_REQUEST_ROOM_HISTORY => {
            serde_json::from_value(raw.payload).map(ClientRequest::RoomHistory)
        }
        TYPE_CLIENT_CREATE_ROOM => {
            serde_json::from_value(raw.payload).map(ClientRequest::CreateRoom)
        }
        other => {
            tracing::warn!(r#type = other, "unknown message type, dropping");
            return Ok(None);
        }
    };

    match parsed {
        Ok(request) => Ok(Some(request)),
        Err(e) => {
            tracing::warn!(r#type = %raw.kind, error = %e, "bad payload, dropping message");
            Ok(None)
        }
    }
}

// ---- server -> client payloads ----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRoom {
    pub id: String,
    pub name: String,
    pub has_more_messages: bool,
    /// Always serialized, even when empty; the front-end rejects null
    pub messages: Vec<MessageJson>,
}

#[derive(Debug, Serialize)]
pub struct HelloPayload {
    pub me: UserRef,
    pub rooms: Vec<HelloRoom>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessages {
    pub room_id: String,
    pub messages: Vec<MessageJson>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRoomHistory {
    pub room_id: String,
    pub name: String,
    pub has_more_messages: bool,
    pub messages: Vec<MessageJson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCreateRoom {
    pub room_id: String,
    pub room_name: String,
    pub creator_id: String,
    pub creator_username: String,
}

impl ServerCreateRoom {
    /// All-empty payload signaling a room-name collision to the requester
    pub fn collision() -> Self {
        Self {
            room_id: String::new(),
            room_name: String::new(),
            creator_id: String::new(),
            creator_username: String::new(),
        }
    }
}

/// Serialize a `{type, payload}` envelope
pub fn encode_envelope<P: Serialize>(kind: &str, payload: &P) -> serde_json::Result<String> {
    #[derive(Serialize)]
    struct Envelope<'a, P> {
        #[serde(rename = "type")]
        kind: &'a str,
        payload: &'a P,
    }
    serde_json::to_string(&Envelope { kind, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_messages() {
        let text = r#"{"type":"clientMessages","payload":{"roomId":"r1","messages":[{"content":"hi"},{"content":"there"}]}}"#;
        match parse_client_text(text).unwrap() {
            Some(ClientRequest::Messages(m)) => {
                assert_eq!(m.room_id, "r1");
                assert_eq!(m.messages.len(), 2);
                assert_eq!(m.messages[0].content, "hi");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_history_request_defaults() {
        let text = r#"{"type":"requestRoomHistory","payload":{"roomId":"r1"}}"#;
        match parse_client_text(text).unwrap() {
            Some(ClientRequest::RoomHistory(h)) => {
                assert_eq!(h.room_id, "r1");
                assert!(h.first_message_id.is_none());
                assert!(h.count.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_history_request_with_cursor() {
        let text = r#"{"type":"requestRoomHistory","payload":{"roomId":"r1","firstMessageId":"42","count":5}}"#;
        match parse_client_text(text).unwrap() {
            Some(ClientRequest::RoomHistory(h)) => {
                assert_eq!(h.first_message_id.as_deref(), Some("42"));
                assert_eq!(h.count, Some(5));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_dropped_not_fatal() {
        let text = r#"{"type":"clientTyping","payload":{}}"#;
        assert!(parse_client_text(text).unwrap().is_none());
    }

    #[test]
    fn test_bad_payload_of_known_type_is_dropped() {
        let text = r#"{"type":"clientMessages","payload":{"messages":"nope"}}"#;
        assert!(parse_client_text(text).unwrap().is_none());
    }

    #[test]
    fn test_unparsable_envelope_is_fatal() {
        assert!(parse_client_text("{not json").is_err());
        // valid JSON but no type field
        assert!(parse_client_text(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_encode_server_messages_envelope() {
        let payload = ServerMessages {
            room_id: "r1".into(),
            messages: vec![MessageJson {
                id: "7".into(),
                content: "hello".into(),
                user: UserRef {
                    id: "u1".into(),
                    username: "alice".into(),
                },
                timestamp: 1_700_000_000_000,
            }],
        };
        let json = encode_envelope(TYPE_SERVER_MESSAGES, &payload).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "serverMessages");
        assert_eq!(value["payload"]["roomId"], "r1");
        assert_eq!(value["payload"]["messages"][0]["user"]["username"], "alice");
    }

    #[test]
    fn test_hello_room_serializes_empty_messages_array() {
        let room = HelloRoom {
            id: "r1".into(),
            name: "general".into(),
            has_more_messages: false,
            messages: Vec::new(),
        };
        let json = serde_json::to_string(&room).unwrap();
        assert!(json.contains(r#""messages":[]"#));
        assert!(json.contains(r#""hasMoreMessages":false"#));
    }
}
