//! Wire protocol for the client-facing WebSocket channel.
//!
//! Every frame is a UTF-8 JSON envelope `{type, payload, requestId?, timestamp}`.
//! The payload is kept as raw JSON on parse so each handler decodes only the
//! shape it expects; the timestamp is stamped at encode time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried in S→C `ERROR` envelopes.
pub const ERR_PARSE: &str = "PARSE_ERROR";
pub const ERR_INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
pub const ERR_INVALID_ROOM: &str = "INVALID_ROOM";
pub const ERR_UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a JSON envelope at all.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope parsed but carries no message type.
    #[error("envelope is missing a message type")]
    MissingType,

    /// The envelope could not be serialized for the wire.
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Enumerated message type tags, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Connected,
    Ping,
    Pong,
    JoinRoom,
    LeaveRoom,
    RoomJoined,
    RoomLeft,
    SubmissionCreated,
    SubmissionResult,
    LeaderboardUpdate,
    ContestEvent,
    Error,
    /// Any tag the server does not recognize. Never sent by the server.
    Unknown,
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::JoinRoom => "JOIN_ROOM",
            Self::LeaveRoom => "LEAVE_ROOM",
            Self::RoomJoined => "ROOM_JOINED",
            Self::RoomLeft => "ROOM_LEFT",
            Self::SubmissionCreated => "SUBMISSION_CREATED",
            Self::SubmissionResult => "SUBMISSION_RESULT",
            Self::LeaderboardUpdate => "LEADERBOARD_UPDATE",
            Self::ContestEvent => "CONTEST_EVENT",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "CONNECTED" => Self::Connected,
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            "JOIN_ROOM" => Self::JoinRoom,
            "LEAVE_ROOM" => Self::LeaveRoom,
            "ROOM_JOINED" => Self::RoomJoined,
            "ROOM_LEFT" => Self::RoomLeft,
            "SUBMISSION_CREATED" => Self::SubmissionCreated,
            "SUBMISSION_RESULT" => Self::SubmissionResult,
            "LEADERBOARD_UPDATE" => Self::LeaderboardUpdate,
            "CONTEST_EVENT" => Self::ContestEvent,
            "ERROR" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// A single wire frame. `payload` stays untyped until a handler decodes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Loosely-typed mirror of [`Envelope`] used only during parse, so an empty
/// or missing `type` can be rejected before tag mapping.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(rename = "requestId", default)]
    request_id: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Build an envelope with a serialized payload and no request correlation.
    pub fn new(kind: MessageType, payload: impl Serialize) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self {
            kind,
            payload: Some(payload),
            request_id: None,
            timestamp: None,
        })
    }

    /// Build a payload-less envelope (PING / PONG).
    pub fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            payload: None,
            request_id: None,
            timestamp: None,
        }
    }

    /// Attach the request id of the client message this envelope answers.
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Build an S→C `ERROR` envelope.
    pub fn error(code: &str, message: &str, request_id: Option<String>) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert("code".into(), Value::String(code.into()));
        payload.insert("message".into(), Value::String(message.into()));
        if let Some(id) = &request_id {
            payload.insert("requestId".into(), Value::String(id.clone()));
        }
        Self {
            kind: MessageType::Error,
            payload: Some(Value::Object(payload)),
            request_id,
            timestamp: None,
        }
    }

    /// Parse an inbound frame. The payload is retained undecoded.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope =
            serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        if wire.kind.is_empty() {
            return Err(ProtocolError::MissingType);
        }
        Ok(Self {
            kind: MessageType::from_name(&wire.kind),
            payload: wire.payload,
            request_id: wire.request_id,
            timestamp: wire.timestamp,
        })
    }

    /// Serialize for the wire, stamping the egress timestamp.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut envelope = self.clone();
        envelope.timestamp = Some(Utc::now());
        serde_json::to_vec(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// C→S `JOIN_ROOM` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    #[serde(default)]
    pub room_id: String,
}

/// C→S `LEAVE_ROOM` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoomPayload {
    #[serde(default)]
    pub room_id: String,
}

/// S→C `ROOM_JOINED` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedPayload {
    pub room_id: String,
    pub member_count: usize,
}

/// S→C `ROOM_LEFT` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeftPayload {
    pub room_id: String,
}

/// S→C `CONNECTED` payload, the first frame after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub user_id: String,
    pub instance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_encode_roundtrip() {
        let envelope = Envelope::new(
            MessageType::RoomJoined,
            RoomJoinedPayload {
                room_id: "contest:42".into(),
                member_count: 3,
            },
        )
        .unwrap()
        .with_request_id(Some("r1".into()));

        let bytes = envelope.to_bytes().unwrap();
        let parsed = Envelope::parse(&bytes).unwrap();

        assert_eq!(parsed.kind, MessageType::RoomJoined);
        assert_eq!(parsed.request_id.as_deref(), Some("r1"));
        assert_eq!(parsed.payload, envelope.payload);
        assert!(parsed.timestamp.is_some(), "encode stamps the timestamp");
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(matches!(
            Envelope::parse(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn parse_rejects_missing_type() {
        assert!(matches!(
            Envelope::parse(br#"{"payload":{}}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn parse_rejects_empty_type() {
        assert!(matches!(
            Envelope::parse(br#"{"type":""}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn unrecognized_type_maps_to_unknown() {
        let parsed = Envelope::parse(br#"{"type":"FOO","requestId":"rx"}"#).unwrap();
        assert_eq!(parsed.kind, MessageType::Unknown);
        assert_eq!(parsed.request_id.as_deref(), Some("rx"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let parsed =
            Envelope::parse(br#"{"type":"PING","surprise":true,"requestId":"p1"}"#).unwrap();
        assert_eq!(parsed.kind, MessageType::Ping);
    }

    #[test]
    fn type_tags_use_wire_names() {
        let envelope = Envelope::empty(MessageType::LeaderboardUpdate);
        let bytes = envelope.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "LEADERBOARD_UPDATE");
    }

    #[test]
    fn error_envelope_carries_code_and_request_id() {
        let envelope = Envelope::error(ERR_UNKNOWN_TYPE, "Unknown message type", Some("rx".into()));
        let bytes = envelope.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["payload"]["code"], "UNKNOWN_TYPE");
        assert_eq!(value["payload"]["requestId"], "rx");
        assert_eq!(value["requestId"], "rx");
    }

    #[test]
    fn pong_reply_omits_payload() {
        let envelope = Envelope::empty(MessageType::Pong).with_request_id(Some("p1".into()));
        let bytes = envelope.to_bytes().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("payload").is_none());
        assert_eq!(value["requestId"], "p1");
    }
}
