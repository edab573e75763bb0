//! Binary envelope for the relay (push-subscribe) transport.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────────────────┐
//! │ msg_type │ client_id │ room     │ seq      │ payload              │
//! │ 1 byte   │ 16 bytes  │ string   │ varint   │ JSON snapshot / text │
//! └──────────┴───────────┴──────────┴──────────┴──────────────────────┘
//! ```
//!
//! Requests carry a per-client `seq`; the relay echoes it in the reply.
//! Unsolicited fan-out (another client's push, a clear) uses `seq = 0`.

use blindbox_core::Snapshot;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Join a room and receive its snapshot plus every later push
    Subscribe = 1,
    /// Ask for the room's current snapshot
    Pull = 2,
    /// Replace the room's snapshot wholesale
    Push = 3,
    /// Drop the room's snapshot
    Clear = 4,
    /// A snapshot (reply to Subscribe/Pull, or fan-out). Empty payload = none
    Snapshot = 5,
    /// Request accepted
    Ack = 6,
    /// Request refused; payload is a UTF-8 reason
    Nack = 7,
    /// Fan-out notice that the room was cleared
    Cleared = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Top-level relay message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub msg_type: MessageType,
    /// Sender. `Uuid::nil()` for messages originated by the relay itself.
    pub client_id: Uuid,
    pub room: String,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl RelayMessage {
    fn new(
        msg_type: MessageType,
        client_id: Uuid,
        room: impl Into<String>,
        seq: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            client_id,
            room: room.into(),
            seq,
            payload,
        }
    }

    pub fn subscribe(client_id: Uuid, room: impl Into<String>, seq: u64) -> Self {
        Self::new(MessageType::Subscribe, client_id, room, seq, Vec::new())
    }

    pub fn pull(client_id: Uuid, room: impl Into<String>, seq: u64) -> Self {
        Self::new(MessageType::Pull, client_id, room, seq, Vec::new())
    }

    pub fn push(
        client_id: Uuid,
        room: impl Into<String>,
        seq: u64,
        snapshot: &Snapshot,
    ) -> Result<Self, ProtocolError> {
        let payload = snapshot
            .to_json()
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::Push, client_id, room, seq, payload))
    }

    pub fn clear(client_id: Uuid, room: impl Into<String>, seq: u64) -> Self {
        Self::new(MessageType::Clear, client_id, room, seq, Vec::new())
    }

    /// Snapshot carrying already-encoded JSON (`None` = room is empty).
    ///
    /// `origin` is the client whose push produced it, or nil for replies.
    pub fn snapshot(origin: Uuid, room: impl Into<String>, seq: u64, json: Option<&[u8]>) -> Self {
        let payload = json.map(<[u8]>::to_vec).unwrap_or_default();
        Self::new(MessageType::Snapshot, origin, room, seq, payload)
    }

    pub fn ack(room: impl Into<String>, seq: u64) -> Self {
        Self::new(MessageType::Ack, Uuid::nil(), room, seq, Vec::new())
    }

    pub fn nack(room: impl Into<String>, seq: u64, reason: &str) -> Self {
        Self::new(
            MessageType::Nack,
            Uuid::nil(),
            room,
            seq,
            reason.as_bytes().to_vec(),
        )
    }

    pub fn cleared(origin: Uuid, room: impl Into<String>) -> Self {
        Self::new(MessageType::Cleared, origin, room, 0, Vec::new())
    }

    pub fn ping(client_id: Uuid, seq: u64) -> Self {
        Self::new(MessageType::Ping, client_id, String::new(), seq, Vec::new())
    }

    pub fn pong(seq: u64) -> Self {
        Self::new(MessageType::Pong, Uuid::nil(), String::new(), seq, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the snapshot payload of a `Push` or `Snapshot` message.
    pub fn snapshot_payload(&self) -> Result<Option<Snapshot>, ProtocolError> {
        if !matches!(self.msg_type, MessageType::Snapshot | MessageType::Push) {
            return Err(ProtocolError::InvalidMessageType);
        }
        if self.payload.is_empty() {
            return Ok(None);
        }
        Snapshot::from_json(&self.payload)
            .map(Some)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Reason text of a `Nack`.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionFailed(String),
    ConnectionClosed,
    Timeout,
    Rejected(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timeout"),
            Self::Rejected(reason) => write!(f, "Rejected by relay: {reason}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
