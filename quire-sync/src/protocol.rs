//! Binary wire protocol for the realtime port.
//!
//! Wire format (bincode-encoded, one message per binary WebSocket frame):
//! ```text
//! ┌──────────┬─────────────┬──────────┬──────────┐
//! │ msg_type │ document_id │ seq      │ payload  │
//! │ varint   │ len + utf-8 │ varint   │ len + .. │
//! └──────────┴─────────────┴──────────┴──────────┘
//! ```
//!
//! | Client → server | Server → client |
//! |-----------------|-----------------|
//! | `Join`          | `Sync` (full state) |
//! | `Push` (delta)  | `Ack` (seq) to sender, `Update` to the room |
//! | `RequestDiff` (state vector) | `Diff` |
//! | `Leave`         | |
//! | `Ping`          | `Pong` |
//!
//! Any request may be answered with `Error`, whose `seq` carries an HTTP-style
//! status code and whose payload is a UTF-8 message.

use quire_core::DocumentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Subscribe to a document and receive its full state
    Join = 1,
    /// Unsubscribe from a document
    Leave = 2,
    /// Full state sent in reply to `Join`
    Sync = 3,
    /// Local delta to apply
    Push = 4,
    /// Sequence number assigned to a pushed delta
    Ack = 5,
    /// Delta pushed by another peer
    Update = 6,
    /// Request the delta against a state vector
    RequestDiff = 7,
    /// Reply to `RequestDiff`
    Diff = 8,
    Error = 9,
    Ping = 10,
    Pong = 11,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Empty for `Ping` / `Pong`
    pub document_id: String,
    /// Assigned sequence for `Ack` and `Update`, status code for `Error`
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, document_id: &DocumentId, seq: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            document_id: document_id.as_str().to_string(),
            seq,
            payload,
        }
    }

    pub fn join(document_id: &DocumentId) -> Self {
        Self::new(MessageType::Join, document_id, 0, Vec::new())
    }

    pub fn leave(document_id: &DocumentId) -> Self {
        Self::new(MessageType::Leave, document_id, 0, Vec::new())
    }

    pub fn sync(document_id: &DocumentId, state: Vec<u8>) -> Self {
        Self::new(MessageType::Sync, document_id, 0, state)
    }

    pub fn push(document_id: &DocumentId, delta: Vec<u8>) -> Self {
        Self::new(MessageType::Push, document_id, 0, delta)
    }

    pub fn ack(document_id: &DocumentId, seq: u64) -> Self {
        Self::new(MessageType::Ack, document_id, seq, Vec::new())
    }

    /// Relayed delta. Carries the payload verbatim.
    pub fn update(document_id: &DocumentId, seq: u64, delta: Vec<u8>) -> Self {
        Self::new(MessageType::Update, document_id, seq, delta)
    }

    pub fn request_diff(document_id: &DocumentId, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::RequestDiff, document_id, 0, state_vector)
    }

    pub fn diff(document_id: &DocumentId, delta: Vec<u8>) -> Self {
        Self::new(MessageType::Diff, document_id, 0, delta)
    }

    pub fn error(document_id: &DocumentId, code: u16, message: &str) -> Self {
        Self::new(
            MessageType::Error,
            document_id,
            u64::from(code),
            message.as_bytes().to_vec(),
        )
    }

    pub fn ping() -> Self {
        Self {
            msg_type: MessageType::Ping,
            document_id: String::new(),
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            msg_type: MessageType::Pong,
            ..Self::ping()
        }
    }

    pub fn document(&self) -> DocumentId {
        DocumentId::new(self.document_id.clone())
    }

    /// Message text of an `Error` frame.
    pub fn error_message(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Error {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_roundtrip() {
        let doc = DocumentId::new("ep-1");
        let msg = SyncMessage::push(&doc, vec![1, 2, 3, 4, 5]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.document(), doc);
    }

    #[test]
    fn test_ack_carries_full_width_seq() {
        let doc = DocumentId::new("ep-1");
        // Beyond the range a double represents exactly.
        let seq = (1u64 << 53) + 1;
        let decoded = SyncMessage::decode(&SyncMessage::ack(&doc, seq).encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Ack);
        assert_eq!(decoded.seq, seq);
    }

    #[test]
    fn test_error_frame() {
        let doc = DocumentId::new("ep-1");
        let msg = SyncMessage::error(&doc, 403, "permission denied: edit access to ep-1");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.seq, 403);
        assert_eq!(
            decoded.error_message().unwrap(),
            "permission denied: edit access to ep-1"
        );
        assert!(SyncMessage::ping().error_message().is_err());
    }

    #[test]
    fn test_ping_pong_have_no_document() {
        let ping = SyncMessage::decode(&SyncMessage::ping().encode().unwrap()).unwrap();
        let pong = SyncMessage::decode(&SyncMessage::pong().encode().unwrap()).unwrap();
        assert_eq!(ping.msg_type, MessageType::Ping);
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert!(pong.document_id.is_empty());
    }

    #[test]
    fn test_update_frame_overhead_is_small() {
        let doc = DocumentId::new("ep-1");
        let encoded = SyncMessage::update(&doc, 12, vec![0u8; 50]).encode().unwrap();
        assert!(
            encoded.len() < 70,
            "Encoded size {} too large for 50-byte delta",
            encoded.len()
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(SyncMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::Sync as u8, 3);
        assert_eq!(MessageType::Ack as u8, 5);
        assert_eq!(MessageType::Error as u8, 9);
        assert_eq!(MessageType::Pong as u8, 11);
    }

    #[test]
    fn test_large_delta() {
        let doc = DocumentId::new("ep-1");
        let delta = vec![42u8; 65536];
        let decoded = SyncMessage::decode(&SyncMessage::sync(&doc, delta.clone()).encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, delta);
    }
}
