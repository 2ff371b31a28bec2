//! Binary protocol between relay and clients.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len+utf8 │ varint   │ len+raw  │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `peer_id` is the connection id, not the participant id: a participant's
//! durable id travels inside its presence and may change mid-connection.

use estimo_core::{Presence, PresencePatch};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Enter a room; payload is the sender's full presence
    Join = 1,
    /// State vector, asking for what the sender is missing
    SyncStep1 = 2,
    /// Yrs update answering a join or a SyncStep1
    SyncStep2 = 3,
    /// Incremental yrs update
    Delta = 4,
    /// Presence patch
    Presence = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
    /// Join refused; payload is the reason text
    Rejected = 9,
    /// Everyone else in the room with their presence; replaces whatever
    /// the receiver knew
    Roster = 10,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Lamport clock of the sender
    pub clock: u64,
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    pub fn join(peer_id: Uuid, room: &str, presence: &Presence) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Join, peer_id, room, 0, encode_payload(presence)?))
    }

    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room: &str, update: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, update)
    }

    pub fn delta(peer_id: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room, clock, update)
    }

    pub fn presence(peer_id: Uuid, room: &str, clock: u64, patch: &PresencePatch) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Presence, peer_id, room, clock, encode_payload(patch)?))
    }

    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    pub fn rejected(peer_id: Uuid, room: &str, reason: &str) -> Self {
        Self::new(MessageType::Rejected, peer_id, room, 0, reason.as_bytes().to_vec())
    }

    pub fn roster(room: &str, peers: &[(Uuid, Presence)]) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Roster, Uuid::nil(), room, 0, encode_payload(&peers)?))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    /// Parse the presence carried by a Join.
    pub fn presence_state(&self) -> Result<Presence, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        decode_payload(&self.payload)
    }

    /// Parse the patch carried by a Presence message.
    pub fn presence_patch(&self) -> Result<PresencePatch, ProtocolError> {
        if self.msg_type != MessageType::Presence {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        decode_payload(&self.payload)
    }

    /// Parse the peer list carried by a Roster message.
    pub fn roster_entries(&self) -> Result<Vec<(Uuid, Presence)>, ProtocolError> {
        if self.msg_type != MessageType::Roster {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        decode_payload(&self.payload)
    }

    /// Reason text of a Rejected message.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connection closed")]
    ConnectionClosed,
}
