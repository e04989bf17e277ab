//! Binary wire protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ kind     │ sender    │ doc_id   │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! `Update` and `Awareness` payloads are opaque to this layer: the
//! gateway rebroadcasts the exact bytes it received, so every replica
//! merges the identical delta.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::PresencePeer;

/// Message kinds carried over a session's binary channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Client asks for the current document state.
    SyncRequest = 1,
    /// Server sends a full CRDT snapshot.
    SyncResponse = 2,
    /// Incremental CRDT delta (either direction).
    Update = 3,
    /// Ephemeral cursor/selection metadata, never merged into the doc.
    Awareness = 4,
    /// A peer joined the room.
    UserJoined = 5,
    /// A peer left the room.
    UserLeft = 6,
    /// Full presence list, sent to a session on join.
    Roster = 7,
    /// Authorization failed after connect.
    Forbidden = 8,
    /// Heartbeat ping.
    Ping = 9,
    /// Heartbeat pong.
    Pong = 10,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    /// Originating connection (nil for server-originated frames).
    pub sender: Uuid,
    pub doc_id: Uuid,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn sync_request(sender: Uuid, doc_id: Uuid) -> Self {
        Self {
            kind: MessageKind::SyncRequest,
            sender,
            doc_id,
            payload: Vec::new(),
        }
    }

    pub fn sync_response(doc_id: Uuid, snapshot: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncResponse,
            sender: Uuid::nil(),
            doc_id,
            payload: snapshot,
        }
    }

    pub fn update(sender: Uuid, doc_id: Uuid, delta: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Update,
            sender,
            doc_id,
            payload: delta,
        }
    }

    pub fn awareness(sender: Uuid, doc_id: Uuid, state: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Awareness,
            sender,
            doc_id,
            payload: state,
        }
    }

    pub fn user_joined(sender: Uuid, doc_id: Uuid, peer: &PresencePeer) -> Self {
        Self {
            kind: MessageKind::UserJoined,
            sender,
            doc_id,
            payload: encode_payload(peer),
        }
    }

    pub fn user_left(sender: Uuid, doc_id: Uuid, peer: &PresencePeer) -> Self {
        Self {
            kind: MessageKind::UserLeft,
            sender,
            doc_id,
            payload: encode_payload(peer),
        }
    }

    pub fn roster(doc_id: Uuid, peers: &[PresencePeer]) -> Self {
        Self {
            kind: MessageKind::Roster,
            sender: Uuid::nil(),
            doc_id,
            payload: encode_payload(&peers.to_vec()),
        }
    }

    pub fn forbidden(doc_id: Uuid) -> Self {
        Self {
            kind: MessageKind::Forbidden,
            sender: Uuid::nil(),
            doc_id,
            payload: Vec::new(),
        }
    }

    pub fn ping(sender: Uuid) -> Self {
        Self {
            kind: MessageKind::Ping,
            sender,
            doc_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    pub fn pong(sender: Uuid) -> Self {
        Self {
            kind: MessageKind::Pong,
            sender,
            doc_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire form.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a `UserJoined`/`UserLeft` payload.
    pub fn peer(&self) -> Result<PresencePeer, ProtocolError> {
        if !matches!(self.kind, MessageKind::UserJoined | MessageKind::UserLeft) {
            return Err(ProtocolError::InvalidMessageKind);
        }
        decode_payload(&self.payload)
    }

    /// Parse a `Roster` payload.
    pub fn peers(&self) -> Result<Vec<PresencePeer>, ProtocolError> {
        if self.kind != MessageKind::Roster {
            return Err(ProtocolError::InvalidMessageKind);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

fn decode_payload<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidMessageKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageKind => write!(f, "Invalid message kind"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
