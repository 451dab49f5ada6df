//! Binary protocol for room sessions and CRDT delta synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ string   │ 8 bytes  │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `peer_id` is the sender's connection id (nil for server-originated
//! frames). Sync frames carry raw Yrs bytes; every other payload is itself a
//! bincode-encoded struct.
//!
//! Reference: Patterson & Hennessy, Section 5.7, Data Compression

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::RoomError;
use crate::presence::{AwarenessMessage, PresenceIdentity};
use crate::room::{Document, RoomId, UserId, UserRole};

/// Message types for the room protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector for initial sync handshake
    SyncStep1 = 1,
    /// Yrs state diff response
    SyncStep2 = 2,
    /// Incremental CRDT delta update
    Delta = 3,
    /// Cursor/selection awareness update
    Awareness = 4,
    /// Peer joined notification
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// First frame of a session: who is joining which room
    Join = 9,
    /// Server reply to a successful join
    Welcome = 10,
    /// Room request (title, sharing, ...) with a client sequence number
    Request = 11,
    /// Reply to a `Request`, echoing its sequence number
    Response = 12,
    /// Room metadata changed; carries the new document
    MetadataChanged = 13,
    /// A frame was rejected
    Denied = 14,
}

/// `Join` payload. The room is named in the frame header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub user_id: UserId,
    pub name: String,
    /// Op-log version the client already holds, when rejoining
    pub resume_from: Option<u64>,
}

/// `Welcome` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    pub identity: PresenceIdentity,
    pub document: Document,
    /// Other connections already in the room
    pub peers: Vec<PresenceIdentity>,
    /// Op-log head at join time
    pub version: u64,
}

/// Operations a session may ask of its room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomRequest {
    GetDocument,
    UpdateTitle { title: String },
    UpdateAccess { user: UserId, role: UserRole },
    RemoveCollaborator { user: UserId },
    DeleteRoom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub seq: u64,
    pub request: RoomRequest,
}

/// Why a request failed, in a form that crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestFailure {
    Denied(String),
    NotFound(String),
    InvalidTitle(String),
    CreatorImmutable,
    Internal(String),
}

impl From<&RoomError> for RequestFailure {
    fn from(err: &RoomError) -> Self {
        match err {
            RoomError::PermissionDenied { .. } | RoomError::NotCollaborator(_) => {
                RequestFailure::Denied(err.to_string())
            }
            RoomError::NotFound(_) => RequestFailure::NotFound(err.to_string()),
            RoomError::InvalidTitle(reason) => RequestFailure::InvalidTitle(reason.clone()),
            RoomError::CreatorImmutable => RequestFailure::CreatorImmutable,
            RoomError::AlreadyExists(_) | RoomError::Document(_) | RoomError::Storage(_) => {
                RequestFailure::Internal(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomResponse {
    /// The request succeeded; current document state
    Document(Document),
    /// A newer request from the same writer already won
    Superseded,
    Deleted,
    Failed(RequestFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub seq: u64,
    pub response: RoomResponse,
}

/// `Denied` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeniedNotice {
    /// Type of the rejected frame
    pub rejected: MessageType,
    pub reason: String,
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room_id: RoomId,
    /// Op-log version for deltas, sender counter otherwise
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

impl SyncMessage {
    fn raw(msg_type: MessageType, peer_id: Uuid, room_id: RoomId, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id,
            clock,
            payload,
        }
    }

    pub fn join(room_id: RoomId, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self::raw(MessageType::Join, Uuid::nil(), room_id, 0, encode_payload(request)?))
    }

    pub fn welcome(room_id: RoomId, welcome: &Welcome) -> Result<Self, ProtocolError> {
        Ok(Self::raw(MessageType::Welcome, Uuid::nil(), room_id, welcome.version, encode_payload(welcome)?))
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, room_id: RoomId, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::raw(MessageType::Delta, peer_id, room_id, clock, yrs_update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room_id: RoomId, state_vector: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep1, peer_id, room_id, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response). `clock` is the op-log head.
    pub fn sync_step2(peer_id: Uuid, room_id: RoomId, clock: u64, state_diff: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep2, peer_id, room_id, clock, state_diff)
    }

    pub fn awareness(peer_id: Uuid, room_id: RoomId, msg: &AwarenessMessage) -> Result<Self, ProtocolError> {
        Ok(Self::raw(MessageType::Awareness, peer_id, room_id, 0, encode_payload(msg)?))
    }

    pub fn peer_joined(room_id: RoomId, identity: &PresenceIdentity) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::PeerJoined,
            identity.connection_id,
            room_id,
            0,
            encode_payload(identity)?,
        ))
    }

    pub fn peer_left(peer_id: Uuid, room_id: RoomId) -> Self {
        Self::raw(MessageType::PeerLeft, peer_id, room_id, 0, Vec::new())
    }

    pub fn request(peer_id: Uuid, room_id: RoomId, envelope: &RequestEnvelope) -> Result<Self, ProtocolError> {
        Ok(Self::raw(MessageType::Request, peer_id, room_id, envelope.seq, encode_payload(envelope)?))
    }

    pub fn response(room_id: RoomId, envelope: &ResponseEnvelope) -> Result<Self, ProtocolError> {
        Ok(Self::raw(MessageType::Response, Uuid::nil(), room_id, envelope.seq, encode_payload(envelope)?))
    }

    pub fn metadata_changed(room_id: RoomId, document: &Document) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::MetadataChanged,
            Uuid::nil(),
            room_id,
            document.title_version,
            encode_payload(document)?,
        ))
    }

    pub fn denied(room_id: RoomId, notice: &DeniedNotice) -> Result<Self, ProtocolError> {
        Ok(Self::raw(MessageType::Denied, Uuid::nil(), room_id, 0, encode_payload(notice)?))
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid, room_id: RoomId) -> Self {
        Self::raw(MessageType::Ping, peer_id, room_id, 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid, room_id: RoomId) -> Self {
        Self::raw(MessageType::Pong, peer_id, room_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.parse(MessageType::Join)
    }

    pub fn welcome_info(&self) -> Result<Welcome, ProtocolError> {
        self.parse(MessageType::Welcome)
    }

    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.parse(MessageType::Awareness)
    }

    pub fn peer_identity(&self) -> Result<PresenceIdentity, ProtocolError> {
        self.parse(MessageType::PeerJoined)
    }

    pub fn request_envelope(&self) -> Result<RequestEnvelope, ProtocolError> {
        self.parse(MessageType::Request)
    }

    pub fn response_envelope(&self) -> Result<ResponseEnvelope, ProtocolError> {
        self.parse(MessageType::Response)
    }

    pub fn changed_document(&self) -> Result<Document, ProtocolError> {
        self.parse(MessageType::MetadataChanged)
    }

    pub fn denied_notice(&self) -> Result<DeniedNotice, ProtocolError> {
        self.parse(MessageType::Denied)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Rejected by server: {0}")]
    Denied(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
