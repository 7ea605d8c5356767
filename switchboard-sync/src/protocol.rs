//! Binary envelope with JSON bodies.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────────────────┐
//! │ msg_type │ peer_id   │ request_id │ payload (JSON body)  │
//! │ varint   │ 16 bytes  │ varint     │ length-prefixed      │
//! └──────────┴───────────┴────────────┴──────────────────────┘
//! ```
//!
//! Requests (`JoinRoom`, `LeaveRoom`, `Declare`, `ProposeOperations`, `Read`)
//! are answered by exactly one `Ack` or `Reject` carrying the same
//! `request_id`. `Operations` is pushed by the authority with
//! `request_id == 0`.
//!
//! Bodies are JSON because replicant values are arbitrary JSON documents;
//! a present `null` and an absent value stay distinct.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::operation::deserialize_present;
use switchboard_core::{
    AuthoritativeState, Operation, OperationBatch, Proposal, ReplicantError, ReplicantKey,
    ReplicantOptions, Revision,
};
use uuid::Uuid;

/// Sender id used by the authority.
pub const AUTHORITY_ID: Uuid = Uuid::nil();

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Subscribe to a replicant's operation broadcasts
    JoinRoom = 1,
    /// Unsubscribe from a replicant's room
    LeaveRoom = 2,
    /// Peer asks for the authoritative state of a replicant
    Declare = 3,
    /// Peer submits a batch of operations
    ProposeOperations = 4,
    /// Out-of-band read of the current value
    Read = 5,
    /// Authority broadcast of a committed batch
    Operations = 6,
    /// Positive response to a request
    Ack = 7,
    /// Negative response to a request
    Reject = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// `{name, namespace}`, the body of room and read requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomBody {
    #[serde(flatten)]
    pub key: ReplicantKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclareBody {
    #[serde(flatten)]
    pub key: ReplicantKey,
    #[serde(default)]
    pub opts: ReplicantOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeBody {
    #[serde(flatten)]
    pub key: ReplicantKey,
    pub operations: Vec<Operation>,
    pub revision: Revision,
    #[serde(default)]
    pub schema_digest: Option<String>,
    #[serde(default)]
    pub opts: ReplicantOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationsBody {
    #[serde(flatten)]
    pub key: ReplicantKey,
    pub operations: Vec<Operation>,
    pub revision: Revision,
}

impl From<OperationsBody> for OperationBatch {
    fn from(body: OperationsBody) -> Self {
        OperationBatch {
            key: body.key,
            operations: body.operations,
            revision: body.revision,
        }
    }
}

/// Answer to a `Read`. The revision lets a resyncing peer line up with the
/// batches that follow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadBody {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub value: Option<Value>,
    #[serde(default)]
    pub revision: Option<Revision>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectBody {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authoritative: Option<AuthoritativeState>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Correlates a response with its request; 0 for unsolicited messages
    pub request_id: u64,
    /// JSON body (varies by msg_type, may be empty)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_body<T: Serialize>(
        msg_type: MessageType,
        peer_id: Uuid,
        request_id: u64,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type,
            peer_id,
            request_id,
            payload,
        })
    }

    fn bare(msg_type: MessageType, peer_id: Uuid, request_id: u64) -> Self {
        Self {
            msg_type,
            peer_id,
            request_id,
            payload: Vec::new(),
        }
    }

    pub fn join_room(peer_id: Uuid, request_id: u64, key: &ReplicantKey) -> Result<Self, ProtocolError> {
        Self::with_body(MessageType::JoinRoom, peer_id, request_id, &RoomBody { key: key.clone() })
    }

    pub fn leave_room(peer_id: Uuid, request_id: u64, key: &ReplicantKey) -> Result<Self, ProtocolError> {
        Self::with_body(MessageType::LeaveRoom, peer_id, request_id, &RoomBody { key: key.clone() })
    }

    pub fn declare(
        peer_id: Uuid,
        request_id: u64,
        key: &ReplicantKey,
        opts: &ReplicantOptions,
    ) -> Result<Self, ProtocolError> {
        let body = DeclareBody {
            key: key.clone(),
            opts: opts.clone(),
        };
        Self::with_body(MessageType::Declare, peer_id, request_id, &body)
    }

    pub fn propose(
        peer_id: Uuid,
        request_id: u64,
        proposal: &Proposal,
        opts: &ReplicantOptions,
    ) -> Result<Self, ProtocolError> {
        let body = ProposeBody {
            key: proposal.key.clone(),
            operations: proposal.operations.clone(),
            revision: proposal.revision,
            schema_digest: proposal.schema_digest.clone(),
            opts: opts.clone(),
        };
        Self::with_body(MessageType::ProposeOperations, peer_id, request_id, &body)
    }

    pub fn read(peer_id: Uuid, request_id: u64, key: &ReplicantKey) -> Result<Self, ProtocolError> {
        Self::with_body(MessageType::Read, peer_id, request_id, &RoomBody { key: key.clone() })
    }

    /// Authority broadcast of a committed batch.
    pub fn operations(peer_id: Uuid, batch: &OperationBatch) -> Result<Self, ProtocolError> {
        let body = OperationsBody {
            key: batch.key.clone(),
            operations: batch.operations.clone(),
            revision: batch.revision,
        };
        Self::with_body(MessageType::Operations, peer_id, 0, &body)
    }

    /// Acknowledge a request with a body.
    pub fn ack<T: Serialize>(peer_id: Uuid, request_id: u64, body: &T) -> Result<Self, ProtocolError> {
        Self::with_body(MessageType::Ack, peer_id, request_id, body)
    }

    /// Acknowledge a request that has nothing to return.
    pub fn ack_empty(peer_id: Uuid, request_id: u64) -> Self {
        Self::bare(MessageType::Ack, peer_id, request_id)
    }

    pub fn reject(
        peer_id: Uuid,
        request_id: u64,
        reason: impl Into<String>,
        authoritative: Option<AuthoritativeState>,
    ) -> Result<Self, ProtocolError> {
        let body = RejectBody {
            reason: reason.into(),
            authoritative,
        };
        Self::with_body(MessageType::Reject, peer_id, request_id, &body)
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Ping, peer_id, 0)
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Pong, peer_id, 0)
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

    /// Parse the JSON body, whatever the message type.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    fn typed_body<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                found: self.msg_type,
            });
        }
        self.body()
    }

    /// Parse the key of a `JoinRoom`, `LeaveRoom` or `Read`.
    pub fn room_key(&self) -> Result<ReplicantKey, ProtocolError> {
        match self.msg_type {
            MessageType::JoinRoom | MessageType::LeaveRoom | MessageType::Read => {
                self.body::<RoomBody>().map(|b| b.key)
            }
            found => Err(ProtocolError::InvalidMessageType {
                expected: MessageType::JoinRoom,
                found,
            }),
        }
    }

    pub fn declare_body(&self) -> Result<DeclareBody, ProtocolError> {
        self.typed_body(MessageType::Declare)
    }

    pub fn propose_body(&self) -> Result<ProposeBody, ProtocolError> {
        self.typed_body(MessageType::ProposeOperations)
    }

    pub fn operations_body(&self) -> Result<OperationsBody, ProtocolError> {
        self.typed_body(MessageType::Operations)
    }

    pub fn reject_body(&self) -> Result<RejectBody, ProtocolError> {
        self.typed_body(MessageType::Reject)
    }

    /// Parse the body of an `Ack`.
    pub fn ack_body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        self.typed_body(MessageType::Ack)
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid message type: expected {expected:?}, found {found:?}")]
    InvalidMessageType {
        expected: MessageType,
        found: MessageType,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
    #[error("rejected by authority: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Replicant(#[from] ReplicantError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}
