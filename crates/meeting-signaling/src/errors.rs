//! Signaling error types.
//!
//! Error types map to numeric codes sent to clients in `error` replies.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::MediaError;
use crate::persistence::StoreError;
use common::types::TransportDirection;
use thiserror::Error;

/// Signaling service error type.
///
/// Maps to client error codes:
/// - Protocol misuse (`NotJoined`, `AlreadyJoined`, `InvalidMessage`): `PROTOCOL` (1)
/// - `PermissionDenied`: `FORBIDDEN` (3)
/// - Unknown references: `NOT_FOUND` (4)
/// - `TransportMissing`: `CONFLICT` (5), retry after fixing ordering
/// - Media, Store, Config, Internal: `INTERNAL_ERROR` (6)
/// - `NoWorkersAvailable`, `RoomTerminated`, `ShuttingDown`: `UNAVAILABLE` (7)
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Meeting has no live room or meeting actor.
    #[error("Meeting not found: {0}")]
    MeetingNotFound(String),

    /// Participant unknown to the room.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Transport unknown or not owned by the participant.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Producer unknown or not owned by the participant.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Consumer unknown or not owned by the participant.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Operation requires a transport that has not been created yet.
    #[error("{} transport not created", .0.as_str())]
    TransportMissing(TransportDirection),

    /// Session must join a meeting first.
    #[error("Session has not joined a meeting")]
    NotJoined,

    /// Session already joined (or is waiting for) a meeting.
    #[error("Session already joined a meeting")]
    AlreadyJoined,

    /// Client frame could not be understood.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Caller is not allowed to perform the action.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Every media worker is dead.
    #[error("No media workers available")]
    NoWorkersAvailable,

    /// The room died with its media worker; the client must rejoin.
    #[error("Room terminated: {0}")]
    RoomTerminated(String),

    /// Node is shutting down.
    #[error("Signaling node is shutting down")]
    ShuttingDown,

    /// Media engine call failed.
    #[error("Media engine error: {0}")]
    Media(#[from] MediaError),

    /// Durable store call failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Returns the client-facing error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            SignalingError::NotJoined
            | SignalingError::AlreadyJoined
            | SignalingError::InvalidMessage(_) => 1, // PROTOCOL
            SignalingError::PermissionDenied(_) => 3, // FORBIDDEN
            SignalingError::MeetingNotFound(_)
            | SignalingError::ParticipantNotFound(_)
            | SignalingError::TransportNotFound(_)
            | SignalingError::ProducerNotFound(_)
            | SignalingError::ConsumerNotFound(_) => 4, // NOT_FOUND
            SignalingError::TransportMissing(_) => 5, // CONFLICT
            SignalingError::Media(_)
            | SignalingError::Store(_)
            | SignalingError::Config(_)
            | SignalingError::Internal(_) => 6, // INTERNAL_ERROR
            SignalingError::NoWorkersAvailable
            | SignalingError::RoomTerminated(_)
            | SignalingError::ShuttingDown => 7, // UNAVAILABLE
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Media(_)
            | SignalingError::Store(_)
            | SignalingError::Config(_)
            | SignalingError::Internal(_) => "An internal error occurred".to_string(),
            SignalingError::MeetingNotFound(_) => "Meeting not found".to_string(),
            SignalingError::ParticipantNotFound(_) => "Not a participant in this room".to_string(),
            SignalingError::TransportNotFound(_) => "Transport not found".to_string(),
            SignalingError::ProducerNotFound(_) => "Producer not found".to_string(),
            SignalingError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SignalingError::NoWorkersAvailable | SignalingError::ShuttingDown => {
                "Server is unavailable, please try again".to_string()
            }
            SignalingError::RoomTerminated(_) => {
                "The meeting room failed, please rejoin".to_string()
            }
            SignalingError::TransportMissing(_)
            | SignalingError::NotJoined
            | SignalingError::AlreadyJoined
            | SignalingError::PermissionDenied(_) => self.to_string(),
            SignalingError::InvalidMessage(_) => "Invalid message".to_string(),
        }
    }

    /// Channel send to an actor failed (actor gone).
    pub(crate) fn send_failed(e: impl std::fmt::Display) -> Self {
        SignalingError::Internal(format!("channel send failed: {e}"))
    }

    /// Actor dropped the reply channel.
    pub(crate) fn recv_failed(e: impl std::fmt::Display) -> Self {
        SignalingError::Internal(format!("response receive failed: {e}"))
    }
}
