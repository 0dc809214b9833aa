//! Message types for actor communication.
//!
//! Requests carry a `oneshot` responder; fire-and-forget messages do not.
//! Engine completions are private to each actor and live next to it.

use super::meeting::MeetingActorHandle;
use super::room::RoomHandle;
use crate::errors::SignalingError;
use crate::media::{ConsumerId, ConsumerInfo, MediaProducer, ProducerId, TransportId, TransportInfo};
use crate::persistence::ChatRecord;
use crate::signaling::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use common::types::{MediaKind, MeetingId, ParticipantRole, TransportDirection, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ============================================================================
// Room
// ============================================================================

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Add a participant; responds `true` if newly added, `false` on rejoin.
    AddParticipant {
        user_id: UserId,
        role: ParticipantRole,
        respond_to: oneshot::Sender<Result<bool, SignalingError>>,
    },

    CreateTransport {
        user_id: UserId,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportInfo, SignalingError>>,
    },

    ConnectTransport {
        user_id: UserId,
        transport_id: TransportId,
        dtls_parameters: Value,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    Produce {
        user_id: UserId,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
        respond_to: oneshot::Sender<Result<ProducerSummary, SignalingError>>,
    },

    /// Responds `Ok(None)` when the receiver cannot decode the producer.
    Consume {
        user_id: UserId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        respond_to: oneshot::Sender<Result<Option<ConsumerInfo>, SignalingError>>,
    },

    ResumeConsumer {
        user_id: UserId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    SetProducerPaused {
        user_id: UserId,
        producer_id: ProducerId,
        paused: bool,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    CloseProducer {
        user_id: UserId,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// Every live producer, optionally excluding one participant's own.
    ExistingProducers {
        excluding: Option<UserId>,
        respond_to: oneshot::Sender<Vec<ProducerSummary>>,
    },

    /// Tear a participant down; responds `true` if it was present.
    RemoveParticipant {
        user_id: UserId,
        respond_to: oneshot::Sender<bool>,
    },

    ParticipantCount {
        respond_to: oneshot::Sender<usize>,
    },

    /// Close the room if it has no participants and has been idle for `grace`.
    CloseIfEmpty {
        grace: Duration,
        respond_to: oneshot::Sender<bool>,
    },

    /// One representative producer per participant, for quality sampling.
    SampleStats {
        respond_to: oneshot::Sender<Vec<StatsSample>>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Close every participant and release the routing context.
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Events a room publishes to its meeting.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    ProducerAdded(ProducerSummary),
    /// Producers closed without their owner leaving (explicit close or a
    /// transport closing under them).
    ProducersClosed {
        owner: UserId,
        producer_ids: Vec<ProducerId>,
    },
}

/// A live producer as advertised to other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub peer_id: UserId,
    pub kind: MediaKind,
    pub app_data: Value,
}

/// A producer picked to represent a participant in a quality pass.
#[derive(Clone)]
pub struct StatsSample {
    pub user_id: UserId,
    pub producer: Arc<dyn MediaProducer>,
}

impl std::fmt::Debug for StatsSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsSample")
            .field("user_id", &self.user_id)
            .field("producer_id", &self.producer.id())
            .finish()
    }
}

/// Point-in-time view of one participant's resources.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantSnapshot {
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub send_transport: Option<TransportId>,
    pub recv_transport: Option<TransportId>,
    pub producers: Vec<ProducerId>,
    /// `(consumer_id, producer_id)` pairs.
    pub consumers: Vec<(ConsumerId, ProducerId)>,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub meeting_id: MeetingId,
    pub room_id: u64,
    pub worker_id: String,
    pub participants: Vec<ParticipantSnapshot>,
}

impl RoomState {
    #[must_use]
    pub fn participant(&self, user_id: &UserId) -> Option<&ParticipantSnapshot> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Messages sent to the `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    GetOrCreateRoom {
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Result<RoomHandle, SignalingError>>,
    },

    GetRoom {
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Option<RoomHandle>>,
    },

    /// Snapshot of every live room.
    ListRooms {
        respond_to: oneshot::Sender<Vec<RoomHandle>>,
    },

    /// Close every room and stop.
    Shutdown { respond_to: oneshot::Sender<()> },
}

// ============================================================================
// Meeting
// ============================================================================

/// A connection asking to join a meeting.
#[derive(Debug)]
pub struct JoinRequest {
    pub connection_id: String,
    pub user_id: UserId,
    pub role: ParticipantRole,
    /// Shown to hosts while the user waits.
    pub display_name: String,
    /// Server-initiated events for this connection.
    pub notices: mpsc::UnboundedSender<SessionNotice>,
}

/// Everything a session needs once it is in the room.
#[derive(Debug, Clone)]
pub struct JoinedInfo {
    pub room: RoomHandle,
    pub rtp_capabilities: Value,
    pub existing_producers: Vec<ProducerSummary>,
    pub participant_count: usize,
}

#[derive(Debug)]
pub enum JoinOutcome {
    Joined(JoinedInfo),
    Waiting,
}

/// Server-initiated events pushed to a session.
#[derive(Debug)]
pub enum SessionNotice {
    /// Forward to the client as is.
    Deliver(ServerMessage),
    /// The waiting session was admitted.
    Admitted(JoinedInfo),
    /// Kicked or denied; the client is expected to disconnect.
    Kicked { meeting_id: MeetingId },
    /// The room died; the session must rejoin.
    RoomFailed { meeting_id: MeetingId, reason: String },
}

/// Messages sent to a `MeetingActor`.
#[derive(Debug)]
pub enum MeetingMessage {
    Join {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinOutcome, SignalingError>>,
    },

    /// The connection left (disconnect or explicit leave).
    Disconnect {
        connection_id: String,
        respond_to: Option<oneshot::Sender<()>>,
    },

    Admit {
        requester: UserId,
        target: UserId,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    Deny {
        requester: UserId,
        target: UserId,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    Kick {
        requester: UserId,
        target: UserId,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    RaiseHand {
        connection_id: String,
        raised: bool,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// Persist, then relay.
    Chat {
        connection_id: String,
        text: String,
        respond_to: oneshot::Sender<Result<ChatRecord, SignalingError>>,
    },

    /// Quality scores from the monitor, one per participant.
    Quality { scores: Vec<(UserId, u8)> },

    /// Stop the actor if it has no sessions; responds whether it stopped.
    RetireIfIdle { respond_to: oneshot::Sender<bool> },

    GetState {
        respond_to: oneshot::Sender<MeetingState>,
    },
}

/// Phase of a session inside a meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Waiting,
    Joined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection_id: String,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub phase: SessionPhase,
    pub display_name: String,
}

/// Point-in-time view of a meeting.
#[derive(Debug, Clone)]
pub struct MeetingState {
    pub meeting_id: MeetingId,
    pub sessions: Vec<SessionSnapshot>,
    /// Waiting users in queue order.
    pub waiting: Vec<UserId>,
    pub room_id: Option<u64>,
}

impl MeetingState {
    #[must_use]
    pub fn joined_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .sessions
            .iter()
            .filter(|s| s.phase == SessionPhase::Joined)
            .map(|s| s.user_id.clone())
            .collect();
        users.dedup();
        users
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Messages sent to the `SignalingHubActor`.
#[derive(Debug)]
pub enum HubMessage {
    /// Meeting actor for `meeting_id`, created on demand.
    GetOrCreateMeeting {
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Result<MeetingActorHandle, SignalingError>>,
    },

    /// Existing meeting actor only.
    GetMeeting {
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Option<MeetingActorHandle>>,
    },

    /// A meeting actor has no sessions left.
    MeetingIdle { meeting_id: MeetingId, generation: u64 },

    GetStatus {
        respond_to: oneshot::Sender<HubStatus>,
    },

    /// Stop accepting meetings, cancel every meeting actor and stop.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Hub status for health and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStatus {
    pub meetings: usize,
    pub accepting_new: bool,
}
