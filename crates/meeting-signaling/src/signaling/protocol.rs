//! Signaling wire format.
//!
//! Every frame is a JSON object with a kebab-case `type` tag. Client requests
//! may carry a numeric `request_id`; the reply to that request echoes it.
//! Server-initiated events never carry one.
//!
//! ```json
//! { "type": "join-room", "request_id": 1, "meetingId": "m-1", "userId": "u-1", "role": "HOST" }
//! { "type": "room-joined", "request_id": 1, "meetingId": "m-1", "rtpCapabilities": { ... }, ... }
//! { "type": "new-peer", "peerId": "u-2", "connectionId": "...", "role": "CANDIDATE" }
//! ```

use crate::actors::messages::ProducerSummary;
use crate::media::{ConsumerInfo, TransportInfo};
use crate::persistence::ChatRecord;
use common::types::{MediaKind, MeetingId, ParticipantRole, TransportDirection, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A client frame: the message plus its optional correlation ID.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Client → server events.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRoom {
        meeting_id: MeetingId,
        user_id: UserId,
        role: ParticipantRole,
    },
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: Value,
        /// Opaque tag such as `{ "source": "screen" }`; UI grouping only.
        #[serde(default)]
        app_data: Value,
    },
    Consume {
        producer_id: String,
        rtp_capabilities: Value,
    },
    ResumeConsumer {
        consumer_id: String,
    },
    PauseProducer {
        producer_id: String,
    },
    ResumeProducer {
        producer_id: String,
    },
    CloseProducer {
        producer_id: String,
    },
    RaiseHand {
        #[serde(default = "raised_default")]
        raised: bool,
    },
    ChatMessage {
        text: String,
    },
    Admit {
        user_id: UserId,
    },
    Deny {
        user_id: UserId,
    },
    Kick {
        user_id: UserId,
    },
    LeaveRoom,
}

fn raised_default() -> bool {
    true
}

impl ClientMessage {
    /// Bounded label for metrics and logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::CreateTransport { .. } => "create-transport",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resume-consumer",
            ClientMessage::PauseProducer { .. } => "pause-producer",
            ClientMessage::ResumeProducer { .. } => "resume-producer",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::RaiseHand { .. } => "raise-hand",
            ClientMessage::ChatMessage { .. } => "chat-message",
            ClientMessage::Admit { .. } => "admit",
            ClientMessage::Deny { .. } => "deny",
            ClientMessage::Kick { .. } => "kick",
            ClientMessage::LeaveRoom => "leave-room",
        }
    }
}

/// ICE server advertised to clients in `room-joined`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// A server frame.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerEnvelope {
    /// A server-initiated event.
    #[must_use]
    pub fn event(message: ServerMessage) -> Self {
        Self {
            request_id: None,
            message,
        }
    }

    /// A reply to the request with `request_id`.
    #[must_use]
    pub fn reply(request_id: Option<u64>, message: ServerMessage) -> Self {
        Self {
            request_id,
            message,
        }
    }
}

/// Server → client events and replies.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Join deferred until a host admits the user.
    WaitingRoom {
        meeting_id: MeetingId,
    },
    RoomJoined {
        meeting_id: MeetingId,
        rtp_capabilities: Value,
        ice_servers: Vec<IceServer>,
        existing_producers: Vec<ProducerSummary>,
        participant_count: usize,
    },
    NewPeer {
        peer_id: UserId,
        connection_id: String,
        role: ParticipantRole,
    },
    PeerLeft {
        peer_id: UserId,
    },
    /// Sent to hosts only.
    ParticipantWaiting {
        user_id: UserId,
        name: String,
        connection_id: String,
    },
    NewProducer(ProducerSummary),
    ProducerClosed {
        producer_id: String,
        peer_id: UserId,
    },
    HandRaised {
        peer_id: UserId,
        raised: bool,
    },
    ChatMessage(ChatRecord),
    NetworkQuality {
        peer_id: UserId,
        /// 1 (worst) to 5 (best).
        score: u8,
    },
    /// Kicked or denied; the client should disconnect.
    Kicked {
        meeting_id: MeetingId,
    },
    /// The room died with its media worker; rejoin to continue.
    RoomFailed {
        meeting_id: MeetingId,
        reason: String,
    },
    TransportCreated {
        direction: TransportDirection,
        #[serde(flatten)]
        transport: TransportInfo,
    },
    TransportConnected {
        transport_id: String,
    },
    Produced {
        producer_id: String,
    },
    /// `consumer` is null when the receiver cannot decode the producer.
    Consumed {
        consumer: Option<ConsumerInfo>,
    },
    Ack,
    Error {
        code: i32,
        message: String,
    },
}

impl ServerMessage {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            ServerMessage::WaitingRoom { .. } => "waiting-room",
            ServerMessage::RoomJoined { .. } => "room-joined",
            ServerMessage::NewPeer { .. } => "new-peer",
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::ParticipantWaiting { .. } => "participant-waiting",
            ServerMessage::NewProducer(_) => "new-producer",
            ServerMessage::ProducerClosed { .. } => "producer-closed",
            ServerMessage::HandRaised { .. } => "hand-raised",
            ServerMessage::ChatMessage(_) => "chat-message",
            ServerMessage::NetworkQuality { .. } => "network-quality",
            ServerMessage::Kicked { .. } => "kicked",
            ServerMessage::RoomFailed { .. } => "room-failed",
            ServerMessage::TransportCreated { .. } => "transport-created",
            ServerMessage::TransportConnected { .. } => "transport-connected",
            ServerMessage::Produced { .. } => "produced",
            ServerMessage::Consumed { .. } => "consumed",
            ServerMessage::Ack => "ack",
            ServerMessage::Error { .. } => "error",
        }
    }
}
