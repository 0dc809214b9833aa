//! Pre-configured test data fixtures for signaling tests.
//!
//! Provides builders and test data for:
//! - Meetings
//! - Participants with different roles
//! - Client frames (media requests with placeholder parameters)

use common::types::{MediaKind, MeetingId, ParticipantRole, TransportDirection, UserId};
use meeting_signaling::signaling::ClientMessage;
use serde_json::{json, Value};
use uuid::Uuid;

/// Test meeting fixture.
#[derive(Debug, Clone)]
pub struct TestMeeting {
    /// Meeting ID.
    pub id: MeetingId,
}

impl TestMeeting {
    /// Create a new test meeting with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: MeetingId::new(id),
        }
    }

    /// Create a test meeting with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("meeting-{}", Uuid::new_v4()))
    }
}

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    /// User ID.
    pub user_id: UserId,
    /// Display name (seed it into the store to see it in notices).
    pub name: String,
    pub role: ParticipantRole,
}

impl TestParticipant {
    /// Create a participant with the given name and role and a random user ID.
    #[must_use]
    pub fn new(name: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            user_id: UserId::new(format!("user-{}", Uuid::new_v4())),
            name: name.into(),
            role,
        }
    }

    #[must_use]
    pub fn host(name: impl Into<String>) -> Self {
        Self::new(name, ParticipantRole::Host)
    }

    #[must_use]
    pub fn candidate(name: impl Into<String>) -> Self {
        Self::new(name, ParticipantRole::Candidate)
    }

    #[must_use]
    pub fn interviewer(name: impl Into<String>) -> Self {
        Self::new(name, ParticipantRole::Interviewer)
    }

    /// Set an explicit user ID (for reproducible tests).
    #[must_use]
    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.user_id = UserId::new(user_id);
        self
    }

    /// The `join-room` message for `meeting`.
    #[must_use]
    pub fn join_message(&self, meeting: &TestMeeting) -> ClientMessage {
        ClientMessage::JoinRoom {
            meeting_id: meeting.id.clone(),
            user_id: self.user_id.clone(),
            role: self.role.clone(),
        }
    }
}

/// Placeholder DTLS parameters accepted by the in-memory engine.
#[must_use]
pub fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }]
    })
}

/// Placeholder RTP parameters for a producer of `kind`.
#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> Value {
    let mime_type = match kind {
        MediaKind::Audio => "audio/opus",
        MediaKind::Video => "video/VP8",
    };
    json!({ "codecs": [{ "mimeType": mime_type, "payloadType": 100, "clockRate": 48000 }] })
}

/// Receiver capabilities that can decode every codec the engine offers.
#[must_use]
pub fn rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ]
    })
}

#[must_use]
pub fn create_transport(direction: TransportDirection) -> ClientMessage {
    ClientMessage::CreateTransport { direction }
}

#[must_use]
pub fn connect_transport(transport_id: &str) -> ClientMessage {
    ClientMessage::ConnectTransport {
        transport_id: transport_id.to_string(),
        dtls_parameters: dtls_parameters(),
    }
}

#[must_use]
pub fn produce(kind: MediaKind) -> ClientMessage {
    ClientMessage::Produce {
        kind,
        rtp_parameters: rtp_parameters(kind),
        app_data: json!({ "source": "camera" }),
    }
}

#[must_use]
pub fn consume(producer_id: &str) -> ClientMessage {
    ClientMessage::Consume {
        producer_id: producer_id.to_string(),
        rtp_capabilities: rtp_capabilities(),
    }
}
