//! Shared vocabulary for meetings, participants and media.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a meeting (the persisted meeting record's ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingId(String);

impl MeetingId {
    /// Wrap an existing meeting identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MeetingId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a platform user. Doubles as the participant ID inside a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an existing user identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short, non-identifying label used when no display name is known.
    #[must_use]
    pub fn fallback_display_name(&self) -> String {
        let short = self.0.get(..8).unwrap_or(&self.0);
        format!("User {short}")
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Role of a participant within a meeting.
///
/// Only `Host` has protocol meaning (admission and moderation); the other
/// roles are carried through for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParticipantRole {
    Host,
    Candidate,
    Interviewer,
    Observer,
    Other(String),
}

impl ParticipantRole {
    /// Whether this role may admit, deny and kick.
    #[must_use]
    pub fn is_host(&self) -> bool {
        matches!(self, ParticipantRole::Host)
    }

    /// Wire representation (upper case, as stored in the meeting records).
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ParticipantRole::Host => "HOST",
            ParticipantRole::Candidate => "CANDIDATE",
            ParticipantRole::Interviewer => "INTERVIEWER",
            ParticipantRole::Observer => "OBSERVER",
            ParticipantRole::Other(other) => other,
        }
    }

    /// Parse a role, case-insensitively. Unknown values are kept verbatim.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "HOST" => ParticipantRole::Host,
            "CANDIDATE" => ParticipantRole::Candidate,
            "INTERVIEWER" => ParticipantRole::Interviewer,
            "OBSERVER" => ParticipantRole::Observer,
            _ => ParticipantRole::Other(value.to_string()),
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ParticipantRole {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ParticipantRole {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(ParticipantRole::parse(&raw))
    }
}

/// Kind of a media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Direction of a participant's transport, from the participant's viewpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}
