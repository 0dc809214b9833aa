//! Durable meeting records.
//!
//! The signaling core needs little from storage: append a chat message
//! before it is relayed, look up a display name for waiting-room notices,
//! resolve who owns a meeting, and keep participant join/leave
//! bookkeeping. Failures never touch
//! in-memory room state; callers degrade (drop the chat with an error reply,
//! fall back to a generated display name, log the bookkeeping miss).

pub mod lua_scripts;
pub mod memory;
pub mod redis_store;

use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MeetingId, ParticipantRole, UserId};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::warn;

pub use memory::{InMemoryStore, ParticipantRecord};
pub use redis_store::RedisMeetingStore;

/// Errors from the durable store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend call failed (connection, timeout, script error).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    /// Per-meeting sequence number; relay order follows it.
    pub id: u64,
    pub meeting_id: MeetingId,
    pub sender_id: UserId,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait MeetingStore: Send + Sync + 'static {
    /// Durably append a chat message and return the stored record.
    async fn save_chat_message(
        &self,
        meeting_id: &MeetingId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<ChatRecord, StoreError>;

    /// Display name for a user, if one is on record.
    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>, StoreError>;

    /// The user who owns the meeting, if one is on record.
    async fn meeting_host(&self, meeting_id: &MeetingId) -> Result<Option<UserId>, StoreError>;

    /// Record `user_id` as the meeting's owner unless an owner is already on
    /// record. Returns the owner either way.
    async fn claim_meeting_host(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
    ) -> Result<UserId, StoreError>;

    /// Insert or refresh the participant record (joined-at, role).
    async fn record_join(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
        role: &ParticipantRole,
    ) -> Result<(), StoreError>;

    /// Mark the participant as having left.
    async fn record_leave(&self, meeting_id: &MeetingId, user_id: &UserId)
        -> Result<(), StoreError>;
}

/// Display name for waiting-room notices; never fails.
pub async fn resolve_display_name(store: &dyn MeetingStore, user_id: &UserId) -> String {
    let start = Instant::now();
    let result = store.display_name(user_id).await;
    metrics::record_store_latency("display_name", start.elapsed());

    match result {
        Ok(Some(name)) if !name.trim().is_empty() => name,
        Ok(_) => user_id.fallback_display_name(),
        Err(e) => {
            warn!(
                target: "signaling.store",
                user_id = %user_id,
                error = %e,
                "Display name lookup failed, using fallback"
            );
            user_id.fallback_display_name()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl MeetingStore for BrokenStore {
        async fn save_chat_message(
            &self,
            _meeting_id: &MeetingId,
            _sender_id: &UserId,
            _text: &str,
        ) -> Result<ChatRecord, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }

        async fn display_name(&self, _user_id: &UserId) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }

        async fn meeting_host(&self, _meeting_id: &MeetingId) -> Result<Option<UserId>, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }

        async fn claim_meeting_host(
            &self,
            _meeting_id: &MeetingId,
            _user_id: &UserId,
        ) -> Result<UserId, StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }

        async fn record_join(
            &self,
            _meeting_id: &MeetingId,
            _user_id: &UserId,
            _role: &ParticipantRole,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }

        async fn record_leave(
            &self,
            _meeting_id: &MeetingId,
            _user_id: &UserId,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_display_name_falls_back_on_store_failure() {
        let user = UserId::new("a1b2c3d4e5f6");
        assert_eq!(resolve_display_name(&BrokenStore, &user).await, "User a1b2c3d4");
    }

    #[tokio::test]
    async fn test_display_name_prefers_stored_value() {
        let store = InMemoryStore::new();
        let user = UserId::new("u-1");
        store.set_display_name(&user, "Ada Lovelace");
        assert_eq!(resolve_display_name(&store, &user).await, "Ada Lovelace");

        let blank = UserId::new("u-blank-user");
        store.set_display_name(&blank, "  ");
        assert_eq!(resolve_display_name(&store, &blank).await, "User u-blank-");
    }
}
