//! Redis-backed meeting store.
//!
//! # Key Patterns
//!
//! - `user:{id}` - user profile hash (`name` field)
//! - `meeting:{id}:chat:seq` - chat id counter
//! - `meeting:{id}:chat` - chat history (list of JSON records)
//! - `meeting:{id}:participant:{user}` - participant record hash
//! - `meeting:{id}:host` - owning user id
//!
//! The `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every call clones it instead of locking.

use super::lua_scripts;
use super::{ChatRecord, MeetingStore, StoreError};
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::Utc;
use common::types::{MeetingId, ParticipantRole, UserId};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

fn chat_seq_key(meeting_id: &MeetingId) -> String {
    format!("meeting:{meeting_id}:chat:seq")
}

fn chat_list_key(meeting_id: &MeetingId) -> String {
    format!("meeting:{meeting_id}:chat")
}

fn participant_key(meeting_id: &MeetingId, user_id: &UserId) -> String {
    format!("meeting:{meeting_id}:participant:{user_id}")
}

fn host_key(meeting_id: &MeetingId) -> String {
    format!("meeting:{meeting_id}:host")
}

fn user_key(user_id: &UserId) -> String {
    format!("user:{user_id}")
}

#[derive(Clone)]
pub struct RedisMeetingStore {
    connection: MultiplexedConnection,
    append_chat_script: Script,
    record_join_script: Script,
    claim_host_script: Script,
}

impl RedisMeetingStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// `StoreError::Backend` if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        // Do not log the URL, it may carry credentials.
        let client = Client::open(redis_url).map_err(|e| {
            error!(target: "signaling.store", error = %e, "Failed to open Redis client");
            StoreError::Backend(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "signaling.store", error = %e, "Failed to connect to Redis");
                StoreError::Backend(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            append_chat_script: Script::new(lua_scripts::APPEND_CHAT),
            record_join_script: Script::new(lua_scripts::RECORD_JOIN),
            claim_host_script: Script::new(lua_scripts::CLAIM_HOST),
        })
    }
}

#[async_trait]
impl MeetingStore for RedisMeetingStore {
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    async fn save_chat_message(
        &self,
        meeting_id: &MeetingId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<ChatRecord, StoreError> {
        let mut conn = self.connection.clone();
        let sent_at = Utc::now();
        let start = Instant::now();

        let id: u64 = self
            .append_chat_script
            .key(chat_seq_key(meeting_id))
            .key(chat_list_key(meeting_id))
            .arg(sender_id.as_str())
            .arg(text)
            .arg(sent_at.to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "signaling.store",
                    error = %e,
                    meeting_id = %meeting_id,
                    "Failed to append chat message"
                );
                StoreError::Backend(format!("Failed to append chat message: {e}"))
            })?;
        metrics::record_store_latency("save_chat_message", start.elapsed());

        debug!(target: "signaling.store", meeting_id = %meeting_id, chat_id = id, "Chat message stored");

        Ok(ChatRecord {
            id,
            meeting_id: meeting_id.clone(),
            sender_id: sender_id.clone(),
            text: text.to_string(),
            sent_at,
        })
    }

    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        conn.hget(user_key(user_id), "name").await.map_err(|e| {
            warn!(target: "signaling.store", error = %e, "Failed to read display name");
            StoreError::Backend(format!("Failed to read display name: {e}"))
        })
    }

    async fn meeting_host(&self, meeting_id: &MeetingId) -> Result<Option<UserId>, StoreError> {
        let mut conn = self.connection.clone();
        let host: Option<String> = conn.get(host_key(meeting_id)).await.map_err(|e| {
            warn!(target: "signaling.store", error = %e, meeting_id = %meeting_id, "Failed to read meeting host");
            StoreError::Backend(format!("Failed to read meeting host: {e}"))
        })?;
        Ok(host.map(UserId::new))
    }

    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    async fn claim_meeting_host(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
    ) -> Result<UserId, StoreError> {
        let mut conn = self.connection.clone();
        let start = Instant::now();

        let owner: String = self
            .claim_host_script
            .key(host_key(meeting_id))
            .arg(user_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "signaling.store",
                    error = %e,
                    meeting_id = %meeting_id,
                    "Failed to claim meeting host"
                );
                StoreError::Backend(format!("Failed to claim meeting host: {e}"))
            })?;
        metrics::record_store_latency("claim_meeting_host", start.elapsed());

        Ok(UserId::new(owner))
    }

    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    async fn record_join(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
        role: &ParticipantRole,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let start = Instant::now();

        let joins: i64 = self
            .record_join_script
            .key(participant_key(meeting_id, user_id))
            .arg(role.as_str())
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "signaling.store",
                    error = %e,
                    meeting_id = %meeting_id,
                    "Failed to record join"
                );
                StoreError::Backend(format!("Failed to record join: {e}"))
            })?;
        metrics::record_store_latency("record_join", start.elapsed());

        debug!(target: "signaling.store", meeting_id = %meeting_id, joins, "Participant join recorded");
        Ok(())
    }

    async fn record_leave(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let start = Instant::now();

        let _: () = conn
            .hset(
                participant_key(meeting_id, user_id),
                "left_at",
                Utc::now().to_rfc3339(),
            )
            .await
            .map_err(|e| {
                warn!(
                    target: "signaling.store",
                    error = %e,
                    meeting_id = %meeting_id,
                    "Failed to record leave"
                );
                StoreError::Backend(format!("Failed to record leave: {e}"))
            })?;
        metrics::record_store_latency("record_leave", start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let meeting = MeetingId::new("m-42");
        let user = UserId::new("u-7");

        assert_eq!(chat_seq_key(&meeting), "meeting:m-42:chat:seq");
        assert_eq!(chat_list_key(&meeting), "meeting:m-42:chat");
        assert_eq!(participant_key(&meeting, &user), "meeting:m-42:participant:u-7");
        assert_eq!(host_key(&meeting), "meeting:m-42:host");
        assert_eq!(user_key(&user), "user:u-7");
    }

    #[tokio::test]
    async fn test_invalid_url_is_backend_error() {
        let result = RedisMeetingStore::connect("not-a-url").await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
