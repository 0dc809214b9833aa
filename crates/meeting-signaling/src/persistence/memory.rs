//! Process-local store, used when no Redis URL is configured and in tests.

use super::{ChatRecord, MeetingStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MeetingId, ParticipantRole, UserId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Stored participant bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRecord {
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    /// Number of times the user (re)joined.
    pub join_count: u32,
}

#[derive(Default)]
struct StoreState {
    chat: HashMap<MeetingId, Vec<ChatRecord>>,
    names: HashMap<UserId, String>,
    hosts: HashMap<MeetingId, UserId>,
    participants: HashMap<(MeetingId, UserId), ParticipantRecord>,
}

/// In-memory [`MeetingStore`].
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_display_name(&self, user_id: &UserId, name: &str) {
        self.state().names.insert(user_id.clone(), name.to_string());
    }

    /// Record the meeting's owner, as meeting creation would.
    pub fn set_meeting_host(&self, meeting_id: &MeetingId, user_id: &UserId) {
        self.state().hosts.insert(meeting_id.clone(), user_id.clone());
    }

    /// Chat history of a meeting in append order.
    #[must_use]
    pub fn chat_messages(&self, meeting_id: &MeetingId) -> Vec<ChatRecord> {
        self.state().chat.get(meeting_id).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn participant(&self, meeting_id: &MeetingId, user_id: &UserId) -> Option<ParticipantRecord> {
        self.state()
            .participants
            .get(&(meeting_id.clone(), user_id.clone()))
            .cloned()
    }
}

#[async_trait]
impl MeetingStore for InMemoryStore {
    async fn save_chat_message(
        &self,
        meeting_id: &MeetingId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<ChatRecord, StoreError> {
        let mut state = self.state();
        let history = state.chat.entry(meeting_id.clone()).or_default();
        let record = ChatRecord {
            id: u64::try_from(history.len()).unwrap_or(u64::MAX).saturating_add(1),
            meeting_id: meeting_id.clone(),
            sender_id: sender_id.clone(),
            text: text.to_string(),
            sent_at: Utc::now(),
        };
        history.push(record.clone());
        Ok(record)
    }

    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        Ok(self.state().names.get(user_id).cloned())
    }

    async fn meeting_host(&self, meeting_id: &MeetingId) -> Result<Option<UserId>, StoreError> {
        Ok(self.state().hosts.get(meeting_id).cloned())
    }

    async fn claim_meeting_host(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
    ) -> Result<UserId, StoreError> {
        Ok(self
            .state()
            .hosts
            .entry(meeting_id.clone())
            .or_insert_with(|| user_id.clone())
            .clone())
    }

    async fn record_join(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
        role: &ParticipantRole,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.state()
            .participants
            .entry((meeting_id.clone(), user_id.clone()))
            .and_modify(|record| {
                record.role = role.clone();
                record.joined_at = now;
                record.left_at = None;
                record.join_count = record.join_count.saturating_add(1);
            })
            .or_insert_with(|| ParticipantRecord {
                role: role.clone(),
                joined_at: now,
                left_at: None,
                join_count: 1,
            });
        Ok(())
    }

    async fn record_leave(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        if let Some(record) = self
            .state()
            .participants
            .get_mut(&(meeting_id.clone(), user_id.clone()))
        {
            record.left_at = Some(Utc::now());
        }
        Ok(())
    }
}
