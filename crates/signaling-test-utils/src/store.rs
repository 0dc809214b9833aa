//! Store wrapper with failure and latency injection.
//!
//! # Example
//!
//! ```rust,ignore
//! use signaling_test_utils::FlakyStore;
//!
//! let store = FlakyStore::new();
//! store.fail_chat(true);
//! // chat-message now gets an INTERNAL_ERROR reply and is not relayed
//! ```

use async_trait::async_trait;
use common::types::{MeetingId, ParticipantRole, UserId};
use meeting_signaling::persistence::{ChatRecord, InMemoryStore, MeetingStore, StoreError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// An [`InMemoryStore`] whose calls can be made to fail or stall.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_chat: AtomicBool,
    fail_participants: AtomicBool,
    fail_display_names: AtomicBool,
    fail_hosts: AtomicBool,
    delay_ms: AtomicU64,
}

impl FlakyStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The backing store, for assertions on what was persisted.
    #[must_use]
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    pub fn fail_chat(&self, fail: bool) {
        self.fail_chat.store(fail, Ordering::SeqCst);
    }

    /// Fail `record_join` and `record_leave`.
    pub fn fail_participants(&self, fail: bool) {
        self.fail_participants.store(fail, Ordering::SeqCst);
    }

    pub fn fail_display_names(&self, fail: bool) {
        self.fail_display_names.store(fail, Ordering::SeqCst);
    }

    /// Fail `meeting_host` and `claim_meeting_host`.
    pub fn fail_hosts(&self, fail: bool) {
        self.fail_hosts.store(fail, Ordering::SeqCst);
    }

    /// Delay every call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    async fn gate(&self, flag: &AtomicBool) -> Result<(), StoreError> {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Backend("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MeetingStore for FlakyStore {
    async fn save_chat_message(
        &self,
        meeting_id: &MeetingId,
        sender_id: &UserId,
        text: &str,
    ) -> Result<ChatRecord, StoreError> {
        self.gate(&self.fail_chat).await?;
        self.inner.save_chat_message(meeting_id, sender_id, text).await
    }

    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        self.gate(&self.fail_display_names).await?;
        self.inner.display_name(user_id).await
    }

    async fn meeting_host(&self, meeting_id: &MeetingId) -> Result<Option<UserId>, StoreError> {
        self.gate(&self.fail_hosts).await?;
        self.inner.meeting_host(meeting_id).await
    }

    async fn claim_meeting_host(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
    ) -> Result<UserId, StoreError> {
        self.gate(&self.fail_hosts).await?;
        self.inner.claim_meeting_host(meeting_id, user_id).await
    }

    async fn record_join(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
        role: &ParticipantRole,
    ) -> Result<(), StoreError> {
        self.gate(&self.fail_participants).await?;
        self.inner.record_join(meeting_id, user_id, role).await
    }

    async fn record_leave(
        &self,
        meeting_id: &MeetingId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        self.gate(&self.fail_participants).await?;
        self.inner.record_leave(meeting_id, user_id).await
    }
}
