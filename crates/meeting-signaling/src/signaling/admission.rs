//! Waiting-room queue for one meeting.
//!
//! Owned by the meeting actor, so every check-then-enqueue is atomic with
//! respect to joins, admits and disconnects of the same meeting.

use crate::observability::metrics;
use common::types::UserId;
use std::collections::VecDeque;
use tracing::debug;

/// A user waiting for a host to let them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingEntry {
    pub user_id: UserId,
    pub display_name: String,
    /// Every waiting connection of the user, oldest first. Admission moves
    /// all of them into the room.
    pub connection_ids: Vec<String>,
}

impl WaitingEntry {
    #[must_use]
    pub fn new(user_id: UserId, display_name: String, connection_id: String) -> Self {
        Self {
            user_id,
            display_name,
            connection_ids: vec![connection_id],
        }
    }
}

/// FIFO of [`WaitingEntry`], at most one per user.
#[derive(Debug, Default)]
pub struct AdmissionController {
    queue: VecDeque<WaitingEntry>,
}

impl AdmissionController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a user. Returns `true` if the user was not already waiting.
    ///
    /// A user already in the queue keeps their position; the entry gains
    /// the new connections.
    pub fn enqueue(&mut self, entry: WaitingEntry) -> bool {
        if let Some(existing) = self.queue.iter_mut().find(|e| e.user_id == entry.user_id) {
            debug!(
                target: "signaling.meeting",
                user_id = %entry.user_id,
                "User already waiting, connection added"
            );
            for connection_id in entry.connection_ids {
                if !existing.connection_ids.contains(&connection_id) {
                    existing.connection_ids.push(connection_id);
                }
            }
            existing.display_name = entry.display_name;
            return false;
        }

        self.queue.push_back(entry);
        metrics::add_waiting_entries(1);
        true
    }

    /// Remove a user's entry (admit or deny).
    pub fn remove(&mut self, user_id: &UserId) -> Option<WaitingEntry> {
        let position = self.queue.iter().position(|e| &e.user_id == user_id)?;
        let entry = self.queue.remove(position);
        if entry.is_some() {
            metrics::add_waiting_entries(-1);
        }
        entry
    }

    /// Detach `connection_id` (that connection went away).
    ///
    /// Returns the entry once its last connection is gone; the user keeps
    /// waiting while any other connection remains.
    pub fn remove_connection(&mut self, connection_id: &str) -> Option<WaitingEntry> {
        let position = self
            .queue
            .iter()
            .position(|e| e.connection_ids.iter().any(|c| c == connection_id))?;
        let entry = self.queue.get_mut(position)?;
        entry.connection_ids.retain(|c| c != connection_id);
        if !entry.connection_ids.is_empty() {
            return None;
        }
        let entry = self.queue.remove(position);
        if entry.is_some() {
            metrics::add_waiting_entries(-1);
        }
        entry
    }

    /// Take every entry, in queue order (host-arrival admission).
    pub fn drain(&mut self) -> Vec<WaitingEntry> {
        let drained: Vec<WaitingEntry> = self.queue.drain(..).collect();
        if !drained.is_empty() {
            metrics::add_waiting_entries(-i64::try_from(drained.len()).unwrap_or(i64::MAX));
        }
        drained
    }

    #[must_use]
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.queue.iter().any(|e| &e.user_id == user_id)
    }

    /// Waiting users in queue order.
    #[must_use]
    pub fn waiting_users(&self) -> Vec<UserId> {
        self.queue.iter().map(|e| e.user_id.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        if !self.queue.is_empty() {
            metrics::add_waiting_entries(-i64::try_from(self.queue.len()).unwrap_or(i64::MAX));
        }
    }
}
