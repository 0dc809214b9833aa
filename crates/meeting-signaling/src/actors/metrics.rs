//! Actor metrics and mailbox monitoring.
//!
//! Mailbox depth thresholds:
//!
//! | Actor Type | Normal | Warning | Critical |
//! |------------|--------|---------|----------|
//! | Registry   | < 200  | 200-1000 | > 1000  |
//! | Hub        | < 200  | 200-1000 | > 1000  |
//! | Room       | < 100  | 100-500 | > 500    |
//! | Meeting    | < 100  | 100-500 | > 500    |
//!
//! Depth is incremented by the handle on send and decremented by the actor
//! after handling, so it reflects messages actually queued.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mailbox depth thresholds for per-meeting actors (room, meeting).
pub const MEETING_MAILBOX_NORMAL: usize = 100;
pub const MEETING_MAILBOX_WARNING: usize = 500;

/// Mailbox depth thresholds for singletons (registry, hub).
pub const SINGLETON_MAILBOX_NORMAL: usize = 200;
pub const SINGLETON_MAILBOX_WARNING: usize = 1000;

/// Actor type for metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RoomRegistryActor` (singleton).
    Registry,
    /// `SignalingHubActor` (singleton).
    Hub,
    /// `RoomActor` (one per live room).
    Room,
    /// `MeetingActor` (one per meeting with sessions).
    Meeting,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Hub => "hub",
            ActorType::Room => "room",
            ActorType::Meeting => "meeting",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Hub => SINGLETON_MAILBOX_WARNING,
            ActorType::Room | ActorType::Meeting => MEETING_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry | ActorType::Hub => SINGLETON_MAILBOX_NORMAL,
            ActorType::Room | ActorType::Meeting => MEETING_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth for one actor.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    /// Meeting ID for per-meeting actors, node ID for singletons.
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
        }
    }

    /// Record a message being added to the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        match self.level_for_depth(new_depth) {
            MailboxLevel::Critical => {
                metrics::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
                warn!(
                    target: "signaling.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    threshold = self.actor_type.warning_threshold(),
                    "Mailbox depth critical"
                );
            }
            MailboxLevel::Warning if new_depth == self.actor_type.normal_threshold() + 1 => {
                metrics::set_actor_mailbox_depth(self.actor_type.as_str(), new_depth);
                debug!(
                    target: "signaling.actor.mailbox",
                    actor_type = self.actor_type.as_str(),
                    actor_id = %self.actor_id,
                    depth = new_depth,
                    "Mailbox depth elevated"
                );
            }
            _ => {}
        }
    }

    /// Record a message being handled.
    pub fn record_dequeue(&self) {
        // Saturate: a message may be handled before its enqueue is recorded.
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)));
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Node-wide actor counts, mirrored into gauges.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    pub active_rooms: AtomicUsize,
    pub active_meetings: AtomicUsize,
    pub active_sessions: AtomicUsize,
    pub total_messages_processed: AtomicU64,
}

fn decrement(counter: &AtomicUsize) -> usize {
    let previous = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
        .unwrap_or(0);
    previous.saturating_sub(1)
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn room_created(&self) {
        let n = self.active_rooms.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_rooms_active(n);
    }

    pub fn room_closed(&self) {
        metrics::set_rooms_active(decrement(&self.active_rooms));
    }

    pub fn meeting_created(&self) {
        self.active_meetings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn meeting_removed(&self) {
        decrement(&self.active_meetings);
    }

    pub fn session_opened(&self) {
        let n = self.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_sessions_active(n);
    }

    pub fn session_closed(&self) {
        metrics::set_sessions_active(decrement(&self.active_sessions));
    }

    pub fn record_message_processed(&self) {
        self.total_messages_processed
            .fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.active_rooms.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn meeting_count(&self) -> usize {
        self.active_meetings.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_type_thresholds() {
        assert_eq!(ActorType::Room.normal_threshold(), 100);
        assert_eq!(ActorType::Meeting.warning_threshold(), 500);
        assert_eq!(ActorType::Registry.normal_threshold(), 200);
        assert_eq!(ActorType::Hub.warning_threshold(), 1000);
        assert_eq!(ActorType::Room.as_str(), "room");
    }

    #[test]
    fn test_mailbox_monitor_enqueue_dequeue() {
        let monitor = MailboxMonitor::new(ActorType::Room, "meeting-123");

        monitor.record_enqueue();
        monitor.record_enqueue();
        monitor.record_enqueue();
        assert_eq!(monitor.current_depth(), 3);
        assert_eq!(monitor.peak_depth(), 3);

        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 2);
        assert_eq!(monitor.peak_depth(), 3);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_dequeue_never_underflows() {
        let monitor = MailboxMonitor::new(ActorType::Meeting, "meeting-1");
        monitor.record_dequeue();
        assert_eq!(monitor.current_depth(), 0);
        assert_eq!(monitor.messages_processed(), 1);
    }

    #[test]
    fn test_mailbox_monitor_levels() {
        let monitor = MailboxMonitor::new(ActorType::Room, "meeting-123");
        assert_eq!(monitor.current_level(), MailboxLevel::Normal);

        for _ in 0..150 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Warning);

        for _ in 0..400 {
            monitor.record_enqueue();
        }
        assert_eq!(monitor.current_level(), MailboxLevel::Critical);
    }

    #[test]
    fn test_actor_metrics_counts() {
        let metrics = ActorMetrics::new();

        metrics.room_created();
        metrics.room_created();
        metrics.room_closed();
        assert_eq!(metrics.room_count(), 1);

        metrics.session_opened();
        metrics.session_closed();
        metrics.session_closed();
        assert_eq!(metrics.session_count(), 0, "never goes negative");

        metrics.meeting_created();
        assert_eq!(metrics.meeting_count(), 1);
        metrics.meeting_removed();
        assert_eq!(metrics.meeting_count(), 0);
    }
}
