//! `SignalingHubActor` - singleton supervisor for meeting actors.
//!
//! - Creates one `MeetingActor` per meeting on first use
//! - Retires meeting actors once they report no sessions left
//! - Detects meeting actors that stopped on their own (panics)
//! - Stops accepting meetings on shutdown and cancels the rest
//!
//! A meeting actor reports idle with its generation; the hub then asks it to
//! retire. A session racing the retirement gets `MeetingNotFound` from the
//! stale handle and fetches a fresh one.

use crate::errors::SignalingError;
use crate::persistence::MeetingStore;

use super::meeting::{MeetingActor, MeetingActorHandle, MeetingContext};
use super::messages::{HubMessage, HubStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;

use common::types::{MeetingId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the hub mailbox.
const HUB_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown waits for meeting actors to finish.
const MEETING_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `SignalingHubActor`.
#[derive(Clone)]
pub struct SignalingHubHandle {
    sender: mpsc::Sender<HubMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl std::fmt::Debug for SignalingHubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingHubHandle")
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SignalingHubHandle {
    /// Spawn the hub and return a handle to it.
    #[must_use]
    pub fn new(
        registry: RoomRegistryHandle,
        store: Arc<dyn MeetingStore>,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(HUB_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Hub, "signaling-hub"));

        let actor = SignalingHubActor {
            receiver,
            sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            meetings: HashMap::new(),
            next_generation: 0,
            retired_tx: None,
            accepting_new: true,
            registry,
            store,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubMessage,
    ) -> Result<T, SignalingError> {
        if self.cancel_token.is_cancelled() {
            return Err(SignalingError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(SignalingError::send_failed)?;
        self.mailbox.record_enqueue();
        rx.await.map_err(SignalingError::recv_failed)
    }

    /// The meeting's actor, spawned if absent.
    pub async fn get_or_create_meeting(
        &self,
        meeting_id: MeetingId,
    ) -> Result<MeetingActorHandle, SignalingError> {
        self.request(|respond_to| HubMessage::GetOrCreateMeeting {
            meeting_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_meeting(
        &self,
        meeting_id: MeetingId,
    ) -> Result<Option<MeetingActorHandle>, SignalingError> {
        self.request(|respond_to| HubMessage::GetMeeting {
            meeting_id,
            respond_to,
        })
        .await
    }

    /// Push quality scores to a meeting's joined sessions. No-op for an
    /// unknown meeting.
    pub async fn broadcast_quality(&self, meeting_id: MeetingId, scores: Vec<(UserId, u8)>) {
        if let Ok(Some(meeting)) = self.get_meeting(meeting_id).await {
            meeting.broadcast_quality(scores);
        }
    }

    pub async fn status(&self) -> Result<HubStatus, SignalingError> {
        self.request(|respond_to| HubMessage::GetStatus { respond_to })
            .await
    }

    /// Stop accepting meetings and stop every meeting actor.
    pub async fn shutdown(&self) -> Result<(), SignalingError> {
        let result = self
            .request(|respond_to| HubMessage::Shutdown { respond_to })
            .await;
        self.cancel_token.cancel();
        result
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ManagedMeeting {
    handle: MeetingActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `SignalingHubActor` implementation.
pub struct SignalingHubActor {
    receiver: mpsc::Receiver<HubMessage>,
    /// Given to meeting actors for idle reports.
    sender: mpsc::Sender<HubMessage>,
    cancel_token: CancellationToken,
    meetings: HashMap<MeetingId, ManagedMeeting>,
    next_generation: u64,
    retired_tx: Option<mpsc::UnboundedSender<(MeetingId, u64)>>,
    accepting_new: bool,
    registry: RoomRegistryHandle,
    store: Arc<dyn MeetingStore>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl SignalingHubActor {
    #[instrument(skip_all, name = "signaling.actor.hub")]
    async fn run(mut self) {
        info!(target: "signaling.hub", "SignalingHubActor started");

        let (retired_tx, mut retired_rx) = mpsc::unbounded_channel();
        self.retired_tx = Some(retired_tx);

        loop {
            self.check_meeting_health();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "signaling.hub", "SignalingHubActor received cancellation signal");
                    self.stop_meetings().await;
                    break;
                }

                Some((meeting_id, generation)) = retired_rx.recv() => {
                    self.forget(&meeting_id, generation);
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let stop = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if stop {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        info!(
            target: "signaling.hub",
            meetings_remaining = self.meetings.len(),
            messages_processed = self.mailbox.messages_processed(),
            "SignalingHubActor stopped"
        );
    }

    async fn handle_message(&mut self, message: HubMessage) -> bool {
        match message {
            HubMessage::GetOrCreateMeeting {
                meeting_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get_or_create(meeting_id));
            }

            HubMessage::GetMeeting {
                meeting_id,
                respond_to,
            } => {
                let handle = self
                    .meetings
                    .get(&meeting_id)
                    .filter(|m| !m.handle.is_closed())
                    .map(|m| m.handle.clone());
                let _ = respond_to.send(handle);
            }

            HubMessage::MeetingIdle {
                meeting_id,
                generation,
            } => self.retire_if_idle(meeting_id, generation),

            HubMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(HubStatus {
                    meetings: self.meetings.len(),
                    accepting_new: self.accepting_new,
                });
            }

            HubMessage::Shutdown { respond_to } => {
                info!(
                    target: "signaling.hub",
                    meetings = self.meetings.len(),
                    "Hub shutting down"
                );
                self.stop_meetings().await;
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    fn get_or_create(&mut self, meeting_id: MeetingId) -> Result<MeetingActorHandle, SignalingError> {
        if !self.accepting_new {
            return Err(SignalingError::ShuttingDown);
        }

        if let Some(existing) = self.meetings.get(&meeting_id) {
            if !existing.handle.is_closed() {
                return Ok(existing.handle.clone());
            }
        }

        self.next_generation += 1;
        let (handle, task_handle) = MeetingActor::spawn(MeetingContext {
            meeting_id: meeting_id.clone(),
            generation: self.next_generation,
            registry: self.registry.clone(),
            store: Arc::clone(&self.store),
            hub: self.sender.clone(),
            cancel_token: self.cancel_token.child_token(),
            metrics: Arc::clone(&self.metrics),
        });

        debug!(
            target: "signaling.hub",
            meeting_id = %meeting_id,
            generation = self.next_generation,
            "Meeting actor created"
        );

        self.meetings.insert(
            meeting_id,
            ManagedMeeting {
                handle: handle.clone(),
                task_handle,
            },
        );
        Ok(handle)
    }

    /// Ask an idle meeting to stop without blocking the hub on it.
    fn retire_if_idle(&self, meeting_id: MeetingId, generation: u64) {
        let Some(managed) = self.meetings.get(&meeting_id) else {
            return;
        };
        if managed.handle.generation() != generation {
            return;
        }
        let Some(retired_tx) = self.retired_tx.clone() else {
            return;
        };

        let handle = managed.handle.clone();
        tokio::spawn(async move {
            if handle.retire_if_idle().await {
                let _ = retired_tx.send((meeting_id, generation));
            }
        });
    }

    fn forget(&mut self, meeting_id: &MeetingId, generation: u64) {
        let matches = self
            .meetings
            .get(meeting_id)
            .is_some_and(|m| m.handle.generation() == generation);
        if matches {
            self.meetings.remove(meeting_id);
            debug!(
                target: "signaling.hub",
                meeting_id = %meeting_id,
                generation,
                remaining = self.meetings.len(),
                "Idle meeting retired"
            );
        }
    }

    /// Drop meeting actors whose task ended without retiring.
    fn check_meeting_health(&mut self) {
        let finished: Vec<MeetingId> = self
            .meetings
            .iter()
            .filter(|(_, m)| m.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for meeting_id in finished {
            if let Some(managed) = self.meetings.remove(&meeting_id) {
                // Retirements are forgotten through the retired channel; a
                // finished task still here either just retired or died.
                debug!(
                    target: "signaling.hub",
                    meeting_id = %meeting_id,
                    generation = managed.handle.generation(),
                    "Meeting actor task finished"
                );
            }
        }
    }

    async fn stop_meetings(&mut self) {
        self.accepting_new = false;

        let tasks: Vec<(MeetingId, JoinHandle<()>)> = self
            .meetings
            .drain()
            .map(|(id, managed)| {
                managed.handle.cancel();
                (id, managed.task_handle)
            })
            .collect();

        for (meeting_id, task) in tasks {
            match tokio::time::timeout(MEETING_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    target: "signaling.hub",
                    meeting_id = %meeting_id,
                    error = ?e,
                    "Meeting actor panicked during shutdown"
                ),
                Err(_) => warn!(
                    target: "signaling.hub",
                    meeting_id = %meeting_id,
                    "Meeting actor shutdown timed out"
                ),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::{JoinOutcome, JoinRequest};
    use crate::media::{InMemoryMediaEngine, MediaEngine};
    use crate::persistence::InMemoryStore;
    use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
    use common::types::ParticipantRole;

    async fn setup() -> SignalingHubHandle {
        let engine: Arc<dyn MediaEngine> = Arc::new(InMemoryMediaEngine::new());
        let pool = WorkerPool::start(engine, WorkerPoolConfig::default())
            .await
            .unwrap();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(pool, Duration::from_secs(30), Arc::clone(&metrics));
        SignalingHubHandle::new(registry, Arc::new(InMemoryStore::new()), metrics)
    }

    fn request(connection_id: &str, user: &str) -> JoinRequest {
        let (tx, _rx) = mpsc::unbounded_channel();
        JoinRequest {
            connection_id: connection_id.to_string(),
            user_id: UserId::new(user),
            role: ParticipantRole::Candidate,
            display_name: user.to_string(),
            notices: tx,
        }
    }

    #[tokio::test]
    async fn test_same_meeting_same_actor() {
        let hub = setup().await;
        let a = hub.get_or_create_meeting(MeetingId::new("m-1")).await.unwrap();
        let b = hub.get_or_create_meeting(MeetingId::new("m-1")).await.unwrap();
        let c = hub.get_or_create_meeting(MeetingId::new("m-2")).await.unwrap();

        assert_eq!(a.generation(), b.generation());
        assert_ne!(a.generation(), c.generation());
        assert_eq!(hub.status().await.unwrap().meetings, 2);
    }

    #[tokio::test]
    async fn test_idle_meeting_is_retired_and_replaced() {
        let hub = setup().await;
        let meeting = hub.get_or_create_meeting(MeetingId::new("m-1")).await.unwrap();
        let outcome = meeting.join(request("c-1", "u-1")).await.unwrap();
        assert!(matches!(outcome, JoinOutcome::Joined(_)));

        meeting.disconnect("c-1".to_string()).await;

        // Idle report → retire → forget, all asynchronous.
        for _ in 0..100 {
            if hub.status().await.unwrap().meetings == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hub.status().await.unwrap().meetings, 0);
        assert!(meeting.is_closed());

        let fresh = hub.get_or_create_meeting(MeetingId::new("m-1")).await.unwrap();
        assert!(fresh.generation() > meeting.generation());
        assert!(matches!(
            meeting.join(request("c-2", "u-1")).await,
            Err(SignalingError::MeetingNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_meeting_does_not_create() {
        let hub = setup().await;
        assert!(hub.get_meeting(MeetingId::new("nope")).await.unwrap().is_none());
        assert_eq!(hub.status().await.unwrap().meetings, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_meetings() {
        let hub = setup().await;
        let meeting = hub.get_or_create_meeting(MeetingId::new("m-1")).await.unwrap();

        hub.shutdown().await.unwrap();
        assert!(meeting.is_closed());
        assert!(matches!(
            hub.get_or_create_meeting(MeetingId::new("m-2")).await,
            Err(SignalingError::ShuttingDown)
        ));
    }
}
