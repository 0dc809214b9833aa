//! `MeetingActor` - per-meeting owner of sessions and admission.
//!
//! Each `MeetingActor`:
//! - Owns every signaling session bound to one meeting and its phase
//!   (waiting or joined)
//! - Owns the meeting's waiting-room queue
//! - Resolves the meeting's room through the registry and relays the room's
//!   producer events to the joined sessions
//! - Persists chat before relaying it, so relay order is persistence order
//!
//! Joins, admits, kicks and disconnects of one meeting are serialized here,
//! which makes "is a host present?" and "is this user already waiting?"
//! atomic with the action taken on the answer.
//!
//! # Hosts
//!
//! Declaring the HOST role is not enough to act as host. The store records
//! one owner per meeting (the first HOST-role join claims an unowned
//! meeting); any other HOST-role join is treated like a regular participant.
//!
//! # Room failure
//!
//! When the room terminates underneath the meeting (worker death, shutdown),
//! every joined session gets `room-failed` and is dropped from the meeting;
//! clients rejoin from scratch. Waiting sessions are unaffected.

use crate::errors::SignalingError;
use crate::observability::metrics;
use crate::persistence::{ChatRecord, MeetingStore};
use crate::signaling::admission::{AdmissionController, WaitingEntry};
use crate::signaling::protocol::ServerMessage;

use super::messages::{
    HubMessage, JoinOutcome, JoinRequest, JoinedInfo, MeetingMessage, MeetingState, RoomEvent,
    SessionNotice, SessionPhase, SessionSnapshot,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RoomRegistryHandle;
use super::room::RoomHandle;

use common::types::{MeetingId, ParticipantRole, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the meeting mailbox.
const MEETING_CHANNEL_BUFFER: usize = 500;

/// Handle to a `MeetingActor`.
#[derive(Clone)]
pub struct MeetingActorHandle {
    meeting_id: MeetingId,
    generation: u64,
    sender: mpsc::Sender<MeetingMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl std::fmt::Debug for MeetingActorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeetingActorHandle")
            .field("meeting_id", &self.meeting_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl MeetingActorHandle {
    #[must_use]
    pub fn meeting_id(&self) -> &MeetingId {
        &self.meeting_id
    }

    /// Identifies this actor instance among successive actors of a meeting.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn gone(&self) -> SignalingError {
        SignalingError::MeetingNotFound(self.meeting_id.to_string())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MeetingMessage,
    ) -> Result<T, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|_| self.gone())?;
        self.mailbox.record_enqueue();
        rx.await.map_err(|_| self.gone())
    }

    /// Join directly or enter the waiting room.
    ///
    /// `MeetingNotFound` means this actor retired; fetch a fresh handle.
    pub async fn join(&self, request: JoinRequest) -> Result<JoinOutcome, SignalingError> {
        self.request(|respond_to| MeetingMessage::Join {
            request,
            respond_to,
        })
        .await?
    }

    /// The connection went away (or left explicitly). Waits until applied.
    pub async fn disconnect(&self, connection_id: String) {
        let _ = self
            .request(|respond_to| MeetingMessage::Disconnect {
                connection_id,
                respond_to: Some(respond_to),
            })
            .await;
    }

    pub async fn admit(&self, requester: UserId, target: UserId) -> Result<(), SignalingError> {
        self.request(|respond_to| MeetingMessage::Admit {
            requester,
            target,
            respond_to,
        })
        .await?
    }

    pub async fn deny(&self, requester: UserId, target: UserId) -> Result<(), SignalingError> {
        self.request(|respond_to| MeetingMessage::Deny {
            requester,
            target,
            respond_to,
        })
        .await?
    }

    pub async fn kick(&self, requester: UserId, target: UserId) -> Result<(), SignalingError> {
        self.request(|respond_to| MeetingMessage::Kick {
            requester,
            target,
            respond_to,
        })
        .await?
    }

    pub async fn raise_hand(&self, connection_id: String, raised: bool) -> Result<(), SignalingError> {
        self.request(|respond_to| MeetingMessage::RaiseHand {
            connection_id,
            raised,
            respond_to,
        })
        .await?
    }

    /// Persist a chat message, then relay it to every joined session.
    pub async fn chat(&self, connection_id: String, text: String) -> Result<ChatRecord, SignalingError> {
        self.request(|respond_to| MeetingMessage::Chat {
            connection_id,
            text,
            respond_to,
        })
        .await?
    }

    /// Push quality scores to every joined session. Dropped if the mailbox is full.
    pub fn broadcast_quality(&self, scores: Vec<(UserId, u8)>) {
        match self.sender.try_send(MeetingMessage::Quality { scores }) {
            Ok(()) => self.mailbox.record_enqueue(),
            Err(e) => debug!(
                target: "signaling.meeting",
                meeting_id = %self.meeting_id,
                error = %e,
                "Quality update dropped"
            ),
        }
    }

    /// Stop the actor if it has no sessions. Returns whether it is stopped.
    pub async fn retire_if_idle(&self) -> bool {
        self.request(|respond_to| MeetingMessage::RetireIfIdle { respond_to })
            .await
            .unwrap_or(true)
    }

    pub async fn get_state(&self) -> Result<MeetingState, SignalingError> {
        self.request(|respond_to| MeetingMessage::GetState { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// One signaling session as the meeting sees it.
struct SessionEntry {
    user_id: UserId,
    role: ParticipantRole,
    /// The meeting's owner: may moderate and skips the waiting room.
    host: bool,
    phase: SessionPhase,
    display_name: String,
    notices: mpsc::UnboundedSender<SessionNotice>,
}

impl SessionEntry {
    fn is_joined(&self) -> bool {
        self.phase == SessionPhase::Joined
    }

    fn notify(&self, notice: SessionNotice) {
        // A closed channel means the session is ending; its disconnect follows.
        let _ = self.notices.send(notice);
    }

    fn deliver(&self, message: ServerMessage) {
        self.notify(SessionNotice::Deliver(message));
    }
}

/// What a meeting actor is wired to.
pub(crate) struct MeetingContext {
    pub(crate) meeting_id: MeetingId,
    pub(crate) generation: u64,
    pub(crate) registry: RoomRegistryHandle,
    pub(crate) store: Arc<dyn MeetingStore>,
    pub(crate) hub: mpsc::Sender<HubMessage>,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) metrics: Arc<ActorMetrics>,
}

/// The `MeetingActor` implementation.
pub struct MeetingActor {
    meeting_id: MeetingId,
    generation: u64,
    receiver: mpsc::Receiver<MeetingMessage>,
    cancel_token: CancellationToken,
    /// Sessions by connection ID.
    sessions: HashMap<String, SessionEntry>,
    admission: AdmissionController,
    /// Users admitted at least once; they rejoin without waiting.
    admitted: HashSet<UserId>,
    /// Owner on record, resolved on the first HOST-role join.
    owner: Option<UserId>,
    room: Option<RoomHandle>,
    room_events: Option<broadcast::Receiver<RoomEvent>>,
    registry: RoomRegistryHandle,
    store: Arc<dyn MeetingStore>,
    hub: mpsc::Sender<HubMessage>,
    idle_reported: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl MeetingActor {
    /// Spawn a meeting actor.
    pub(crate) fn spawn(context: MeetingContext) -> (MeetingActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MEETING_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Meeting,
            context.meeting_id.as_str(),
        ));

        let handle = MeetingActorHandle {
            meeting_id: context.meeting_id.clone(),
            generation: context.generation,
            sender,
            cancel_token: context.cancel_token.clone(),
            mailbox: Arc::clone(&mailbox),
        };

        context.metrics.meeting_created();
        let actor = Self {
            meeting_id: context.meeting_id,
            generation: context.generation,
            receiver,
            cancel_token: context.cancel_token,
            sessions: HashMap::new(),
            admission: AdmissionController::new(),
            admitted: HashSet::new(),
            owner: None,
            room: None,
            room_events: None,
            registry: context.registry,
            store: context.store,
            hub: context.hub,
            idle_reported: false,
            metrics: context.metrics,
            mailbox,
        };

        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "signaling.actor.meeting", fields(meeting_id = %self.meeting_id))]
    async fn run(mut self) {
        info!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            generation = self.generation,
            "MeetingActor started"
        );

        loop {
            let room_gone = self.room.as_ref().map(RoomHandle::terminated);

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "signaling.meeting",
                        meeting_id = %self.meeting_id,
                        "MeetingActor received cancellation signal"
                    );
                    break;
                }

                () = cancelled_or_pending(room_gone.as_ref()) => {
                    self.on_room_terminated();
                    self.check_idle().await;
                }

                event = next_room_event(&mut self.room_events) => {
                    match event {
                        Ok(event) => self.handle_room_event(event),
                        Err(RecvError::Lagged(missed)) => warn!(
                            target: "signaling.meeting",
                            meeting_id = %self.meeting_id,
                            missed,
                            "Room events lagged"
                        ),
                        Err(RecvError::Closed) => self.room_events = None,
                    }
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

        self.metrics.meeting_removed();
        info!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            generation = self.generation,
            messages_processed = self.mailbox.messages_processed(),
            "MeetingActor stopped"
        );
    }

    /// Returns `true` when the actor should stop.
    async fn handle_message(&mut self, message: MeetingMessage) -> bool {
        match message {
            MeetingMessage::Join {
                request,
                respond_to,
            } => {
                let result = self.handle_join(request).await;
                let _ = respond_to.send(result);
            }

            MeetingMessage::Disconnect {
                connection_id,
                respond_to,
            } => {
                self.handle_disconnect(&connection_id).await;
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(());
                }
            }

            MeetingMessage::Admit {
                requester,
                target,
                respond_to,
            } => {
                let result = self.handle_admit(&requester, &target).await;
                let _ = respond_to.send(result);
            }

            MeetingMessage::Deny {
                requester,
                target,
                respond_to,
            } => {
                let result = self.handle_deny(&requester, &target).await;
                let _ = respond_to.send(result);
            }

            MeetingMessage::Kick {
                requester,
                target,
                respond_to,
            } => {
                let result = self.handle_kick(&requester, &target).await;
                let _ = respond_to.send(result);
            }

            MeetingMessage::RaiseHand {
                connection_id,
                raised,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_raise_hand(&connection_id, raised));
            }

            MeetingMessage::Chat {
                connection_id,
                text,
                respond_to,
            } => {
                let result = self.handle_chat(&connection_id, &text).await;
                let _ = respond_to.send(result);
            }

            MeetingMessage::Quality { scores } => {
                for (peer_id, score) in scores {
                    self.broadcast(&ServerMessage::NetworkQuality { peer_id, score }, |_, _| true);
                }
            }

            MeetingMessage::RetireIfIdle { respond_to } => {
                let idle = self.sessions.is_empty() && self.admission.is_empty();
                let _ = respond_to.send(idle);
                if idle {
                    debug!(
                        target: "signaling.meeting",
                        meeting_id = %self.meeting_id,
                        "Retiring idle meeting"
                    );
                    return true;
                }
            }

            MeetingMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }

        false
    }

    async fn handle_join(&mut self, request: JoinRequest) -> Result<JoinOutcome, SignalingError> {
        if self.sessions.contains_key(&request.connection_id) {
            return Err(SignalingError::AlreadyJoined);
        }
        self.idle_reported = false;

        let JoinRequest {
            connection_id,
            user_id,
            role,
            display_name,
            notices,
        } = request;

        let host = self.owns_meeting(&user_id, &role).await?;
        if role.is_host() && !host {
            warn!(
                target: "signaling.meeting",
                meeting_id = %self.meeting_id,
                user_id = %user_id,
                "HOST role declared by a user who does not own the meeting"
            );
        }
        let direct = host || !self.host_joined() || self.admitted.contains(&user_id);

        if !direct {
            self.sessions.insert(
                connection_id.clone(),
                SessionEntry {
                    user_id: user_id.clone(),
                    role,
                    host,
                    phase: SessionPhase::Waiting,
                    display_name: display_name.clone(),
                    notices,
                },
            );
            let queued = self.admission.enqueue(WaitingEntry::new(
                user_id.clone(),
                display_name.clone(),
                connection_id.clone(),
            ));
            if queued {
                metrics::record_admission("queued");
                self.notify_hosts(&ServerMessage::ParticipantWaiting {
                    user_id: user_id.clone(),
                    name: display_name,
                    connection_id,
                });
            }
            info!(
                target: "signaling.meeting",
                meeting_id = %self.meeting_id,
                user_id = %user_id,
                announced = queued,
                "Participant waiting for admission"
            );
            return Ok(JoinOutcome::Waiting);
        }

        let (info, newly_added) = self.enter_room(&user_id, &role).await?;
        self.sessions.insert(
            connection_id.clone(),
            SessionEntry {
                user_id: user_id.clone(),
                role,
                host,
                phase: SessionPhase::Joined,
                display_name,
                notices,
            },
        );
        self.admitted.insert(user_id.clone());
        metrics::record_admission("direct");
        if newly_added {
            self.announce_peer(&connection_id);
        }

        info!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            user_id = %user_id,
            host,
            participant_count = info.participant_count,
            "Participant joined"
        );

        if host {
            self.admit_all_waiting().await;
        }
        Ok(JoinOutcome::Joined(info))
    }

    /// Host arrival: admit every waiting entry, in queue order.
    async fn admit_all_waiting(&mut self) {
        let waiting = self.admission.drain();
        if waiting.is_empty() {
            return;
        }
        info!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            count = waiting.len(),
            "Host arrived, admitting waiting participants"
        );
        for entry in waiting {
            let user_id = entry.user_id.clone();
            if let Err(e) = self.admit_entry(entry, "host_arrival").await {
                warn!(
                    target: "signaling.meeting",
                    meeting_id = %self.meeting_id,
                    user_id = %user_id,
                    error = %e,
                    "Bulk admission failed for participant"
                );
            }
        }
    }

    async fn handle_admit(&mut self, requester: &UserId, target: &UserId) -> Result<(), SignalingError> {
        self.require_host(requester)?;
        let entry = self
            .admission
            .remove(target)
            .ok_or_else(|| SignalingError::ParticipantNotFound(target.to_string()))?;
        self.admit_entry(entry, "explicit").await
    }

    /// Move every waiting session of the entry's user into the room. On a
    /// room error the entry is queued again so the host can retry.
    async fn admit_entry(&mut self, entry: WaitingEntry, mode: &'static str) -> Result<(), SignalingError> {
        let waiting: Vec<String> = entry
            .connection_ids
            .iter()
            .filter(|conn| {
                self.sessions
                    .get(conn.as_str())
                    .is_some_and(|s| s.phase == SessionPhase::Waiting)
            })
            .cloned()
            .collect();
        let Some(role) = waiting
            .first()
            .and_then(|conn| self.sessions.get(conn))
            .map(|s| s.role.clone())
        else {
            return Err(SignalingError::ParticipantNotFound(entry.user_id.to_string()));
        };

        let (info, newly_added) = match self.enter_room(&entry.user_id, &role).await {
            Ok(joined) => joined,
            Err(e) => {
                self.admission.enqueue(WaitingEntry {
                    user_id: entry.user_id.clone(),
                    display_name: entry.display_name.clone(),
                    connection_ids: waiting,
                });
                return Err(e);
            }
        };

        for connection_id in &waiting {
            if let Some(session) = self.sessions.get_mut(connection_id) {
                session.phase = SessionPhase::Joined;
                session.notify(SessionNotice::Admitted(info.clone()));
            }
        }
        self.admitted.insert(entry.user_id.clone());
        metrics::record_admission(mode);
        if newly_added {
            if let Some(first) = waiting.first() {
                self.announce_peer(first);
            }
        }

        info!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            user_id = %entry.user_id,
            connections = waiting.len(),
            mode,
            "Participant admitted"
        );
        Ok(())
    }

    async fn handle_deny(&mut self, requester: &UserId, target: &UserId) -> Result<(), SignalingError> {
        self.require_host(requester)?;
        self.admission
            .remove(target)
            .ok_or_else(|| SignalingError::ParticipantNotFound(target.to_string()))?;

        let denied = self.connections_of(target, |s| s.phase == SessionPhase::Waiting);
        for connection_id in denied {
            if let Some(session) = self.sessions.remove(&connection_id) {
                session.notify(SessionNotice::Kicked {
                    meeting_id: self.meeting_id.clone(),
                });
            }
        }
        metrics::record_admission("denied");
        info!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            user_id = %target,
            "Participant denied"
        );
        self.check_idle().await;
        Ok(())
    }

    async fn handle_kick(&mut self, requester: &UserId, target: &UserId) -> Result<(), SignalingError> {
        self.require_host(requester)?;

        let was_waiting = self.admission.remove(target).is_some();
        let connections = self.connections_of(target, |_| true);
        if connections.is_empty() && !was_waiting {
            return Err(SignalingError::ParticipantNotFound(target.to_string()));
        }

        let mut was_joined = false;
        for connection_id in connections {
            if let Some(session) = self.sessions.remove(&connection_id) {
                was_joined |= session.is_joined();
                session.notify(SessionNotice::Kicked {
                    meeting_id: self.meeting_id.clone(),
                });
            }
        }
        self.admitted.remove(target);

        // Room state is fixed server-side whether or not the client disconnects.
        if was_joined {
            self.leave_room(target).await;
        }

        info!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            user_id = %target,
            requester = %requester,
            "Participant kicked"
        );
        self.check_idle().await;
        Ok(())
    }

    async fn handle_disconnect(&mut self, connection_id: &str) {
        let Some(session) = self.sessions.remove(connection_id) else {
            return;
        };

        match session.phase {
            SessionPhase::Waiting => {
                if self.admission.remove_connection(connection_id).is_some() {
                    debug!(
                        target: "signaling.meeting",
                        meeting_id = %self.meeting_id,
                        user_id = %session.user_id,
                        "Waiting participant left"
                    );
                }
            }
            SessionPhase::Joined => {
                let other_session = self
                    .sessions
                    .values()
                    .any(|s| s.user_id == session.user_id && s.is_joined());
                if !other_session {
                    self.leave_room(&session.user_id).await;
                }
            }
        }

        self.check_idle().await;
    }

    fn handle_raise_hand(&self, connection_id: &str, raised: bool) -> Result<(), SignalingError> {
        let user_id = self.joined_user(connection_id)?;
        self.broadcast(
            &ServerMessage::HandRaised {
                peer_id: user_id.clone(),
                raised,
            },
            |conn, _| conn != connection_id,
        );
        Ok(())
    }

    async fn handle_chat(&mut self, connection_id: &str, text: &str) -> Result<ChatRecord, SignalingError> {
        let sender_id = self.joined_user(connection_id)?.clone();
        let text = text.trim();
        if text.is_empty() {
            return Err(SignalingError::InvalidMessage("empty chat message".to_string()));
        }

        let start = Instant::now();
        let result = self
            .store
            .save_chat_message(&self.meeting_id, &sender_id, text)
            .await;
        metrics::record_store_latency("save_chat_message", start.elapsed());

        match result {
            Ok(record) => {
                self.broadcast(&ServerMessage::ChatMessage(record.clone()), |_, _| true);
                Ok(record)
            }
            Err(e) => {
                metrics::record_chat_persist_failure();
                warn!(
                    target: "signaling.meeting",
                    meeting_id = %self.meeting_id,
                    user_id = %sender_id,
                    error = %e,
                    "Chat message not persisted, dropped"
                );
                Err(e.into())
            }
        }
    }

    fn handle_room_event(&self, event: RoomEvent) {
        match event {
            RoomEvent::ProducerAdded(summary) => {
                let owner = summary.peer_id.clone();
                self.broadcast(&ServerMessage::NewProducer(summary), |_, s| s.user_id != owner);
            }
            RoomEvent::ProducersClosed {
                owner,
                producer_ids,
            } => {
                for producer_id in producer_ids {
                    self.broadcast(
                        &ServerMessage::ProducerClosed {
                            producer_id,
                            peer_id: owner.clone(),
                        },
                        |_, s| s.user_id != owner,
                    );
                }
            }
        }
    }

    /// Add `user_id` to the meeting's room, creating the room if needed.
    ///
    /// Returns the join payload and whether the participant is new to the
    /// room. A room found terminated is failed over once.
    async fn enter_room(
        &mut self,
        user_id: &UserId,
        role: &ParticipantRole,
    ) -> Result<(JoinedInfo, bool), SignalingError> {
        let mut retried = false;
        loop {
            let room = self.ensure_room().await?;
            match join_room(&room, user_id, role).await {
                Err(SignalingError::RoomTerminated(reason)) if !retried => {
                    warn!(
                        target: "signaling.meeting",
                        meeting_id = %self.meeting_id,
                        reason = %reason,
                        "Room terminated during join, retrying on a new room"
                    );
                    retried = true;
                    self.on_room_terminated();
                }
                result => return result,
            }
        }
    }

    async fn ensure_room(&mut self) -> Result<RoomHandle, SignalingError> {
        if let Some(room) = self.room.as_ref().filter(|r| !r.is_terminated()) {
            return Ok(room.clone());
        }
        if self.room.is_some() {
            self.on_room_terminated();
        }

        let room = self
            .registry
            .get_or_create_room(self.meeting_id.clone())
            .await?;
        self.room_events = Some(room.subscribe());
        self.room = Some(room.clone());
        Ok(room)
    }

    /// Remove `user_id` from the room, tell the others, close an empty room.
    async fn leave_room(&mut self, user_id: &UserId) {
        if let Some(room) = self.room.clone() {
            if let Err(e) = room.remove_participant(user_id.clone()).await {
                debug!(
                    target: "signaling.meeting",
                    meeting_id = %self.meeting_id,
                    user_id = %user_id,
                    error = %e,
                    "Room gone while removing participant"
                );
            }
        }

        self.broadcast(
            &ServerMessage::PeerLeft {
                peer_id: user_id.clone(),
            },
            |_, s| &s.user_id != user_id,
        );
        info!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            user_id = %user_id,
            "Participant left"
        );

        self.release_room_if_empty().await;
    }

    async fn release_room_if_empty(&mut self) {
        if self.sessions.values().any(SessionEntry::is_joined) {
            return;
        }
        let Some(room) = self.room.take() else {
            return;
        };
        self.room_events = None;

        match self.registry.remove_if_empty(self.meeting_id.clone()).await {
            Ok(true) => debug!(
                target: "signaling.meeting",
                meeting_id = %self.meeting_id,
                room_id = room.room_id(),
                "Empty room removed"
            ),
            Ok(false) => {
                // Still has participants; keep following it.
                self.room_events = Some(room.subscribe());
                self.room = Some(room);
            }
            Err(e) => warn!(
                target: "signaling.meeting",
                meeting_id = %self.meeting_id,
                error = %e,
                "Could not remove empty room"
            ),
        }
    }

    /// The room stopped without the meeting closing it.
    fn on_room_terminated(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        self.room_events = None;

        let reason = room
            .failure_reason()
            .unwrap_or_else(|| "room closed".to_string());
        let joined: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_joined())
            .map(|(conn, _)| conn.clone())
            .collect();

        warn!(
            target: "signaling.meeting",
            meeting_id = %self.meeting_id,
            room_id = room.room_id(),
            reason = %reason,
            sessions = joined.len(),
            "Room terminated, sessions must rejoin"
        );

        for connection_id in joined {
            if let Some(session) = self.sessions.remove(&connection_id) {
                session.notify(SessionNotice::RoomFailed {
                    meeting_id: self.meeting_id.clone(),
                    reason: reason.clone(),
                });
            }
        }
    }

    /// Tell the hub once the meeting has nobody left.
    async fn check_idle(&mut self) {
        if self.idle_reported || !self.sessions.is_empty() || !self.admission.is_empty() {
            return;
        }
        self.idle_reported = true;
        let _ = self
            .hub
            .send(HubMessage::MeetingIdle {
                meeting_id: self.meeting_id.clone(),
                generation: self.generation,
            })
            .await;
    }

    /// Whether `user_id` owns the meeting. Only a HOST-role join may claim
    /// a meeting that has no owner on record.
    async fn owns_meeting(&mut self, user_id: &UserId, role: &ParticipantRole) -> Result<bool, SignalingError> {
        if !role.is_host() {
            return Ok(false);
        }
        if self.owner.is_none() {
            let start = Instant::now();
            let owner = match self.store.meeting_host(&self.meeting_id).await? {
                Some(owner) => owner,
                None => {
                    self.store
                        .claim_meeting_host(&self.meeting_id, user_id)
                        .await?
                }
            };
            metrics::record_store_latency("meeting_host", start.elapsed());
            debug!(
                target: "signaling.meeting",
                meeting_id = %self.meeting_id,
                owner = %owner,
                "Meeting owner resolved"
            );
            self.owner = Some(owner);
        }
        Ok(self.owner.as_ref() == Some(user_id))
    }

    fn require_host(&self, requester: &UserId) -> Result<(), SignalingError> {
        let is_host = self
            .sessions
            .values()
            .any(|s| &s.user_id == requester && s.is_joined() && s.host);
        if is_host {
            Ok(())
        } else {
            Err(SignalingError::PermissionDenied(
                "only the meeting host can do this".to_string(),
            ))
        }
    }

    fn host_joined(&self) -> bool {
        self.sessions.values().any(|s| s.is_joined() && s.host)
    }

    fn joined_user(&self, connection_id: &str) -> Result<&UserId, SignalingError> {
        self.sessions
            .get(connection_id)
            .filter(|s| s.is_joined())
            .map(|s| &s.user_id)
            .ok_or(SignalingError::NotJoined)
    }

    fn connections_of(&self, user_id: &UserId, filter: impl Fn(&SessionEntry) -> bool) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, s)| &s.user_id == user_id && filter(s))
            .map(|(conn, _)| conn.clone())
            .collect()
    }

    /// Send `message` to every joined session accepted by `include`.
    fn broadcast(&self, message: &ServerMessage, include: impl Fn(&str, &SessionEntry) -> bool) {
        for (connection_id, session) in &self.sessions {
            if session.is_joined() && include(connection_id, session) {
                session.deliver(message.clone());
            }
        }
    }

    fn notify_hosts(&self, message: &ServerMessage) {
        self.broadcast(message, |_, s| s.host);
    }

    /// Tell everyone else a new peer is in the room.
    fn announce_peer(&self, connection_id: &str) {
        let Some(session) = self.sessions.get(connection_id) else {
            return;
        };
        let peer_id = session.user_id.clone();
        self.broadcast(
            &ServerMessage::NewPeer {
                peer_id: peer_id.clone(),
                connection_id: connection_id.to_string(),
                role: session.role.clone(),
            },
            |_, s| s.user_id != peer_id,
        );
    }

    fn state(&self) -> MeetingState {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|(connection_id, s)| SessionSnapshot {
                connection_id: connection_id.clone(),
                user_id: s.user_id.clone(),
                role: s.role.clone(),
                phase: s.phase,
                display_name: s.display_name.clone(),
            })
            .collect();
        sessions.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));

        MeetingState {
            meeting_id: self.meeting_id.clone(),
            sessions,
            waiting: self.admission.waiting_users(),
            room_id: self.room.as_ref().map(RoomHandle::room_id),
        }
    }
}

async fn join_room(
    room: &RoomHandle,
    user_id: &UserId,
    role: &ParticipantRole,
) -> Result<(JoinedInfo, bool), SignalingError> {
    let newly_added = room.add_participant(user_id.clone(), role.clone()).await?;
    let existing_producers = room.existing_producers(Some(user_id.clone())).await?;
    let participant_count = room.participant_count().await?;
    Ok((
        JoinedInfo {
            room: room.clone(),
            rtp_capabilities: room.rtp_capabilities(),
            existing_producers,
            participant_count,
        },
        newly_added,
    ))
}

async fn cancelled_or_pending(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn next_room_event(
    events: &mut Option<broadcast::Receiver<RoomEvent>>,
) -> Result<RoomEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
