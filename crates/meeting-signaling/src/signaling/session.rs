//! One client connection's signaling state machine.
//!
//! ```text
//! Connected ──join-room──▶ Waiting ──admitted──▶ Joined
//!     ▲    └──────────join-room (direct)──────────▶ │
//!     └──── leave-room / room-failed ◀──────────────┘
//!                 kicked / denied ──▶ Left
//! ```
//!
//! The session is transport agnostic: it reads text frames from any
//! `Stream<Item = String>` and writes [`ServerEnvelope`]s to an mpsc sender.
//! Requests are handled one at a time, in arrival order; server-initiated
//! notices queue up meanwhile and are forwarded after the current reply.
//!
//! Ending the inbound stream is a disconnect and always reaches the meeting,
//! whatever state the session was in.

use crate::actors::{
    ActorMetrics, JoinOutcome, JoinRequest, JoinedInfo, MeetingActorHandle, RoomHandle,
    SessionNotice, SignalingHubHandle,
};
use crate::errors::SignalingError;
use crate::observability::metrics;
use crate::persistence::{resolve_display_name, MeetingStore};

use super::protocol::{ClientEnvelope, ClientMessage, IceServer, ServerEnvelope, ServerMessage};

use common::types::{MeetingId, ParticipantRole, UserId};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Everything a session needs from the node, shared by all connections.
#[derive(Clone)]
pub struct SignalingContext {
    pub hub: SignalingHubHandle,
    pub store: Arc<dyn MeetingStore>,
    pub ice_servers: Arc<[IceServer]>,
    pub metrics: Arc<ActorMetrics>,
    /// Cancelled on node shutdown; every session ends.
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for SignalingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingContext")
            .field("hub", &self.hub)
            .field("ice_servers", &self.ice_servers.len())
            .finish_non_exhaustive()
    }
}

enum SessionState {
    Connected,
    Waiting {
        meeting: MeetingActorHandle,
        user_id: UserId,
        role: ParticipantRole,
    },
    Joined {
        meeting: MeetingActorHandle,
        room: RoomHandle,
        user_id: UserId,
    },
    /// Kicked or denied. Only disconnecting is left to do.
    Left,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Waiting { .. } => "waiting",
            SessionState::Joined { .. } => "joined",
            SessionState::Left => "left",
        }
    }

    fn meeting_id(&self) -> Option<&MeetingId> {
        match self {
            SessionState::Waiting { meeting, .. } | SessionState::Joined { meeting, .. } => {
                Some(meeting.meeting_id())
            }
            SessionState::Connected | SessionState::Left => None,
        }
    }
}

/// Participant record updates, applied in order off the signaling path.
enum PersistOp {
    Join(MeetingId, UserId, ParticipantRole),
    Leave(MeetingId, UserId),
}

/// Signaling state for one client connection.
pub struct SignalingSession {
    connection_id: String,
    context: SignalingContext,
    state: SessionState,
    outbound: mpsc::Sender<ServerEnvelope>,
    notices_tx: mpsc::UnboundedSender<SessionNotice>,
    notices_rx: mpsc::UnboundedReceiver<SessionNotice>,
    persist: Option<JoinHandle<()>>,
}

impl SignalingSession {
    #[must_use]
    pub fn new(
        connection_id: String,
        context: SignalingContext,
        outbound: mpsc::Sender<ServerEnvelope>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        Self {
            connection_id,
            context,
            state: SessionState::Connected,
            outbound,
            notices_tx,
            notices_rx,
            persist: None,
        }
    }

    /// Drive the session until the inbound stream ends, the outbound side
    /// closes or the node shuts down.
    #[instrument(skip_all, name = "signaling.session", fields(connection_id = %self.connection_id))]
    pub async fn run<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = String> + Unpin + Send,
    {
        self.context.metrics.session_opened();
        debug!(
            target: "signaling.session",
            connection_id = %self.connection_id,
            "Session started"
        );

        loop {
            tokio::select! {
                () = self.context.shutdown.cancelled() => break,

                frame = inbound.next() => match frame {
                    Some(text) => self.handle_frame(&text).await,
                    None => break,
                },

                Some(notice) = self.notices_rx.recv() => self.handle_notice(notice).await,
            }

            if self.outbound.is_closed() {
                break;
            }
        }

        let final_state = self.state.name();
        self.leave().await;
        self.context.metrics.session_closed();
        debug!(
            target: "signaling.session",
            connection_id = %self.connection_id,
            final_state,
            "Session ended"
        );
    }

    async fn handle_frame(&mut self, text: &str) {
        let start = Instant::now();

        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(
                    target: "signaling.session",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Unparseable frame"
                );
                let request_id = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("request_id").and_then(Value::as_u64));
                let error = SignalingError::InvalidMessage(e.to_string());
                self.send(ServerEnvelope::reply(request_id, error_reply(&error)))
                    .await;
                return;
            }
        };

        let label = envelope.message.label();
        let reply = match self.dispatch(envelope.message).await {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(
                    e,
                    SignalingError::Media(_) | SignalingError::Store(_) | SignalingError::Internal(_)
                ) {
                    warn!(
                        target: "signaling.session",
                        connection_id = %self.connection_id,
                        message_type = label,
                        error = %e,
                        "Request failed"
                    );
                } else {
                    debug!(
                        target: "signaling.session",
                        connection_id = %self.connection_id,
                        message_type = label,
                        error = %e,
                        "Request rejected"
                    );
                }
                error_reply(&e)
            }
        };

        self.send(ServerEnvelope::reply(envelope.request_id, reply))
            .await;
        metrics::record_message_latency(label, start.elapsed());
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<ServerMessage, SignalingError> {
        match message {
            ClientMessage::JoinRoom {
                meeting_id,
                user_id,
                role,
            } => self.join(meeting_id, user_id, role).await,

            ClientMessage::LeaveRoom => {
                self.leave().await;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::CreateTransport { direction } => {
                let (room, user_id) = self.room()?;
                let transport = room.create_transport(user_id, direction).await?;
                Ok(ServerMessage::TransportCreated {
                    direction,
                    transport,
                })
            }

            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let (room, user_id) = self.room()?;
                room.connect_transport(user_id, transport_id.clone(), dtls_parameters)
                    .await?;
                Ok(ServerMessage::TransportConnected { transport_id })
            }

            ClientMessage::Produce {
                kind,
                rtp_parameters,
                app_data,
            } => {
                let (room, user_id) = self.room()?;
                let summary = room.produce(user_id, kind, rtp_parameters, app_data).await?;
                Ok(ServerMessage::Produced {
                    producer_id: summary.producer_id,
                })
            }

            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let (room, user_id) = self.room()?;
                let consumer = room.consume(user_id, producer_id, rtp_capabilities).await?;
                Ok(ServerMessage::Consumed { consumer })
            }

            ClientMessage::ResumeConsumer { consumer_id } => {
                let (room, user_id) = self.room()?;
                room.resume_consumer(user_id, consumer_id).await?;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::PauseProducer { producer_id } => {
                let (room, user_id) = self.room()?;
                room.pause_producer(user_id, producer_id).await?;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::ResumeProducer { producer_id } => {
                let (room, user_id) = self.room()?;
                room.resume_producer(user_id, producer_id).await?;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::CloseProducer { producer_id } => {
                let (room, user_id) = self.room()?;
                room.close_producer(user_id, producer_id).await?;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::RaiseHand { raised } => {
                let (meeting, _) = self.meeting()?;
                meeting.raise_hand(self.connection_id.clone(), raised).await?;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::ChatMessage { text } => {
                let (meeting, _) = self.meeting()?;
                meeting.chat(self.connection_id.clone(), text).await?;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::Admit { user_id } => {
                let (meeting, requester) = self.meeting()?;
                meeting.admit(requester, user_id).await?;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::Deny { user_id } => {
                let (meeting, requester) = self.meeting()?;
                meeting.deny(requester, user_id).await?;
                Ok(ServerMessage::Ack)
            }

            ClientMessage::Kick { user_id } => {
                let (meeting, requester) = self.meeting()?;
                meeting.kick(requester, user_id).await?;
                Ok(ServerMessage::Ack)
            }
        }
    }

    async fn join(
        &mut self,
        meeting_id: MeetingId,
        user_id: UserId,
        role: ParticipantRole,
    ) -> Result<ServerMessage, SignalingError> {
        match self.state {
            SessionState::Connected => {}
            SessionState::Left => {
                return Err(SignalingError::PermissionDenied(
                    "removed from the meeting".to_string(),
                ))
            }
            SessionState::Waiting { .. } | SessionState::Joined { .. } => {
                return Err(SignalingError::AlreadyJoined)
            }
        }

        let display_name = resolve_display_name(self.context.store.as_ref(), &user_id).await;

        let mut meeting = self
            .context
            .hub
            .get_or_create_meeting(meeting_id.clone())
            .await?;
        let outcome = match meeting.join(self.join_request(&user_id, &role, &display_name)).await {
            // The meeting actor retired between lookup and join.
            Err(SignalingError::MeetingNotFound(_)) => {
                meeting = self
                    .context
                    .hub
                    .get_or_create_meeting(meeting_id.clone())
                    .await?;
                meeting
                    .join(self.join_request(&user_id, &role, &display_name))
                    .await?
            }
            other => other?,
        };

        match outcome {
            JoinOutcome::Joined(info) => {
                info!(
                    target: "signaling.session",
                    connection_id = %self.connection_id,
                    meeting_id = %meeting_id,
                    user_id = %user_id,
                    "Joined room"
                );
                self.persist(PersistOp::Join(meeting_id.clone(), user_id.clone(), role));
                let reply = self.room_joined(&meeting_id, &info);
                self.state = SessionState::Joined {
                    meeting,
                    room: info.room,
                    user_id,
                };
                Ok(reply)
            }
            JoinOutcome::Waiting => {
                info!(
                    target: "signaling.session",
                    connection_id = %self.connection_id,
                    meeting_id = %meeting_id,
                    user_id = %user_id,
                    "Waiting for admission"
                );
                self.state = SessionState::Waiting {
                    meeting,
                    user_id,
                    role,
                };
                Ok(ServerMessage::WaitingRoom { meeting_id })
            }
        }
    }

    fn join_request(&self, user_id: &UserId, role: &ParticipantRole, display_name: &str) -> JoinRequest {
        JoinRequest {
            connection_id: self.connection_id.clone(),
            user_id: user_id.clone(),
            role: role.clone(),
            display_name: display_name.to_string(),
            notices: self.notices_tx.clone(),
        }
    }

    /// Leave whatever meeting the session is in. Waits until the meeting
    /// has applied it.
    async fn leave(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Connected) {
            SessionState::Waiting { meeting, .. } => {
                meeting.disconnect(self.connection_id.clone()).await;
            }
            SessionState::Joined {
                meeting, user_id, ..
            } => {
                meeting.disconnect(self.connection_id.clone()).await;
                self.persist(PersistOp::Leave(meeting.meeting_id().clone(), user_id));
            }
            SessionState::Left => self.state = SessionState::Left,
            SessionState::Connected => {}
        }
    }

    async fn handle_notice(&mut self, notice: SessionNotice) {
        match notice {
            SessionNotice::Deliver(message) => {
                self.send(ServerEnvelope::event(message)).await;
            }

            SessionNotice::Admitted(info) => {
                let state = std::mem::replace(&mut self.state, SessionState::Connected);
                match state {
                    SessionState::Waiting {
                        meeting,
                        user_id,
                        role,
                    } if meeting.meeting_id() == info.room.meeting_id() => {
                        let meeting_id = meeting.meeting_id().clone();
                        info!(
                            target: "signaling.session",
                            connection_id = %self.connection_id,
                            meeting_id = %meeting_id,
                            user_id = %user_id,
                            "Admitted to room"
                        );
                        self.persist(PersistOp::Join(meeting_id.clone(), user_id.clone(), role));
                        let message = self.room_joined(&meeting_id, &info);
                        self.state = SessionState::Joined {
                            meeting,
                            room: info.room,
                            user_id,
                        };
                        self.send(ServerEnvelope::event(message)).await;
                    }
                    other => {
                        debug!(
                            target: "signaling.session",
                            connection_id = %self.connection_id,
                            state = other.name(),
                            "Stale admission ignored"
                        );
                        self.state = other;
                    }
                }
            }

            SessionNotice::Kicked { meeting_id } => {
                if self.state.meeting_id() != Some(&meeting_id) {
                    return;
                }
                if let SessionState::Joined { user_id, .. } = &self.state {
                    let user_id = user_id.clone();
                    self.persist(PersistOp::Leave(meeting_id.clone(), user_id));
                }
                info!(
                    target: "signaling.session",
                    connection_id = %self.connection_id,
                    meeting_id = %meeting_id,
                    "Removed from meeting"
                );
                self.state = SessionState::Left;
                self.send(ServerEnvelope::event(ServerMessage::Kicked { meeting_id }))
                    .await;
            }

            SessionNotice::RoomFailed { meeting_id, reason } => {
                let SessionState::Joined { user_id, .. } = &self.state else {
                    return;
                };
                let user_id = user_id.clone();
                if self.state.meeting_id() != Some(&meeting_id) {
                    return;
                }
                self.persist(PersistOp::Leave(meeting_id.clone(), user_id));
                self.state = SessionState::Connected;
                self.send(ServerEnvelope::event(ServerMessage::RoomFailed {
                    meeting_id,
                    reason,
                }))
                .await;
            }
        }
    }

    fn room_joined(&self, meeting_id: &MeetingId, info: &JoinedInfo) -> ServerMessage {
        ServerMessage::RoomJoined {
            meeting_id: meeting_id.clone(),
            rtp_capabilities: info.rtp_capabilities.clone(),
            ice_servers: self.context.ice_servers.to_vec(),
            existing_producers: info.existing_producers.clone(),
            participant_count: info.participant_count,
        }
    }

    fn room(&self) -> Result<(RoomHandle, UserId), SignalingError> {
        match &self.state {
            SessionState::Joined { room, user_id, .. } => Ok((room.clone(), user_id.clone())),
            _ => Err(SignalingError::NotJoined),
        }
    }

    fn meeting(&self) -> Result<(MeetingActorHandle, UserId), SignalingError> {
        match &self.state {
            SessionState::Joined {
                meeting, user_id, ..
            } => Ok((meeting.clone(), user_id.clone())),
            _ => Err(SignalingError::NotJoined),
        }
    }

    async fn send(&self, envelope: ServerEnvelope) {
        if self.outbound.send(envelope).await.is_err() {
            debug!(
                target: "signaling.session",
                connection_id = %self.connection_id,
                "Outbound closed"
            );
        }
    }

    /// Queue a participant record update behind the previous one.
    fn persist(&mut self, op: PersistOp) {
        let previous = self.persist.take();
        let store = Arc::clone(&self.context.store);
        self.persist = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let start = Instant::now();
            let (operation, result) = match &op {
                PersistOp::Join(meeting_id, user_id, role) => (
                    "record_join",
                    store.record_join(meeting_id, user_id, role).await,
                ),
                PersistOp::Leave(meeting_id, user_id) => (
                    "record_leave",
                    store.record_leave(meeting_id, user_id).await,
                ),
            };
            metrics::record_store_latency(operation, start.elapsed());
            if let Err(e) = result {
                warn!(
                    target: "signaling.session",
                    operation,
                    error = %e,
                    "Participant record not updated"
                );
            }
        }));
    }
}

fn error_reply(error: &SignalingError) -> ServerMessage {
    ServerMessage::Error {
        code: error.error_code(),
        message: error.client_message(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::media::{InMemoryMediaEngine, MediaEngine};
    use crate::persistence::InMemoryStore;
    use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
    use crate::actors::RoomRegistryHandle;
    use futures::channel::mpsc as stream_mpsc;
    use std::time::Duration;

    struct Harness {
        frames: stream_mpsc::UnboundedSender<String>,
        replies: mpsc::Receiver<ServerEnvelope>,
        store: Arc<InMemoryStore>,
        task: JoinHandle<()>,
    }

    async fn harness() -> Harness {
        let engine: Arc<dyn MediaEngine> = Arc::new(InMemoryMediaEngine::new());
        let pool = WorkerPool::start(engine, WorkerPoolConfig::default())
            .await
            .unwrap();
        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(pool, Duration::from_secs(30), Arc::clone(&metrics));
        let store = Arc::new(InMemoryStore::new());
        let hub = SignalingHubHandle::new(
            registry,
            Arc::clone(&store) as Arc<dyn MeetingStore>,
            Arc::clone(&metrics),
        );
        let context = SignalingContext {
            hub,
            store: Arc::clone(&store) as Arc<dyn MeetingStore>,
            ice_servers: Arc::from(vec![IceServer {
                urls: vec!["stun:stun.example.org:3478".to_string()],
                username: None,
                credential: None,
            }]),
            metrics,
            shutdown: CancellationToken::new(),
        };

        let (frames, inbound) = stream_mpsc::unbounded();
        let (outbound, replies) = mpsc::channel(64);
        let session = SignalingSession::new("conn-1".to_string(), context, outbound);
        let task = tokio::spawn(session.run(inbound));
        Harness {
            frames,
            replies,
            store,
            task,
        }
    }

    impl Harness {
        async fn request(&mut self, frame: &str) -> ServerEnvelope {
            self.frames.unbounded_send(frame.to_string()).unwrap();
            tokio::time::timeout(Duration::from_secs(1), self.replies.recv())
                .await
                .expect("reply in time")
                .expect("session alive")
        }
    }

    #[tokio::test]
    async fn test_garbage_frame_gets_protocol_error() {
        let mut h = harness().await;
        let reply = h.request(r#"{"type":"warp-drive","request_id":9}"#).await;
        assert_eq!(reply.request_id, Some(9));
        assert!(matches!(reply.message, ServerMessage::Error { code: 1, .. }));

        let reply = h.request("{{{").await;
        assert_eq!(reply.request_id, None);
        assert!(matches!(reply.message, ServerMessage::Error { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_media_requests_require_join() {
        let mut h = harness().await;
        let reply = h
            .request(r#"{"type":"create-transport","request_id":1,"direction":"send"}"#)
            .await;
        assert_eq!(reply.request_id, Some(1));
        match reply.message {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, 1);
                assert_eq!(message, "Session has not joined a meeting");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_then_create_transport() {
        let mut h = harness().await;
        let reply = h
            .request(r#"{"type":"join-room","request_id":1,"meetingId":"m-1","userId":"u-1","role":"candidate"}"#)
            .await;
        match reply.message {
            ServerMessage::RoomJoined {
                ice_servers,
                participant_count,
                ..
            } => {
                assert_eq!(participant_count, 1);
                assert_eq!(ice_servers.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let reply = h
            .request(r#"{"type":"create-transport","request_id":2,"direction":"recv"}"#)
            .await;
        assert_eq!(reply.request_id, Some(2));
        assert!(matches!(reply.message, ServerMessage::TransportCreated { .. }));

        let reply = h
            .request(r#"{"type":"join-room","request_id":3,"meetingId":"m-1","userId":"u-1","role":"candidate"}"#)
            .await;
        assert!(matches!(reply.message, ServerMessage::Error { code: 1, .. }));
    }

    #[tokio::test]
    async fn test_disconnect_records_leave() {
        let mut h = harness().await;
        h.request(r#"{"type":"join-room","meetingId":"m-1","userId":"u-1","role":"host"}"#)
            .await;

        drop(h.frames);
        h.task.await.unwrap();

        for _ in 0..50 {
            let record = h.store.participant(&MeetingId::new("m-1"), &UserId::new("u-1"));
            if record.is_some_and(|p| p.left_at.is_some()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("leave was not recorded");
    }
}
