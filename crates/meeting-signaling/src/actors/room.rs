//! `RoomActor` - one meeting's media-routing state.
//!
//! Each `RoomActor`:
//! - Is bound to exactly one worker's routing context for its whole life
//! - Owns the participant map (transports, producers, consumers)
//! - Serializes every mutation through its mailbox
//! - Never awaits the media engine inside the loop: engine calls run in
//!   spawned tasks and report back as completions, which are re-validated
//!   before being applied (the participant may have left meanwhile)
//!
//! # Failure
//!
//! When the bound worker dies the room fails as a whole: every participant is
//! torn down, the termination token fires with a reason, and all further
//! requests fail with `RoomTerminated`. Rooms are never migrated.

use crate::errors::SignalingError;
use crate::media::{
    ConsumerId, ConsumerInfo, MediaConsumer, MediaError, MediaProducer, MediaTransport,
    MediaWorker, ProducerId, RoutingContext, TransportId, TransportInfo,
};
use crate::observability::metrics;

use super::messages::{
    ProducerSummary, RoomEvent, RoomMessage, RoomState, StatsSample,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::participant::{producer_app_data, ParticipantState, ProducerEntry};

use common::types::{MediaKind, MeetingId, ParticipantRole, TransportDirection, UserId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Capacity of the room event broadcast.
const ROOM_EVENT_CAPACITY: usize = 256;

/// Sent to the registry when a room actor stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoomExit {
    pub(crate) meeting_id: MeetingId,
    pub(crate) room_id: u64,
}

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomHandle {
    meeting_id: MeetingId,
    room_id: u64,
    worker_id: String,
    rtp_capabilities: Arc<Value>,
    sender: mpsc::Sender<RoomMessage>,
    events: broadcast::Sender<RoomEvent>,
    terminated: CancellationToken,
    failure: Arc<OnceLock<String>>,
    mailbox: Arc<MailboxMonitor>,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("meeting_id", &self.meeting_id)
            .field("room_id", &self.room_id)
            .field("worker_id", &self.worker_id)
            .field("terminated", &self.terminated.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RoomHandle {
    #[must_use]
    pub fn meeting_id(&self) -> &MeetingId {
        &self.meeting_id
    }

    /// Distinguishes successive rooms of the same meeting.
    #[must_use]
    pub fn room_id(&self) -> u64 {
        self.room_id
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Router capabilities clients load their device with.
    #[must_use]
    pub fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.as_ref().clone()
    }

    /// Subscribe to producer added/closed events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Token cancelled once the room has stopped (closed or failed).
    #[must_use]
    pub fn terminated(&self) -> CancellationToken {
        self.terminated.clone()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Why the room failed, if it failed rather than closed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        self.failure.get().cloned()
    }

    fn gone(&self) -> SignalingError {
        SignalingError::RoomTerminated(
            self.failure_reason()
                .unwrap_or_else(|| format!("room for meeting {} closed", self.meeting_id)),
        )
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|_| self.gone())?;
        self.mailbox.record_enqueue();
        rx.await.map_err(|_| self.gone())
    }

    /// Add a participant. Returns `true` if newly added, `false` on rejoin.
    pub async fn add_participant(
        &self,
        user_id: UserId,
        role: ParticipantRole,
    ) -> Result<bool, SignalingError> {
        self.request(|respond_to| RoomMessage::AddParticipant {
            user_id,
            role,
            respond_to,
        })
        .await?
    }

    /// Create (or return the existing) transport for one direction.
    pub async fn create_transport(
        &self,
        user_id: UserId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, SignalingError> {
        self.request(|respond_to| RoomMessage::CreateTransport {
            user_id,
            direction,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        user_id: UserId,
        transport_id: TransportId,
        dtls_parameters: Value,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::ConnectTransport {
            user_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await?
    }

    /// Publish a stream on the participant's send transport.
    pub async fn produce(
        &self,
        user_id: UserId,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<ProducerSummary, SignalingError> {
        self.request(|respond_to| RoomMessage::Produce {
            user_id,
            kind,
            rtp_parameters,
            app_data,
            respond_to,
        })
        .await?
    }

    /// Subscribe to a producer. `Ok(None)` when the receiver cannot decode it.
    pub async fn consume(
        &self,
        user_id: UserId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
    ) -> Result<Option<ConsumerInfo>, SignalingError> {
        self.request(|respond_to| RoomMessage::Consume {
            user_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
        .await?
    }

    pub async fn resume_consumer(
        &self,
        user_id: UserId,
        consumer_id: ConsumerId,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::ResumeConsumer {
            user_id,
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn pause_producer(
        &self,
        user_id: UserId,
        producer_id: ProducerId,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::SetProducerPaused {
            user_id,
            producer_id,
            paused: true,
            respond_to,
        })
        .await?
    }

    pub async fn resume_producer(
        &self,
        user_id: UserId,
        producer_id: ProducerId,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::SetProducerPaused {
            user_id,
            producer_id,
            paused: false,
            respond_to,
        })
        .await?
    }

    /// Close a producer and every consumer of it.
    pub async fn close_producer(
        &self,
        user_id: UserId,
        producer_id: ProducerId,
    ) -> Result<(), SignalingError> {
        self.request(|respond_to| RoomMessage::CloseProducer {
            user_id,
            producer_id,
            respond_to,
        })
        .await?
    }

    /// Live producers in creation order, without `excluding`'s own.
    pub async fn existing_producers(
        &self,
        excluding: Option<UserId>,
    ) -> Result<Vec<ProducerSummary>, SignalingError> {
        self.request(|respond_to| RoomMessage::ExistingProducers {
            excluding,
            respond_to,
        })
        .await
    }

    /// Tear down a participant. Returns `true` if it was present.
    pub async fn remove_participant(&self, user_id: UserId) -> Result<bool, SignalingError> {
        self.request(|respond_to| RoomMessage::RemoveParticipant {
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn participant_count(&self) -> Result<usize, SignalingError> {
        self.request(|respond_to| RoomMessage::ParticipantCount { respond_to })
            .await
    }

    /// Close the room if it has no participants and has been idle for
    /// `grace`. Returns `true` if the room is now closed.
    pub async fn close_if_empty(&self, grace: Duration) -> bool {
        if self.is_terminated() {
            return true;
        }
        self.request(|respond_to| RoomMessage::CloseIfEmpty { grace, respond_to })
            .await
            .unwrap_or(true)
    }

    /// One representative producer per participant.
    pub async fn sample_stats(&self) -> Result<Vec<StatsSample>, SignalingError> {
        self.request(|respond_to| RoomMessage::SampleStats { respond_to })
            .await
    }

    pub async fn get_state(&self) -> Result<RoomState, SignalingError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    /// Close every participant and release the routing context.
    pub async fn close(&self) {
        let _ = self
            .request(|respond_to| RoomMessage::Close { respond_to })
            .await;
    }
}


/// Engine call results fed back into the actor.
enum Completion {
    TransportReady {
        user_id: UserId,
        direction: TransportDirection,
        result: Result<Arc<dyn MediaTransport>, MediaError>,
    },
    ProducerReady {
        user_id: UserId,
        transport_id: TransportId,
        kind: MediaKind,
        app_data: Value,
        result: Result<Arc<dyn MediaProducer>, MediaError>,
        respond_to: oneshot::Sender<Result<ProducerSummary, SignalingError>>,
    },
    ConsumerReady {
        user_id: UserId,
        transport_id: TransportId,
        producer_id: ProducerId,
        result: Result<Arc<dyn MediaConsumer>, MediaError>,
        respond_to: oneshot::Sender<Result<Option<ConsumerInfo>, SignalingError>>,
    },
    /// A transport closed on its own (handshake failure, DTLS close).
    TransportClosed {
        user_id: UserId,
        transport_id: TransportId,
    },
}

impl Completion {
    /// Release whatever the engine created when the actor is gone.
    fn discard(self) {
        match self {
            Completion::TransportReady {
                result: Ok(transport),
                ..
            } => transport.close(),
            Completion::ProducerReady {
                result: Ok(producer),
                ..
            } => producer.close(),
            Completion::ConsumerReady {
                result: Ok(consumer),
                ..
            } => consumer.close(),
            _ => {}
        }
    }
}

fn report(completions: &mpsc::UnboundedSender<Completion>, completion: Completion) {
    if let Err(mpsc::error::SendError(completion)) = completions.send(completion) {
        completion.discard();
    }
}

type TransportWaiters = Vec<oneshot::Sender<Result<TransportInfo, SignalingError>>>;

/// Everything a new room is bound to.
pub(crate) struct RoomBinding {
    pub(crate) meeting_id: MeetingId,
    pub(crate) room_id: u64,
    pub(crate) worker: Arc<dyn MediaWorker>,
    pub(crate) router: Arc<dyn RoutingContext>,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) metrics: Arc<ActorMetrics>,
    pub(crate) exits: mpsc::UnboundedSender<RoomExit>,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    meeting_id: MeetingId,
    room_id: u64,
    worker: Arc<dyn MediaWorker>,
    router: Arc<dyn RoutingContext>,
    receiver: mpsc::Receiver<RoomMessage>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    events: broadcast::Sender<RoomEvent>,
    participants: HashMap<UserId, ParticipantState>,
    pending_transports: HashMap<(UserId, TransportDirection), TransportWaiters>,
    next_producer_seq: u64,
    /// Set while the room has no participants.
    empty_since: Option<Instant>,
    /// Shutdown signal from the registry.
    cancel_token: CancellationToken,
    /// Cancelled when this actor stops.
    terminated: CancellationToken,
    failure: Arc<OnceLock<String>>,
    exits: mpsc::UnboundedSender<RoomExit>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActor {
    /// Spawn a room actor bound to `binding.router`.
    pub(crate) fn spawn(binding: RoomBinding) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(ROOM_EVENT_CAPACITY);
        let terminated = CancellationToken::new();
        let failure = Arc::new(OnceLock::new());
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Room,
            binding.meeting_id.as_str(),
        ));

        let handle = RoomHandle {
            meeting_id: binding.meeting_id.clone(),
            room_id: binding.room_id,
            worker_id: binding.worker.id().to_string(),
            rtp_capabilities: Arc::new(binding.router.rtp_capabilities()),
            sender,
            events: events.clone(),
            terminated: terminated.clone(),
            failure: Arc::clone(&failure),
            mailbox: Arc::clone(&mailbox),
        };

        binding.metrics.room_created();
        let actor = Self {
            meeting_id: binding.meeting_id,
            room_id: binding.room_id,
            worker: binding.worker,
            router: binding.router,
            receiver,
            completions_tx,
            completions_rx,
            events,
            participants: HashMap::new(),
            pending_transports: HashMap::new(),
            next_producer_seq: 0,
            empty_since: Some(Instant::now()),
            cancel_token: binding.cancel_token,
            terminated,
            failure,
            exits: binding.exits,
            metrics: binding.metrics,
            mailbox,
        };

        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "signaling.actor.room", fields(meeting_id = %self.meeting_id, room_id = self.room_id))]
    async fn run(mut self) {
        info!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            room_id = self.room_id,
            worker_id = %self.worker.id(),
            "RoomActor started"
        );

        let worker_died = self.worker.died();

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "signaling.room",
                        meeting_id = %self.meeting_id,
                        "RoomActor received cancellation signal"
                    );
                    self.close_all();
                    break;
                }

                () = worker_died.cancelled() => {
                    let reason = format!("media worker {} died", self.worker.id());
                    self.fail(reason);
                    break;
                }

                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion);
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let stop = self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            if stop {
                                break;
                            }
                        }
                        None => {
                            self.close_all();
                            break;
                        }
                    }
                }
            }
        }

        self.terminated.cancel();
        self.metrics.room_closed();
        let _ = self.exits.send(RoomExit {
            meeting_id: self.meeting_id.clone(),
            room_id: self.room_id,
        });

        info!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            room_id = self.room_id,
            failed = self.failure.get().is_some(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message. Returns `true` when the actor should stop.
    fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::AddParticipant {
                user_id,
                role,
                respond_to,
            } => {
                let _ = respond_to.send(Ok(self.add_participant(user_id, role)));
            }

            RoomMessage::CreateTransport {
                user_id,
                direction,
                respond_to,
            } => self.create_transport(user_id, direction, respond_to),

            RoomMessage::ConnectTransport {
                user_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => self.connect_transport(&user_id, &transport_id, dtls_parameters, respond_to),

            RoomMessage::Produce {
                user_id,
                kind,
                rtp_parameters,
                app_data,
                respond_to,
            } => self.produce(user_id, kind, rtp_parameters, app_data, respond_to),

            RoomMessage::Consume {
                user_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => self.consume(user_id, producer_id, rtp_capabilities, respond_to),

            RoomMessage::ResumeConsumer {
                user_id,
                consumer_id,
                respond_to,
            } => self.resume_consumer(&user_id, &consumer_id, respond_to),

            RoomMessage::SetProducerPaused {
                user_id,
                producer_id,
                paused,
                respond_to,
            } => self.set_producer_paused(&user_id, &producer_id, paused, respond_to),

            RoomMessage::CloseProducer {
                user_id,
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.close_producer(&user_id, &producer_id));
            }

            RoomMessage::ExistingProducers {
                excluding,
                respond_to,
            } => {
                let _ = respond_to.send(self.existing_producers(excluding.as_ref()));
            }

            RoomMessage::RemoveParticipant {
                user_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.remove_participant(&user_id));
            }

            RoomMessage::ParticipantCount { respond_to } => {
                let _ = respond_to.send(self.participants.len());
            }

            RoomMessage::CloseIfEmpty { grace, respond_to } => {
                let idle = self
                    .empty_since
                    .is_some_and(|since| since.elapsed() >= grace);
                if self.participants.is_empty() && idle {
                    debug!(
                        target: "signaling.room",
                        meeting_id = %self.meeting_id,
                        room_id = self.room_id,
                        "Closing empty room"
                    );
                    self.close_all();
                    // Callers must observe the room as closed once they see `true`.
                    self.terminated.cancel();
                    let _ = respond_to.send(true);
                    return true;
                }
                let _ = respond_to.send(false);
            }

            RoomMessage::SampleStats { respond_to } => {
                let _ = respond_to.send(self.sample_stats());
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }

            RoomMessage::Close { respond_to } => {
                self.close_all();
                self.terminated.cancel();
                let _ = respond_to.send(());
                return true;
            }
        }

        false
    }

    fn add_participant(&mut self, user_id: UserId, role: ParticipantRole) -> bool {
        self.empty_since = None;

        if let Some(existing) = self.participants.get_mut(&user_id) {
            existing.refresh(role);
            debug!(
                target: "signaling.room",
                meeting_id = %self.meeting_id,
                user_id = %user_id,
                "Participant rejoined, resources kept"
            );
            return false;
        }

        info!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            user_id = %user_id,
            role = %role,
            "Participant added to room"
        );
        self.participants
            .insert(user_id.clone(), ParticipantState::new(user_id, role));
        true
    }

    fn create_transport(
        &mut self,
        user_id: UserId,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportInfo, SignalingError>>,
    ) {
        let Some(participant) = self.participants.get(&user_id) else {
            let _ = respond_to.send(Err(SignalingError::ParticipantNotFound(user_id.to_string())));
            return;
        };

        if let Some(existing) = participant.live_transport(direction) {
            let _ = respond_to.send(Ok(existing.info()));
            return;
        }

        let key = (user_id.clone(), direction);
        if let Some(waiters) = self.pending_transports.get_mut(&key) {
            waiters.push(respond_to);
            return;
        }
        self.pending_transports.insert(key, vec![respond_to]);

        let router = Arc::clone(&self.router);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = router.create_transport(direction).await;
            report(
                &completions,
                Completion::TransportReady {
                    user_id,
                    direction,
                    result,
                },
            );
        });
    }

    fn connect_transport(
        &self,
        user_id: &UserId,
        transport_id: &str,
        dtls_parameters: Value,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    ) {
        let transport = match self.participants.get(user_id) {
            None => Err(SignalingError::ParticipantNotFound(user_id.to_string())),
            Some(p) => p
                .owned_transport(transport_id)
                .cloned()
                .ok_or_else(|| SignalingError::TransportNotFound(transport_id.to_string())),
        };
        let transport = match transport {
            Ok(t) => t,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        // A failed handshake closes the transport; its watcher reports that.
        tokio::spawn(async move {
            let result = transport.connect(dtls_parameters).await;
            let _ = respond_to.send(result.map_err(SignalingError::from));
        });
    }

    fn produce(
        &self,
        user_id: UserId,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
        respond_to: oneshot::Sender<Result<ProducerSummary, SignalingError>>,
    ) {
        let Some(participant) = self.participants.get(&user_id) else {
            let _ = respond_to.send(Err(SignalingError::ParticipantNotFound(user_id.to_string())));
            return;
        };
        let Some(transport) = participant.live_transport(TransportDirection::Send).cloned() else {
            let _ = respond_to.send(Err(SignalingError::TransportMissing(TransportDirection::Send)));
            return;
        };

        let app_data = producer_app_data(app_data, &user_id);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = transport
                .produce(kind, rtp_parameters, app_data.clone())
                .await;
            report(
                &completions,
                Completion::ProducerReady {
                    user_id,
                    transport_id: transport.info().id,
                    kind,
                    app_data,
                    result,
                    respond_to,
                },
            );
        });
    }

    fn consume(
        &self,
        user_id: UserId,
        producer_id: ProducerId,
        rtp_capabilities: Value,
        respond_to: oneshot::Sender<Result<Option<ConsumerInfo>, SignalingError>>,
    ) {
        let Some(participant) = self.participants.get(&user_id) else {
            let _ = respond_to.send(Err(SignalingError::ParticipantNotFound(user_id.to_string())));
            return;
        };
        let Some(transport) = participant.live_transport(TransportDirection::Recv).cloned() else {
            let _ = respond_to.send(Err(SignalingError::TransportMissing(TransportDirection::Recv)));
            return;
        };
        if !self.producer_exists(&producer_id) {
            let _ = respond_to.send(Err(SignalingError::ProducerNotFound(producer_id)));
            return;
        }
        if !self.router.can_consume(&producer_id, &rtp_capabilities) {
            debug!(
                target: "signaling.room",
                meeting_id = %self.meeting_id,
                user_id = %user_id,
                producer_id = %producer_id,
                "Receiver cannot consume producer"
            );
            let _ = respond_to.send(Ok(None));
            return;
        }

        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = transport.consume(&producer_id, &rtp_capabilities).await;
            report(
                &completions,
                Completion::ConsumerReady {
                    user_id,
                    transport_id: transport.info().id,
                    producer_id,
                    result,
                    respond_to,
                },
            );
        });
    }

    fn resume_consumer(
        &self,
        user_id: &UserId,
        consumer_id: &str,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    ) {
        let consumer = match self.participants.get(user_id) {
            None => Err(SignalingError::ParticipantNotFound(user_id.to_string())),
            Some(p) => p
                .consumer(consumer_id)
                .cloned()
                .ok_or_else(|| SignalingError::ConsumerNotFound(consumer_id.to_string())),
        };
        match consumer {
            Ok(consumer) => {
                tokio::spawn(async move {
                    let result = consumer.resume().await;
                    let _ = respond_to.send(result.map_err(SignalingError::from));
                });
            }
            Err(e) => {
                let _ = respond_to.send(Err(e));
            }
        }
    }

    fn set_producer_paused(
        &self,
        user_id: &UserId,
        producer_id: &str,
        paused: bool,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    ) {
        let producer = match self.participants.get(user_id) {
            None => Err(SignalingError::ParticipantNotFound(user_id.to_string())),
            Some(p) => p
                .producer(producer_id)
                .map(|entry| Arc::clone(&entry.producer))
                .ok_or_else(|| SignalingError::ProducerNotFound(producer_id.to_string())),
        };
        match producer {
            Ok(producer) => {
                tokio::spawn(async move {
                    let result = if paused {
                        producer.pause().await
                    } else {
                        producer.resume().await
                    };
                    let _ = respond_to.send(result.map_err(SignalingError::from));
                });
            }
            Err(e) => {
                let _ = respond_to.send(Err(e));
            }
        }
    }

    fn close_producer(&mut self, user_id: &UserId, producer_id: &str) -> Result<(), SignalingError> {
        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or_else(|| SignalingError::ParticipantNotFound(user_id.to_string()))?;
        if !participant.close_producer(producer_id) {
            return Err(SignalingError::ProducerNotFound(producer_id.to_string()));
        }

        let closed = vec![producer_id.to_string()];
        self.close_consumers_of(&closed);
        self.publish(RoomEvent::ProducersClosed {
            owner: user_id.clone(),
            producer_ids: closed,
        });
        Ok(())
    }

    fn remove_participant(&mut self, user_id: &UserId) -> bool {
        let Some(participant) = self.participants.remove(user_id) else {
            return false;
        };
        self.pending_transports.retain(|(owner, _), _| owner != user_id);

        let closed = participant.teardown();
        let consumers_closed = self.close_consumers_of(&closed);
        if self.participants.is_empty() {
            self.empty_since = Some(Instant::now());
        }

        info!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            user_id = %user_id,
            producers_closed = closed.len(),
            consumers_closed,
            remaining = self.participants.len(),
            "Participant removed from room"
        );
        true
    }

    fn existing_producers(&self, excluding: Option<&UserId>) -> Vec<ProducerSummary> {
        let mut producers: Vec<(u64, ProducerSummary)> = self
            .participants
            .values()
            .filter(|p| Some(&p.user_id) != excluding)
            .flat_map(ParticipantState::producer_summaries)
            .collect();
        producers.sort_by_key(|(seq, _)| *seq);
        producers.into_iter().map(|(_, summary)| summary).collect()
    }

    fn sample_stats(&self) -> Vec<StatsSample> {
        self.participants
            .values()
            .filter_map(|p| {
                p.representative_producer().map(|producer| StatsSample {
                    user_id: p.user_id.clone(),
                    producer,
                })
            })
            .collect()
    }

    fn state(&self) -> RoomState {
        let mut participants: Vec<_> = self
            .participants
            .values()
            .map(ParticipantState::snapshot)
            .collect();
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        RoomState {
            meeting_id: self.meeting_id.clone(),
            room_id: self.room_id,
            worker_id: self.worker.id().to_string(),
            participants,
        }
    }

    fn producer_exists(&self, producer_id: &str) -> bool {
        self.participants
            .values()
            .any(|p| p.producer(producer_id).is_some())
    }

    /// Close every consumer, across all participants, of the given producers.
    fn close_consumers_of(&mut self, producer_ids: &[ProducerId]) -> usize {
        let mut closed = 0;
        for participant in self.participants.values_mut() {
            for producer_id in producer_ids {
                closed += participant.close_consumers_of(producer_id);
            }
        }
        closed
    }

    fn publish(&self, event: RoomEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::TransportReady {
                user_id,
                direction,
                result,
            } => self.apply_transport(user_id, direction, result),

            Completion::ProducerReady {
                user_id,
                transport_id,
                kind,
                app_data,
                result,
                respond_to,
            } => {
                let reply = self.apply_producer(&user_id, &transport_id, kind, app_data, result);
                let _ = respond_to.send(reply);
            }

            Completion::ConsumerReady {
                user_id,
                transport_id,
                producer_id,
                result,
                respond_to,
            } => {
                let reply = self.apply_consumer(&user_id, &transport_id, &producer_id, result);
                let _ = respond_to.send(reply);
            }

            Completion::TransportClosed {
                user_id,
                transport_id,
            } => self.apply_transport_closed(&user_id, &transport_id),
        }
    }

    fn apply_transport(
        &mut self,
        user_id: UserId,
        direction: TransportDirection,
        result: Result<Arc<dyn MediaTransport>, MediaError>,
    ) {
        let waiters = self
            .pending_transports
            .remove(&(user_id.clone(), direction))
            .unwrap_or_default();

        let transport = match result {
            Ok(transport) => transport,
            Err(e) => {
                warn!(
                    target: "signaling.room",
                    meeting_id = %self.meeting_id,
                    user_id = %user_id,
                    direction = direction.as_str(),
                    error = %e,
                    "Transport creation failed"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(SignalingError::Media(e.clone())));
                }
                return;
            }
        };

        let Some(participant) = self.participants.get_mut(&user_id) else {
            // Left while the transport was being created.
            transport.close();
            for waiter in waiters {
                let _ = waiter.send(Err(SignalingError::ParticipantNotFound(user_id.to_string())));
            }
            return;
        };

        if let Some(stale) = participant.transport(direction).cloned() {
            stale.close();
            let dropped = participant
                .drop_transport(&stale.info().id)
                .unwrap_or_default();
            self.close_consumers_of(&dropped);
            if !dropped.is_empty() {
                self.publish(RoomEvent::ProducersClosed {
                    owner: user_id.clone(),
                    producer_ids: dropped,
                });
            }
        }

        let info = transport.info();
        let closed = transport.closed();
        if let Some(participant) = self.participants.get_mut(&user_id) {
            participant.set_transport(direction, transport);
        }

        let completions = self.completions_tx.clone();
        let watched_user = user_id.clone();
        let watched_id = info.id.clone();
        tokio::spawn(async move {
            closed.cancelled().await;
            let _ = completions.send(Completion::TransportClosed {
                user_id: watched_user,
                transport_id: watched_id,
            });
        });

        debug!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            user_id = %user_id,
            transport_id = %info.id,
            direction = direction.as_str(),
            "Transport created"
        );
        for waiter in waiters {
            let _ = waiter.send(Ok(info.clone()));
        }
    }

    fn apply_producer(
        &mut self,
        user_id: &UserId,
        transport_id: &str,
        kind: MediaKind,
        app_data: Value,
        result: Result<Arc<dyn MediaProducer>, MediaError>,
    ) -> Result<ProducerSummary, SignalingError> {
        let producer = result?;

        let Some(participant) = self.participants.get_mut(user_id) else {
            producer.close();
            return Err(SignalingError::ParticipantNotFound(user_id.to_string()));
        };
        let still_bound = participant
            .live_transport(TransportDirection::Send)
            .is_some_and(|t| t.info().id == transport_id);
        if !still_bound {
            producer.close();
            return Err(SignalingError::TransportMissing(TransportDirection::Send));
        }

        self.next_producer_seq += 1;
        let summary = ProducerSummary {
            producer_id: producer.id().to_string(),
            peer_id: user_id.clone(),
            kind,
            app_data: app_data.clone(),
        };
        participant.add_producer(ProducerEntry {
            producer,
            kind,
            app_data,
            seq: self.next_producer_seq,
        });

        info!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            user_id = %user_id,
            producer_id = %summary.producer_id,
            kind = kind.as_str(),
            "Producer created"
        );
        self.publish(RoomEvent::ProducerAdded(summary.clone()));
        Ok(summary)
    }

    fn apply_consumer(
        &mut self,
        user_id: &UserId,
        transport_id: &str,
        producer_id: &str,
        result: Result<Arc<dyn MediaConsumer>, MediaError>,
    ) -> Result<Option<ConsumerInfo>, SignalingError> {
        let consumer = result?;

        if !self.producer_exists(producer_id) {
            consumer.close();
            return Err(SignalingError::ProducerNotFound(producer_id.to_string()));
        }
        let Some(participant) = self.participants.get_mut(user_id) else {
            consumer.close();
            return Err(SignalingError::ParticipantNotFound(user_id.to_string()));
        };
        let still_bound = participant
            .live_transport(TransportDirection::Recv)
            .is_some_and(|t| t.info().id == transport_id);
        if !still_bound {
            consumer.close();
            return Err(SignalingError::TransportMissing(TransportDirection::Recv));
        }

        let info = consumer.info();
        participant.add_consumer(consumer);
        debug!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            user_id = %user_id,
            consumer_id = %info.id,
            producer_id = %producer_id,
            "Consumer created"
        );
        Ok(Some(info))
    }

    fn apply_transport_closed(&mut self, user_id: &UserId, transport_id: &str) {
        let Some(participant) = self.participants.get_mut(user_id) else {
            return;
        };
        let Some(dropped) = participant.drop_transport(transport_id) else {
            return;
        };

        warn!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            user_id = %user_id,
            transport_id = %transport_id,
            producers_closed = dropped.len(),
            "Transport closed by the media engine"
        );
        if !dropped.is_empty() {
            self.close_consumers_of(&dropped);
            self.publish(RoomEvent::ProducersClosed {
                owner: user_id.clone(),
                producer_ids: dropped,
            });
        }
    }

    /// Tear down every participant and release the routing context.
    fn close_all(&mut self) {
        self.pending_transports.clear();
        for (_, participant) in self.participants.drain() {
            participant.teardown();
        }
        self.router.close();
    }

    fn fail(&mut self, reason: String) {
        error!(
            target: "signaling.room",
            meeting_id = %self.meeting_id,
            room_id = self.room_id,
            worker_id = %self.worker.id(),
            participants = self.participants.len(),
            reason = %reason,
            "Room failed"
        );
        // Set before any reply channel drops so handles report the reason.
        let _ = self.failure.set(reason);
        metrics::record_room_failure();
        self.close_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::media::{InMemoryMediaEngine, MediaEngine};
    use serde_json::json;
    use tokio::time::timeout;

    struct TestRoom {
        engine: InMemoryMediaEngine,
        room: RoomHandle,
        exits: mpsc::UnboundedReceiver<RoomExit>,
        metrics: Arc<ActorMetrics>,
    }

    async fn spawn_room() -> TestRoom {
        let engine = InMemoryMediaEngine::new();
        let worker = engine.spawn_worker().await.unwrap();
        let router = worker.create_routing_context().await.unwrap();
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let metrics = ActorMetrics::new();
        let (room, _task) = RoomActor::spawn(RoomBinding {
            meeting_id: MeetingId::new("meeting-1"),
            room_id: 1,
            worker,
            router,
            cancel_token: CancellationToken::new(),
            metrics: Arc::clone(&metrics),
            exits: exits_tx,
        });
        TestRoom {
            engine,
            room,
            exits,
            metrics,
        }
    }

    fn full_caps() -> Value {
        json!({ "codecs": [{ "kind": "audio" }, { "kind": "video" }] })
    }

    fn audio_only_caps() -> Value {
        json!({ "codecs": [{ "kind": "audio" }] })
    }

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    /// Join `id` with both transports and connect them.
    async fn join_with_transports(room: &RoomHandle, id: &str) -> (TransportInfo, TransportInfo) {
        room.add_participant(user(id), ParticipantRole::Candidate)
            .await
            .unwrap();
        let send = room
            .create_transport(user(id), TransportDirection::Send)
            .await
            .unwrap();
        let recv = room
            .create_transport(user(id), TransportDirection::Recv)
            .await
            .unwrap();
        room.connect_transport(user(id), send.id.clone(), send.dtls_parameters.clone())
            .await
            .unwrap();
        room.connect_transport(user(id), recv.id.clone(), recv.dtls_parameters.clone())
            .await
            .unwrap();
        (send, recv)
    }

    async fn produce_video(room: &RoomHandle, id: &str) -> ProducerSummary {
        room.produce(user(id), MediaKind::Video, json!({}), json!({ "source": "camera" }))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_participant_is_idempotent() {
        let t = spawn_room().await;
        assert!(t
            .room
            .add_participant(user("alice"), ParticipantRole::Host)
            .await
            .unwrap());
        assert!(!t
            .room
            .add_participant(user("alice"), ParticipantRole::Host)
            .await
            .unwrap());
        assert_eq!(t.room.participant_count().await.unwrap(), 1);
        assert_eq!(t.metrics.room_count(), 1);
    }

    #[tokio::test]
    async fn test_create_transport_returns_existing() {
        let t = spawn_room().await;
        t.room
            .add_participant(user("alice"), ParticipantRole::Host)
            .await
            .unwrap();

        let first = t
            .room
            .create_transport(user("alice"), TransportDirection::Send)
            .await
            .unwrap();
        let second = t
            .room
            .create_transport(user("alice"), TransportDirection::Send)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let state = t.room.get_state().await.unwrap();
        let alice = state.participant(&user("alice")).unwrap();
        assert_eq!(alice.send_transport.as_deref(), Some(first.id.as_str()));
        assert!(alice.recv_transport.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_transport_requests_share_one_transport() {
        let t = spawn_room().await;
        t.engine.set_latency(Duration::from_millis(20));
        t.room
            .add_participant(user("alice"), ParticipantRole::Host)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            t.room.create_transport(user("alice"), TransportDirection::Recv),
            t.room.create_transport(user("alice"), TransportDirection::Recv),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
    }

    #[tokio::test]
    async fn test_unknown_participant_is_rejected() {
        let t = spawn_room().await;
        let err = t
            .room
            .create_transport(user("ghost"), TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ParticipantNotFound(_)));
    }

    #[tokio::test]
    async fn test_produce_requires_send_transport() {
        let t = spawn_room().await;
        t.room
            .add_participant(user("alice"), ParticipantRole::Host)
            .await
            .unwrap();

        let err = t
            .room
            .produce(user("alice"), MediaKind::Audio, json!({}), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalingError::TransportMissing(TransportDirection::Send)
        ));
    }

    #[tokio::test]
    async fn test_produce_tags_owner_and_announces() {
        let t = spawn_room().await;
        let mut events = t.room.subscribe();
        join_with_transports(&t.room, "alice").await;

        let summary = produce_video(&t.room, "alice").await;
        assert_eq!(summary.peer_id, user("alice"));
        assert_eq!(summary.app_data["source"], "camera");
        assert_eq!(summary.app_data["participantId"], "alice");

        match events.recv().await.unwrap() {
            RoomEvent::ProducerAdded(added) => assert_eq!(added, summary),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_existing_producers_in_creation_order() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        join_with_transports(&t.room, "bob").await;

        let a1 = produce_video(&t.room, "alice").await;
        let b1 = produce_video(&t.room, "bob").await;
        let a2 = t
            .room
            .produce(user("alice"), MediaKind::Audio, json!({}), json!({}))
            .await
            .unwrap();

        let all = t.room.existing_producers(None).await.unwrap();
        let ids: Vec<_> = all.iter().map(|p| p.producer_id.clone()).collect();
        assert_eq!(ids, [a1.producer_id.clone(), b1.producer_id.clone(), a2.producer_id]);

        let for_bob = t.room.existing_producers(Some(user("bob"))).await.unwrap();
        assert!(for_bob.iter().all(|p| p.peer_id == user("alice")));
        assert_eq!(for_bob.len(), 2);
    }

    #[tokio::test]
    async fn test_consume_requires_recv_transport() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        let producer = produce_video(&t.room, "alice").await;

        t.room
            .add_participant(user("bob"), ParticipantRole::Candidate)
            .await
            .unwrap();
        let err = t
            .room
            .consume(user("bob"), producer.producer_id, full_caps())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalingError::TransportMissing(TransportDirection::Recv)
        ));
    }

    #[tokio::test]
    async fn test_consume_with_incompatible_capabilities_returns_none() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        join_with_transports(&t.room, "bob").await;
        let producer = produce_video(&t.room, "alice").await;

        let result = t
            .room
            .consume(user("bob"), producer.producer_id, audio_only_caps())
            .await
            .unwrap();
        assert!(result.is_none());

        let state = t.room.get_state().await.unwrap();
        assert!(state.participant(&user("bob")).unwrap().consumers.is_empty());
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_is_not_found() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "bob").await;
        let err = t
            .room
            .consume(user("bob"), "nope".to_string(), full_caps())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ProducerNotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_and_resume() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        join_with_transports(&t.room, "bob").await;
        let producer = produce_video(&t.room, "alice").await;

        let consumer = t
            .room
            .consume(user("bob"), producer.producer_id.clone(), full_caps())
            .await
            .unwrap()
            .expect("compatible consumer");
        assert_eq!(consumer.producer_id, producer.producer_id);
        assert_eq!(consumer.kind, MediaKind::Video);

        t.room
            .resume_consumer(user("bob"), consumer.id.clone())
            .await
            .unwrap();

        // Only the owner can resume its consumer.
        let err = t
            .room
            .resume_consumer(user("alice"), consumer.id)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ConsumerNotFound(_)));
    }

    #[tokio::test]
    async fn test_pause_and_resume_producer_requires_ownership() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        join_with_transports(&t.room, "bob").await;
        let producer = produce_video(&t.room, "alice").await;

        t.room
            .pause_producer(user("alice"), producer.producer_id.clone())
            .await
            .unwrap();
        t.room
            .resume_producer(user("alice"), producer.producer_id.clone())
            .await
            .unwrap();

        let err = t
            .room
            .pause_producer(user("bob"), producer.producer_id)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ProducerNotFound(_)));
    }

    #[tokio::test]
    async fn test_close_producer_cascades_to_consumers() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        join_with_transports(&t.room, "bob").await;
        let producer = produce_video(&t.room, "alice").await;
        t.room
            .consume(user("bob"), producer.producer_id.clone(), full_caps())
            .await
            .unwrap()
            .unwrap();

        let mut events = t.room.subscribe();
        t.room
            .close_producer(user("alice"), producer.producer_id.clone())
            .await
            .unwrap();

        let state = t.room.get_state().await.unwrap();
        assert!(state.participant(&user("alice")).unwrap().producers.is_empty());
        assert!(state.participant(&user("bob")).unwrap().consumers.is_empty());

        match events.recv().await.unwrap() {
            RoomEvent::ProducersClosed {
                owner,
                producer_ids,
            } => {
                assert_eq!(owner, user("alice"));
                assert_eq!(producer_ids, [producer.producer_id]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remove_participant_closes_remote_consumers() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        join_with_transports(&t.room, "bob").await;
        let producer = produce_video(&t.room, "alice").await;
        t.room
            .consume(user("bob"), producer.producer_id, full_caps())
            .await
            .unwrap()
            .unwrap();

        assert!(t.room.remove_participant(user("alice")).await.unwrap());
        assert!(!t.room.remove_participant(user("alice")).await.unwrap());

        let state = t.room.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 1);
        assert!(state.participant(&user("bob")).unwrap().consumers.is_empty());
        assert!(t.room.existing_producers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_closed_transport_drops_its_producers() {
        let t = spawn_room().await;
        let (send, _) = join_with_transports(&t.room, "alice").await;
        join_with_transports(&t.room, "bob").await;
        let producer = produce_video(&t.room, "alice").await;
        t.room
            .consume(user("bob"), producer.producer_id.clone(), full_caps())
            .await
            .unwrap()
            .unwrap();

        let mut events = t.room.subscribe();
        assert!(t.engine.close_transport(&send.id));

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("closed event")
            .unwrap();
        match event {
            RoomEvent::ProducersClosed { producer_ids, .. } => {
                assert_eq!(producer_ids, [producer.producer_id.clone()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let state = t.room.get_state().await.unwrap();
        let alice = state.participant(&user("alice")).unwrap();
        assert!(alice.send_transport.is_none());
        assert!(alice.producers.is_empty());
        assert!(state.participant(&user("bob")).unwrap().consumers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_handshake_allows_new_transport() {
        let t = spawn_room().await;
        t.room
            .add_participant(user("alice"), ParticipantRole::Host)
            .await
            .unwrap();
        let send = t
            .room
            .create_transport(user("alice"), TransportDirection::Send)
            .await
            .unwrap();

        let err = t
            .room
            .connect_transport(user("alice"), send.id.clone(), json!("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalingError::Media(MediaError::HandshakeFailed(_))
        ));

        let replacement = t
            .room
            .create_transport(user("alice"), TransportDirection::Send)
            .await
            .unwrap();
        assert_ne!(replacement.id, send.id);
    }

    #[tokio::test]
    async fn test_connect_rejects_foreign_transport() {
        let t = spawn_room().await;
        let (send, _) = join_with_transports(&t.room, "alice").await;
        t.room
            .add_participant(user("bob"), ParticipantRole::Candidate)
            .await
            .unwrap();

        let err = t
            .room
            .connect_transport(user("bob"), send.id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn test_sample_stats_picks_one_producer_per_participant() {
        let t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        join_with_transports(&t.room, "bob").await;
        let first = produce_video(&t.room, "alice").await;
        t.room
            .produce(user("alice"), MediaKind::Audio, json!({}), json!({}))
            .await
            .unwrap();

        let samples = t.room.sample_stats().await.unwrap();
        assert_eq!(samples.len(), 1, "bob has no producers");
        let sample = samples.first().unwrap();
        assert_eq!(sample.user_id, user("alice"));
        assert_eq!(sample.producer.id(), first.producer_id);
    }

    #[tokio::test]
    async fn test_worker_death_terminates_room() {
        let mut t = spawn_room().await;
        join_with_transports(&t.room, "alice").await;
        let worker_id = t.room.worker_id().to_string();

        assert!(t.engine.kill_worker(&worker_id));
        timeout(Duration::from_secs(1), t.room.terminated().cancelled())
            .await
            .expect("room terminated");

        let reason = t.room.failure_reason().unwrap();
        assert!(reason.contains("died"), "{reason}");

        let err = t
            .room
            .add_participant(user("bob"), ParticipantRole::Candidate)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::RoomTerminated(_)));

        let exit = t.exits.recv().await.unwrap();
        assert_eq!(exit.room_id, 1);
        assert_eq!(t.metrics.room_count(), 0);
    }

    #[tokio::test]
    async fn test_close_if_empty_only_closes_empty_rooms() {
        let mut t = spawn_room().await;
        t.room
            .add_participant(user("alice"), ParticipantRole::Host)
            .await
            .unwrap();
        assert!(!t.room.close_if_empty(Duration::ZERO).await);

        t.room.remove_participant(user("alice")).await.unwrap();
        assert!(t.room.close_if_empty(Duration::ZERO).await);
        assert!(t.room.is_terminated());
        assert!(t.room.failure_reason().is_none());
        assert_eq!(t.exits.recv().await.unwrap().meeting_id, MeetingId::new("meeting-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_if_empty_respects_grace() {
        let t = spawn_room().await;
        assert!(!t.room.close_if_empty(Duration::from_secs(30)).await);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(t.room.close_if_empty(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let t = spawn_room().await;
        let (send, _) = join_with_transports(&t.room, "alice").await;
        t.room.close().await;

        assert!(t.room.is_terminated());
        assert!(!t.engine.close_transport(&send.id), "already closed");
        assert!(matches!(
            t.room.participant_count().await,
            Err(SignalingError::RoomTerminated(_))
        ));
    }
}
