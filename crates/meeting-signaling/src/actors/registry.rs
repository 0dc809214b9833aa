//! `RoomRegistryActor` - singleton owner of the meeting → room map.
//!
//! - At most one live room per meeting ID: concurrent first joins for the
//!   same meeting queue behind a single creation
//! - Binds each new room to a worker picked by the [`WorkerPool`]
//! - Forgets rooms that stop (closed, emptied or failed) and sweeps empty
//!   rooms on a fixed interval
//!
//! Routing-context creation is an engine call, so it runs in a spawned task
//! and comes back as a completion; the registry keeps serving lookups for
//! other meetings meanwhile.

use crate::errors::SignalingError;
use crate::media::{MediaError, MediaWorker, RoutingContext};
use crate::worker_pool::{WorkerDeath, WorkerPool};

use super::messages::RegistryMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomBinding, RoomExit, RoomHandle};

use common::types::MeetingId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown waits for room actors to finish.
const ROOM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type RoomWaiters = Vec<oneshot::Sender<Result<RoomHandle, SignalingError>>>;

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl std::fmt::Debug for RoomRegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistryHandle")
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RoomRegistryHandle {
    /// Spawn the registry and return a handle to it.
    ///
    /// Empty rooms are swept every `sweep_interval`; a room must have been
    /// empty for a whole interval before the sweep closes it.
    #[must_use]
    pub fn new(
        pool: Arc<WorkerPool>,
        sweep_interval: Duration,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Registry, "room-registry"));

        let actor = RoomRegistryActor::new(
            pool,
            receiver,
            cancel_token.clone(),
            sweep_interval,
            metrics,
            Arc::clone(&mailbox),
        );
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
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

    /// The meeting's room, created (on a pool worker) if absent.
    pub async fn get_or_create_room(&self, meeting_id: MeetingId) -> Result<RoomHandle, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetOrCreateRoom {
            meeting_id,
            respond_to,
        })
        .await?
    }

    /// The meeting's live room, if any.
    pub async fn get_room(&self, meeting_id: MeetingId) -> Result<Option<RoomHandle>, SignalingError> {
        self.request(|respond_to| RegistryMessage::GetRoom {
            meeting_id,
            respond_to,
        })
        .await
    }

    /// Snapshot of every live room. Rooms may stop right after.
    pub async fn list_rooms(&self) -> Result<Vec<RoomHandle>, SignalingError> {
        self.request(|respond_to| RegistryMessage::ListRooms { respond_to })
            .await
    }

    /// Close the meeting's room if it has no participants.
    ///
    /// Returns `true` if no live room remains for the meeting.
    pub async fn remove_if_empty(&self, meeting_id: MeetingId) -> Result<bool, SignalingError> {
        match self.get_room(meeting_id).await? {
            Some(room) => Ok(room.close_if_empty(Duration::ZERO).await),
            None => Ok(true),
        }
    }

    /// Close every room and stop the registry.
    pub async fn shutdown(&self) -> Result<(), SignalingError> {
        let result = self
            .request(|respond_to| RegistryMessage::Shutdown { respond_to })
            .await;
        self.cancel_token.cancel();
        result
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A routing context finished (or failed) being created.
struct RoomReady {
    meeting_id: MeetingId,
    worker: Arc<dyn MediaWorker>,
    result: Result<Arc<dyn RoutingContext>, MediaError>,
}

struct ManagedRoom {
    handle: RoomHandle,
    task_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    pool: Arc<WorkerPool>,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<MeetingId, ManagedRoom>,
    /// Callers waiting on a room that is being created.
    pending: HashMap<MeetingId, RoomWaiters>,
    ready_tx: mpsc::UnboundedSender<RoomReady>,
    ready_rx: mpsc::UnboundedReceiver<RoomReady>,
    exits_tx: mpsc::UnboundedSender<RoomExit>,
    exits_rx: mpsc::UnboundedReceiver<RoomExit>,
    deaths: broadcast::Receiver<WorkerDeath>,
    next_room_id: u64,
    sweep_interval: Duration,
    accepting_new: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomRegistryActor {
    fn new(
        pool: Arc<WorkerPool>,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
        sweep_interval: Duration,
        metrics: Arc<ActorMetrics>,
        mailbox: Arc<MailboxMonitor>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let deaths = pool.subscribe();

        Self {
            pool,
            receiver,
            cancel_token,
            rooms: HashMap::new(),
            pending: HashMap::new(),
            ready_tx,
            ready_rx,
            exits_tx,
            exits_rx,
            deaths,
            next_room_id: 0,
            sweep_interval,
            accepting_new: true,
            metrics,
            mailbox,
        }
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "signaling.actor.registry")]
    async fn run(mut self) {
        info!(target: "signaling.registry", "RoomRegistryActor started");

        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + self.sweep_interval,
            self.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "signaling.registry", "RoomRegistryActor received cancellation signal");
                    self.close_all_rooms().await;
                    break;
                }

                Some(exit) = self.exits_rx.recv() => {
                    self.handle_room_exit(&exit);
                }

                Some(ready) = self.ready_rx.recv() => {
                    self.handle_room_ready(ready);
                }

                Ok(death) = self.deaths.recv() => {
                    self.handle_worker_death(&death);
                }

                _ = sweep.tick() => {
                    self.sweep_empty_rooms();
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
                        None => {
                            info!(target: "signaling.registry", "RoomRegistryActor channel closed");
                            self.close_all_rooms().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "signaling.registry",
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Returns `true` when the actor should stop.
    async fn handle_message(&mut self, message: RegistryMessage) -> bool {
        match message {
            RegistryMessage::GetOrCreateRoom {
                meeting_id,
                respond_to,
            } => self.get_or_create_room(meeting_id, respond_to),

            RegistryMessage::GetRoom {
                meeting_id,
                respond_to,
            } => {
                let room = self
                    .rooms
                    .get(&meeting_id)
                    .filter(|r| !r.handle.is_terminated())
                    .map(|r| r.handle.clone());
                let _ = respond_to.send(room);
            }

            RegistryMessage::ListRooms { respond_to } => {
                let rooms = self
                    .rooms
                    .values()
                    .filter(|r| !r.handle.is_terminated())
                    .map(|r| r.handle.clone())
                    .collect();
                let _ = respond_to.send(rooms);
            }

            RegistryMessage::Shutdown { respond_to } => {
                info!(
                    target: "signaling.registry",
                    rooms = self.rooms.len(),
                    "Registry shutting down"
                );
                self.close_all_rooms().await;
                let _ = respond_to.send(());
                return true;
            }
        }

        false
    }

    fn get_or_create_room(
        &mut self,
        meeting_id: MeetingId,
        respond_to: oneshot::Sender<Result<RoomHandle, SignalingError>>,
    ) {
        if !self.accepting_new {
            let _ = respond_to.send(Err(SignalingError::ShuttingDown));
            return;
        }

        if let Some(existing) = self.rooms.get(&meeting_id) {
            if !existing.handle.is_terminated() {
                let _ = respond_to.send(Ok(existing.handle.clone()));
                return;
            }
            // Stopped but its exit not yet processed.
            self.rooms.remove(&meeting_id);
        }

        if let Some(waiters) = self.pending.get_mut(&meeting_id) {
            waiters.push(respond_to);
            return;
        }

        let worker = match self.pool.acquire_worker() {
            Ok(worker) => worker,
            Err(e) => {
                warn!(
                    target: "signaling.registry",
                    meeting_id = %meeting_id,
                    error = %e,
                    "Cannot create room"
                );
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        debug!(
            target: "signaling.registry",
            meeting_id = %meeting_id,
            worker_id = %worker.id(),
            "Creating room"
        );
        self.pending.insert(meeting_id.clone(), vec![respond_to]);

        let ready_tx = self.ready_tx.clone();
        tokio::spawn(async move {
            let result = worker.create_routing_context().await;
            let ready = RoomReady {
                meeting_id,
                worker,
                result,
            };
            if let Err(mpsc::error::SendError(ready)) = ready_tx.send(ready) {
                if let Ok(router) = ready.result {
                    router.close();
                }
            }
        });
    }

    fn handle_room_ready(&mut self, ready: RoomReady) {
        let waiters = self.pending.remove(&ready.meeting_id).unwrap_or_default();

        let router = match ready.result {
            Ok(router) => router,
            Err(e) => {
                error!(
                    target: "signaling.registry",
                    meeting_id = %ready.meeting_id,
                    worker_id = %ready.worker.id(),
                    error = %e,
                    "Routing context creation failed"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(SignalingError::Media(e.clone())));
                }
                return;
            }
        };

        if !self.accepting_new {
            router.close();
            for waiter in waiters {
                let _ = waiter.send(Err(SignalingError::ShuttingDown));
            }
            return;
        }

        self.next_room_id += 1;
        let cancel_token = self.cancel_token.child_token();
        let (handle, task_handle) = RoomActor::spawn(RoomBinding {
            meeting_id: ready.meeting_id.clone(),
            room_id: self.next_room_id,
            worker: ready.worker,
            router,
            cancel_token: cancel_token.clone(),
            metrics: Arc::clone(&self.metrics),
            exits: self.exits_tx.clone(),
        });

        info!(
            target: "signaling.registry",
            meeting_id = %ready.meeting_id,
            room_id = handle.room_id(),
            worker_id = %handle.worker_id(),
            waiters = waiters.len(),
            "Room created"
        );

        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }
        self.rooms.insert(
            ready.meeting_id,
            ManagedRoom {
                handle,
                task_handle,
                cancel_token,
            },
        );
    }

    fn handle_room_exit(&mut self, exit: &RoomExit) {
        let current = self
            .rooms
            .get(&exit.meeting_id)
            .is_some_and(|r| r.handle.room_id() == exit.room_id);
        if !current {
            return;
        }

        if let Some(room) = self.rooms.remove(&exit.meeting_id) {
            match room.handle.failure_reason() {
                Some(reason) => warn!(
                    target: "signaling.registry",
                    meeting_id = %exit.meeting_id,
                    room_id = exit.room_id,
                    reason = %reason,
                    "Failed room removed"
                ),
                None => debug!(
                    target: "signaling.registry",
                    meeting_id = %exit.meeting_id,
                    room_id = exit.room_id,
                    "Room removed"
                ),
            }
        }
    }

    /// Drop rooms bound to a dead worker; the rooms fail themselves.
    fn handle_worker_death(&mut self, death: &WorkerDeath) {
        let before = self.rooms.len();
        self.rooms
            .retain(|_, room| room.handle.worker_id() != death.worker_id);
        let dropped = before - self.rooms.len();
        if dropped > 0 {
            warn!(
                target: "signaling.registry",
                worker_id = %death.worker_id,
                rooms = dropped,
                "Rooms lost with their worker"
            );
        }
    }

    fn sweep_empty_rooms(&self) {
        let grace = self.sweep_interval;
        for room in self.rooms.values() {
            let handle = room.handle.clone();
            tokio::spawn(async move {
                if handle.close_if_empty(grace).await {
                    debug!(
                        target: "signaling.registry",
                        meeting_id = %handle.meeting_id(),
                        "Swept empty room"
                    );
                }
            });
        }
    }

    async fn close_all_rooms(&mut self) {
        self.accepting_new = false;
        for (_, waiters) in self.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SignalingError::ShuttingDown));
            }
        }

        let rooms: Vec<ManagedRoom> = self.rooms.drain().map(|(_, room)| room).collect();
        for room in &rooms {
            room.cancel_token.cancel();
        }
        let tasks = rooms.into_iter().map(|room| room.task_handle);
        if tokio::time::timeout(ROOM_SHUTDOWN_TIMEOUT, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                target: "signaling.registry",
                "Timed out waiting for rooms to close"
            );
        }
    }
}
