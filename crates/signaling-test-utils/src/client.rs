//! Scripted signaling client.
//!
//! Drives a real `SignalingSession` over channels. Replies are matched to
//! requests by `request_id`; events that arrive while waiting for a reply are
//! kept and handed out by [`TestClient::expect_event`].

use crate::fixtures::{self, TestMeeting, TestParticipant};
use common::types::{MediaKind, TransportDirection};
use futures::channel::mpsc as stream_mpsc;
use meeting_signaling::signaling::{
    ClientEnvelope, ClientMessage, ServerEnvelope, ServerMessage, SignalingContext,
    SignalingSession,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a test waits for an expected frame.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

const OUTBOUND_BUFFER: usize = 256;

/// One client connection.
pub struct TestClient {
    connection_id: String,
    frames: Option<stream_mpsc::UnboundedSender<String>>,
    outbound: mpsc::Receiver<ServerEnvelope>,
    events: VecDeque<ServerMessage>,
    next_request_id: u64,
    task: Option<JoinHandle<()>>,
}

impl TestClient {
    /// Start a session for `connection_id`.
    #[must_use]
    pub fn spawn(connection_id: String, context: SignalingContext) -> Self {
        let (frames, inbound) = stream_mpsc::unbounded();
        let (outbound_tx, outbound) = mpsc::channel(OUTBOUND_BUFFER);
        let session = SignalingSession::new(connection_id.clone(), context, outbound_tx);
        let task = tokio::spawn(session.run(inbound));

        Self {
            connection_id,
            frames: Some(frames),
            outbound,
            events: VecDeque::new(),
            next_request_id: 1,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Send a raw text frame.
    ///
    /// # Panics
    ///
    /// Panics if the client already disconnected.
    pub fn send_raw(&self, text: &str) {
        self.frames
            .as_ref()
            .expect("client is disconnected")
            .unbounded_send(text.to_string())
            .expect("session should be running");
    }

    /// Send `message` with a fresh request ID and return the ID.
    pub fn send(&mut self, message: ClientMessage) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let envelope = ClientEnvelope {
            request_id: Some(request_id),
            message,
        };
        self.send_raw(&serde_json::to_string(&envelope).expect("client frame encodes"));
        request_id
    }

    /// Send `message` and wait for its reply.
    ///
    /// # Panics
    ///
    /// Panics if no reply arrives within [`FRAME_TIMEOUT`].
    pub async fn request(&mut self, message: ClientMessage) -> ServerMessage {
        let label = message.label();
        let request_id = self.send(message);
        let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;

        loop {
            let envelope = self
                .next_frame(deadline)
                .await
                .unwrap_or_else(|| panic!("no reply to {label} (request {request_id})"));
            match envelope.request_id {
                Some(id) if id == request_id => return envelope.message,
                Some(_) => {}
                None => self.events.push_back(envelope.message),
            }
        }
    }

    /// Send `join-room` for `participant`.
    pub async fn join(&mut self, meeting: &TestMeeting, participant: &TestParticipant) -> ServerMessage {
        self.request(participant.join_message(meeting)).await
    }

    /// Wait for the first event matching `predicate`, skipping (and keeping)
    /// the ones that do not.
    ///
    /// # Panics
    ///
    /// Panics if no matching event arrives within [`FRAME_TIMEOUT`].
    pub async fn expect_event(
        &mut self,
        what: &str,
        predicate: impl Fn(&ServerMessage) -> bool,
    ) -> ServerMessage {
        if let Some(pos) = self.events.iter().position(&predicate) {
            if let Some(event) = self.events.remove(pos) {
                return event;
            }
        }

        let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
        let mut skipped = Vec::new();
        let found = loop {
            match self.next_frame(deadline).await {
                Some(envelope) if envelope.request_id.is_none() => {
                    if predicate(&envelope.message) {
                        break Some(envelope.message);
                    }
                    skipped.push(envelope.message);
                }
                Some(_) => {}
                None => break None,
            }
        };
        self.events.extend(skipped);
        found.unwrap_or_else(|| panic!("expected {what}, buffered events: {:?}", self.events))
    }

    /// Assert that no event matching `predicate` arrives within `window`.
    ///
    /// # Panics
    ///
    /// Panics if one does.
    pub async fn expect_no_event(
        &mut self,
        what: &str,
        window: Duration,
        predicate: impl Fn(&ServerMessage) -> bool,
    ) {
        assert!(
            !self.events.iter().any(&predicate),
            "unexpected {what} in buffered events"
        );
        let deadline = tokio::time::Instant::now() + window;
        while let Some(envelope) = self.next_frame(deadline).await {
            assert!(!predicate(&envelope.message), "unexpected {what}: {envelope:?}");
            if envelope.request_id.is_none() {
                self.events.push_back(envelope.message);
            }
        }
    }

    /// Every event received so far, oldest first.
    pub fn drain_events(&mut self) -> Vec<ServerMessage> {
        while let Ok(envelope) = self.outbound.try_recv() {
            if envelope.request_id.is_none() {
                self.events.push_back(envelope.message);
            }
        }
        self.events.drain(..).collect()
    }

    /// Create and connect a send and a recv transport. Returns their IDs.
    ///
    /// # Panics
    ///
    /// Panics if any step is rejected.
    pub async fn setup_transports(&mut self) -> (String, String) {
        let mut ids = Vec::with_capacity(2);
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            let transport_id = match self.request(fixtures::create_transport(direction)).await {
                ServerMessage::TransportCreated { transport, .. } => transport.id,
                other => panic!("create-transport failed: {other:?}"),
            };
            match self.request(fixtures::connect_transport(&transport_id)).await {
                ServerMessage::TransportConnected { .. } => {}
                other => panic!("connect-transport failed: {other:?}"),
            }
            ids.push(transport_id);
        }
        let recv = ids.pop().expect("recv transport");
        let send = ids.pop().expect("send transport");
        (send, recv)
    }

    /// Produce a track of `kind` and return the producer ID.
    ///
    /// # Panics
    ///
    /// Panics if the produce request is rejected.
    pub async fn produce(&mut self, kind: MediaKind) -> String {
        match self.request(fixtures::produce(kind)).await {
            ServerMessage::Produced { producer_id } => producer_id,
            other => panic!("produce failed: {other:?}"),
        }
    }

    /// Close the connection and wait for the session to finish cleanup.
    pub async fn disconnect(mut self) {
        self.frames = None;
        if let Some(task) = self.task.take() {
            task.await.expect("session task should not panic");
        }
    }

    /// Whether the session has stopped sending (it ended or was shut down).
    pub async fn wait_closed(&mut self) -> bool {
        let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
        while let Some(envelope) = self.next_frame(deadline).await {
            if envelope.request_id.is_none() {
                self.events.push_back(envelope.message);
            }
        }
        self.outbound.is_closed() || self.task.as_ref().is_some_and(JoinHandle::is_finished)
    }

    async fn next_frame(&mut self, deadline: tokio::time::Instant) -> Option<ServerEnvelope> {
        tokio::time::timeout_at(deadline, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }
}
