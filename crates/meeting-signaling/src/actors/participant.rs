//! Per-participant media resources inside a room.
//!
//! Owned exclusively by the `RoomActor`. Closing always goes consumers,
//! then producers, then transports, so a consumer never points at a
//! half-closed producer.

use super::messages::{ParticipantSnapshot, ProducerSummary};
use crate::media::{ConsumerId, MediaConsumer, MediaProducer, MediaTransport, ProducerId};
use chrono::{DateTime, Utc};
use common::types::{MediaKind, ParticipantRole, TransportDirection, UserId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) struct ProducerEntry {
    pub(crate) producer: Arc<dyn MediaProducer>,
    pub(crate) kind: MediaKind,
    pub(crate) app_data: Value,
    /// Room-wide creation order.
    pub(crate) seq: u64,
}

pub(crate) struct ParticipantState {
    pub(crate) user_id: UserId,
    pub(crate) role: ParticipantRole,
    pub(crate) joined_at: DateTime<Utc>,
    send_transport: Option<Arc<dyn MediaTransport>>,
    recv_transport: Option<Arc<dyn MediaTransport>>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, Arc<dyn MediaConsumer>>,
}

impl ParticipantState {
    pub(crate) fn new(user_id: UserId, role: ParticipantRole) -> Self {
        Self {
            user_id,
            role,
            joined_at: Utc::now(),
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Rejoin: refresh the timestamp and role, keep resources.
    pub(crate) fn refresh(&mut self, role: ParticipantRole) {
        self.role = role;
        self.joined_at = Utc::now();
    }

    pub(crate) fn transport(&self, direction: TransportDirection) -> Option<&Arc<dyn MediaTransport>> {
        match direction {
            TransportDirection::Send => self.send_transport.as_ref(),
            TransportDirection::Recv => self.recv_transport.as_ref(),
        }
    }

    /// Live transport of `direction` (a closed one counts as absent).
    pub(crate) fn live_transport(
        &self,
        direction: TransportDirection,
    ) -> Option<&Arc<dyn MediaTransport>> {
        self.transport(direction)
            .filter(|t| !t.closed().is_cancelled())
    }

    pub(crate) fn set_transport(
        &mut self,
        direction: TransportDirection,
        transport: Arc<dyn MediaTransport>,
    ) {
        let slot = match direction {
            TransportDirection::Send => &mut self.send_transport,
            TransportDirection::Recv => &mut self.recv_transport,
        };
        *slot = Some(transport);
    }

    /// Transport with `transport_id`, if this participant owns it.
    pub(crate) fn owned_transport(&self, transport_id: &str) -> Option<&Arc<dyn MediaTransport>> {
        [self.send_transport.as_ref(), self.recv_transport.as_ref()]
            .into_iter()
            .flatten()
            .find(|t| t.info().id == transport_id)
    }

    pub(crate) fn add_producer(&mut self, entry: ProducerEntry) {
        self.producers
            .insert(entry.producer.id().to_string(), entry);
    }

    pub(crate) fn producer(&self, producer_id: &str) -> Option<&ProducerEntry> {
        self.producers.get(producer_id)
    }

    pub(crate) fn add_consumer(&mut self, consumer: Arc<dyn MediaConsumer>) {
        self.consumers.insert(consumer.id().to_string(), consumer);
    }

    pub(crate) fn consumer(&self, consumer_id: &str) -> Option<&Arc<dyn MediaConsumer>> {
        self.consumers.get(consumer_id)
    }

    /// Close and drop one of this participant's producers.
    pub(crate) fn close_producer(&mut self, producer_id: &str) -> bool {
        match self.producers.remove(producer_id) {
            Some(entry) => {
                entry.producer.close();
                true
            }
            None => false,
        }
    }

    /// Close every consumer of `producer_id`. Returns how many closed.
    pub(crate) fn close_consumers_of(&mut self, producer_id: &str) -> usize {
        let doomed: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            if let Some(consumer) = self.consumers.remove(id) {
                consumer.close();
            }
        }
        doomed.len()
    }

    /// Forget a transport that closed on its own, along with what rode on it.
    ///
    /// Returns the producers that were dropped so the room can cascade to
    /// their consumers. Returns `None` if the transport is not (or no longer)
    /// this participant's.
    pub(crate) fn drop_transport(&mut self, transport_id: &str) -> Option<Vec<ProducerId>> {
        if self
            .send_transport
            .as_ref()
            .is_some_and(|t| t.info().id == transport_id)
        {
            self.send_transport = None;
            let closed: Vec<ProducerId> = self.producers.keys().cloned().collect();
            for (_, entry) in self.producers.drain() {
                entry.producer.close();
            }
            return Some(closed);
        }

        if self
            .recv_transport
            .as_ref()
            .is_some_and(|t| t.info().id == transport_id)
        {
            self.recv_transport = None;
            for (_, consumer) in self.consumers.drain() {
                consumer.close();
            }
            return Some(Vec::new());
        }

        None
    }

    /// Close everything: consumers, then producers, then transports.
    ///
    /// Returns the IDs of the producers that were closed.
    pub(crate) fn teardown(mut self) -> Vec<ProducerId> {
        for (_, consumer) in self.consumers.drain() {
            consumer.close();
        }

        let mut closed = Vec::with_capacity(self.producers.len());
        for (id, entry) in self.producers.drain() {
            entry.producer.close();
            closed.push(id);
        }

        if let Some(transport) = self.send_transport.take() {
            transport.close();
        }
        if let Some(transport) = self.recv_transport.take() {
            transport.close();
        }
        closed
    }

    /// `(creation order, summary)` for every producer.
    pub(crate) fn producer_summaries(&self) -> impl Iterator<Item = (u64, ProducerSummary)> + '_ {
        self.producers.iter().map(|(id, entry)| {
            (
                entry.seq,
                ProducerSummary {
                    producer_id: id.clone(),
                    peer_id: self.user_id.clone(),
                    kind: entry.kind,
                    app_data: entry.app_data.clone(),
                },
            )
        })
    }

    /// The earliest-created live producer.
    pub(crate) fn representative_producer(&self) -> Option<Arc<dyn MediaProducer>> {
        self.producers
            .values()
            .min_by_key(|entry| entry.seq)
            .map(|entry| Arc::clone(&entry.producer))
    }

    pub(crate) fn snapshot(&self) -> ParticipantSnapshot {
        let mut producers: Vec<ProducerId> = self.producers.keys().cloned().collect();
        producers.sort();
        let mut consumers: Vec<(ConsumerId, ProducerId)> = self
            .consumers
            .iter()
            .map(|(id, c)| (id.clone(), c.producer_id().to_string()))
            .collect();
        consumers.sort();

        ParticipantSnapshot {
            user_id: self.user_id.clone(),
            role: self.role.clone(),
            joined_at: self.joined_at,
            send_transport: self.send_transport.as_ref().map(|t| t.info().id),
            recv_transport: self.recv_transport.as_ref().map(|t| t.info().id),
            producers,
            consumers,
        }
    }
}

/// Owner-tagged app metadata for a new producer.
pub(crate) fn producer_app_data(app_data: Value, user_id: &UserId) -> Value {
    let mut merged = match app_data {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    merged.insert("participantId".to_string(), Value::String(user_id.to_string()));
    merged.insert("userId".to_string(), Value::String(user_id.to_string()));
    Value::Object(merged)
}
